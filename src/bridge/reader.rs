//! Protocol reader task.
//!
//! Reads the agent's stdout and stderr as one merged, line-ordered stream,
//! classifies each line via [`classify_line`], and forwards typed
//! [`StreamEvent`]s through a tokio [`mpsc`] channel.
//!
//! The reader terminates on EOF of *both* streams whether or not a
//! `[MESSAGE_END]` tag was seen, or when the process handle's kill token
//! fires. It never fails: malformed tagged lines are logged and dropped, and
//! everything the caller needs for exit accounting is returned in a
//! [`ReadSummary`].

use std::collections::VecDeque;

use futures_util::stream::{self, Select, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::{classify_line, StreamEvent};

/// Number of untagged output lines retained for diagnostics.
pub const RAW_OUTPUT_LINES: usize = 200;

/// Accumulated facts about one process's output stream.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReadSummary {
    /// Last line starting with an error marker (`[UNCAUGHT_ERROR]`, …).
    pub last_error: Option<String>,
    /// Message of the first `[SEND_ERROR]` line, if any.
    pub send_error: Option<String>,
    /// Session identifier announced via `[SESSION_ID]`.
    pub session_id: Option<String>,
    /// Whether `[MESSAGE_END]` was observed.
    pub saw_message_end: bool,
    /// Number of lines that classified into an event.
    pub event_count: usize,
    /// Tail of untagged output, oldest first.
    pub raw_output: VecDeque<String>,
}

impl ReadSummary {
    /// Fold one classified event into the summary.
    fn record(&mut self, event: &StreamEvent) {
        self.event_count += 1;
        match event {
            StreamEvent::Diagnostic { line, .. } => {
                self.last_error = Some(line.clone());
            }
            StreamEvent::SendError(message) => {
                if self.send_error.is_none() {
                    self.send_error = Some(message.clone());
                }
            }
            StreamEvent::SessionId(id) if !id.is_empty() => {
                self.session_id = Some(id.clone());
            }
            StreamEvent::MessageEnd => self.saw_message_end = true,
            _ => {}
        }
    }

    fn push_raw(&mut self, line: String) {
        if self.raw_output.len() == RAW_OUTPUT_LINES {
            self.raw_output.pop_front();
        }
        self.raw_output.push_back(line);
    }

    /// Untagged output joined with newlines.
    #[must_use]
    pub fn raw_text(&self) -> String {
        self.raw_output
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Merged, line-framed view of a process's stdout and stderr.
pub type MergedLines<O, E> = Select<FramedRead<O, LineCodec>, FramedRead<E, LineCodec>>;

/// Frame both pipes into lines and interleave them in arrival order.
#[must_use]
pub fn merged_lines<O, E>(stdout: O, stderr: E) -> MergedLines<O, E>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    stream::select(
        FramedRead::new(stdout, LineCodec::new()),
        FramedRead::new(stderr, LineCodec::new()),
    )
}

/// Collect every output line until both pipes close.
///
/// Used by the one-shot operations that parse the complete output.
pub async fn collect_lines<O, E>(stdout: O, stderr: E) -> Vec<String>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut lines = merged_lines(stdout, stderr);
    let mut collected = Vec::new();
    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => collected.push(line),
            Err(err) => warn!(%err, "reader: I/O error while collecting output"),
        }
    }
    collected
}

/// Read `stdout` and `stderr` to completion, forwarding events to `event_tx`.
///
/// Lines from the two pipes are interleaved in arrival order; within one pipe
/// order is preserved. A closed `event_tx` does not stop the reader: output
/// keeps being drained so the child never blocks on a full pipe, and the
/// summary stays complete.
///
/// # Cancellation
///
/// Returns early, with whatever was read so far, when `cancel` fires.
pub async fn read_stream<O, E>(
    channel_id: &str,
    stdout: O,
    stderr: E,
    event_tx: &mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> ReadSummary
where
    O: AsyncRead + Unpin + Send,
    E: AsyncRead + Unpin + Send,
{
    let mut lines = merged_lines(stdout, stderr);
    let mut summary = ReadSummary::default();
    let mut forwarding = true;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(channel_id, "reader: process killed, stopping");
                break;
            }

            item = lines.next() => {
                let line = match item {
                    None => {
                        debug!(channel_id, events = summary.event_count, "reader: EOF on all streams");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(channel_id, %err, "reader: I/O error on process stream");
                        continue;
                    }
                    Some(Ok(line)) => line,
                };

                match classify_line(&line) {
                    Ok(Some(event)) => {
                        if let StreamEvent::Diagnostic { line, .. } = &event {
                            warn!(channel_id, line = line.as_str(), "agent reported error");
                        }
                        summary.record(&event);
                        if forwarding && event_tx.send(event).await.is_err() {
                            debug!(channel_id, "reader: event receiver dropped, draining only");
                            forwarding = false;
                        }
                    }
                    Ok(None) => {
                        if !line.trim().is_empty() {
                            debug!(channel_id, line = line.as_str(), "agent output");
                            summary.push_raw(line);
                        }
                    }
                    Err(err) => {
                        warn!(channel_id, %err, "reader: dropping malformed tagged line");
                    }
                }
            }
        }
    }

    summary
}
