//! Line codec for agent process output.
//!
//! Frames the child's stdout/stderr into `\n`-delimited lines, the way
//! [`tokio_util::codec::LinesCodec`] does, with two differences that matter
//! for a process whose output may be partially garbled:
//!
//! - invalid UTF-8 is decoded lossily instead of failing the stream, and
//! - a line longer than the limit is dropped (with a warning) and the codec
//!   resynchronises on the next newline instead of returning an error.
//!
//! [`tokio_util::codec::FramedRead`] ends the stream after the first decoder
//! error, so neither condition may surface as `Err`. Only I/O errors do.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_bridge::bridge::codec::LineCodec;
//!
//! let lines = FramedRead::new(child_stdout, LineCodec::new());
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::AppError;

/// Maximum line length accepted by the codec: 16 MiB.
///
/// `[MESSAGE]` lines carry whole assistant payloads including tool results,
/// which routinely exceed a few hundred KiB.
pub const MAX_LINE_BYTES: usize = 16 * 1_048_576;

/// Newline-delimited, lossy UTF-8 line decoder for agent output.
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Index up to which the buffer has already been searched for `\n`.
    next_index: usize,
    /// Set while skipping the tail of an over-long line.
    discarding: bool,
}

impl LineCodec {
    /// Create a new `LineCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    /// Maximum accepted line length in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` while `src` holds no complete line.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = self.max_length.saturating_add(1).min(src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let newline_index = self.next_index + offset;
                    self.next_index = 0;
                    let line = src.split_to(newline_index + 1);
                    return Ok(Some(to_line(&line[..newline_index])));
                }
                (false, None) if src.len() > self.max_length => {
                    warn!(
                        max_length = self.max_length,
                        "line codec: line exceeds maximum length, discarding"
                    );
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    /// Decode the final, possibly unterminated, line at EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let rest = src.split_to(src.len());
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            return Ok(None);
        }
        Ok(Some(to_line(&rest)))
    }
}

/// Lossily decode `bytes` and strip one trailing `\r`.
fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
