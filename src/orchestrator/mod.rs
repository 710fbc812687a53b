//! Channel and session orchestration.
//!
//! Covers the channel registry that tracks live agent processes, the
//! streaming assistant-message merge, and the per-conversation session
//! engine built on top of the bridge.

pub mod channel_registry;
pub mod merge;
pub mod session;
