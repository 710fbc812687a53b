#![forbid(unsafe_code)]

//! `agent-bridge` drives a stdio agent runtime on behalf of a host
//! application.
//!
//! Start with [`bridge::Bridge`] for process orchestration,
//! [`orchestrator::session::Session`] for conversation state, and
//! [`permission::service::PermissionService`] for the approval handshake.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod permission;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};
