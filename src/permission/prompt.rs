//! Operator prompt collaborator.

use std::future::Future;
use std::pin::Pin;

use crate::models::permission::{PermissionDecision, PermissionRequest};

/// Asks a human (or a policy) to decide a permission request.
///
/// The service bounds every call with the configured permission timeout
/// and treats expiry as a denial, so implementations may block for as long
/// as the operator takes.
pub trait PermissionPrompt: Send + Sync {
    /// Decide `request`.
    fn decide<'a>(
        &'a self,
        request: &'a PermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send + 'a>>;
}

/// Prompt that always answers with a fixed decision.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub PermissionDecision);

impl PermissionPrompt for FixedPrompt {
    fn decide<'a>(
        &'a self,
        _request: &'a PermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send + 'a>> {
        let decision = self.0;
        Box::pin(async move { decision })
    }
}
