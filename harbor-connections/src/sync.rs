//! Conditional synchronization with unsaved local state.

use async_trait::async_trait;
use tracing::info;

/// Decides whether a remote change may discard local state.
///
/// Asked before the cache drops or refreshes a connection that is currently
/// open, since open editors may hold unsaved work against it.
#[async_trait]
pub trait DataSynchronization: Send + Sync {
    /// `kind` names the entity kind ("connection"); `description` lists the
    /// affected entities one per line. Returns `true` to proceed.
    async fn request_synchronization(&self, kind: &str, description: &str) -> bool;
}

/// Always proceeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl DataSynchronization for AutoApprove {
    async fn request_synchronization(&self, kind: &str, description: &str) -> bool {
        info!(kind, affected = %description.replace('\n', ", "), "Applying remote change");
        true
    }
}
