use async_trait::async_trait;

use fluxrecv_core::Change;

use crate::FluxError;

/// The downstream "notify change" call.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify_change(&self, change: &Change) -> Result<(), FluxError>;
}
