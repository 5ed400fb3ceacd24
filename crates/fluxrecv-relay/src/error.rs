use thiserror::Error;

use fluxrecv_core::CoreError;
use fluxrecv_flux::ForwardError;
use fluxrecv_pubsub::PubsubError;

/// Anything that stops a message from being acknowledged. Every variant
/// leads to a nack.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Parse(#[from] CoreError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("receive loop failed: {0}")]
    Receive(#[from] PubsubError),
    #[error("dispatch loop panicked: {0}")]
    Dispatch(#[from] tokio::task::JoinError),
}
