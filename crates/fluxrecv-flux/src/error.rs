use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FluxError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("flux api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A failed forward. Both kinds reject the message; they differ only in how
/// they are logged.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("timed out after {after:?} waiting for the flux api")]
    Timeout { after: Duration },
    #[error("flux api call failed: {0}")]
    Call(#[from] FluxError),
}

impl ForwardError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::Timeout { .. })
    }
}
