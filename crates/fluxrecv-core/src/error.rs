use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed notification: {0}")]
    MalformedNotification(#[from] serde_json::Error),
}
