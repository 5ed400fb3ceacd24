use std::fmt;

use thiserror::Error;

/// Canonical status codes as reported in Google API error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
    Unauthenticated,
    Unknown,
}

impl Code {
    /// Map the `error.status` string of a REST error body.
    pub fn from_status_name(name: &str) -> Option<Self> {
        let code = match name {
            "CANCELLED" => Code::Cancelled,
            "INVALID_ARGUMENT" => Code::InvalidArgument,
            "DEADLINE_EXCEEDED" => Code::DeadlineExceeded,
            "NOT_FOUND" => Code::NotFound,
            "ALREADY_EXISTS" => Code::AlreadyExists,
            "PERMISSION_DENIED" => Code::PermissionDenied,
            "RESOURCE_EXHAUSTED" => Code::ResourceExhausted,
            "FAILED_PRECONDITION" => Code::FailedPrecondition,
            "ABORTED" => Code::Aborted,
            "INTERNAL" => Code::Internal,
            "UNAVAILABLE" => Code::Unavailable,
            "UNAUTHENTICATED" => Code::Unauthenticated,
            "UNKNOWN" => Code::Unknown,
            _ => return None,
        };
        Some(code)
    }

    /// Fallback when the body carries no usable status name.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Code::InvalidArgument,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::NotFound,
            409 => Code::AlreadyExists,
            429 => Code::ResourceExhausted,
            499 => Code::Cancelled,
            500 => Code::Internal,
            503 => Code::Unavailable,
            504 => Code::DeadlineExceeded,
            _ => Code::Unknown,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Internal
                | Code::Unavailable
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "CANCELLED",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::Unauthenticated => "UNAUTHENTICATED",
            Code::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PubsubError {
    #[error("pubsub {code}: {message}")]
    Status { code: Code, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid message payload: {0}")]
    Decode(String),
    #[error("credentials error: {0}")]
    Credentials(String),
}

impl PubsubError {
    pub fn status(code: Code, message: impl Into<String>) -> Self {
        PubsubError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<Code> {
        match self {
            PubsubError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.code() == Some(Code::AlreadyExists)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(Code::NotFound)
    }

    /// Whether the receive loop should back off and pull again. A failed
    /// token refresh is retried like an unavailable backend.
    pub fn is_retryable(&self) -> bool {
        match self {
            PubsubError::Status { code, .. } => code.is_retryable(),
            PubsubError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PubsubError::Credentials(_) => true,
            PubsubError::Serde(_) | PubsubError::Decode(_) => false,
        }
    }
}
