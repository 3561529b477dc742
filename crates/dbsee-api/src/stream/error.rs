use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable error kind, as the search endpoints spell it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Error,
    AuthError,
    AuthRequired,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::AuthError => "auth_error",
            Self::AuthRequired => "auth_required",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a streaming search can fail. All of them reach the observer's
/// `on_error`; none is raised to the caller directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Authentication rejected: {0}")]
    AuthError(String),

    #[error("Connection error: {0}")]
    Transport(String),

    #[error("Error parsing server response: {0}")]
    Parse(String),

    #[error("Search timeout after {0:?} without a final summary")]
    Timeout(Duration),

    #[error("{0}")]
    Server(String),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRequired(_) => ErrorKind::AuthRequired,
            Self::AuthError(_) => ErrorKind::AuthError,
            Self::Transport(_) | Self::Parse(_) | Self::Timeout(_) | Self::Server(_) => {
                ErrorKind::Error
            }
        }
    }

    /// Builds the error carried by an `error`, `auth_error` or `auth_required` frame.
    pub fn from_wire(kind: ErrorKind, message: String, detail: Option<String>) -> Self {
        let message = match detail {
            Some(detail) if !detail.is_empty() && detail != message => {
                format!("{} ({})", message, detail)
            }
            _ => message,
        };
        match kind {
            ErrorKind::AuthRequired => Self::AuthRequired(message),
            ErrorKind::AuthError => Self::AuthError(message),
            ErrorKind::Error => Self::Server(message),
        }
    }
}
