//! Error types for the remote store seam.

use thiserror::Error;

/// Failures talking to the remote `weekmenus` resource.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached (offline, DNS, timeout, ...)
    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    /// An update targeted a record the backend does not know
    #[error("week menu {0} not found")]
    NotFound(i64),

    /// The backend answered but refused the request
    #[error("remote store rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}
