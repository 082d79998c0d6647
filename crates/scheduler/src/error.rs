//! Error types for transfers

use std::time::Duration;
use thiserror::Error;

/// Failure of a single transport attempt.
///
/// Cloneable so the terminal status of a request can be handed to every
/// observer of that request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Server answered with a non-success status
    #[error("HTTP error: {status}")]
    Http { status: u16 },

    /// Connection could not be established or was reset
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Attempt exceeded the configured transfer timeout
    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),

    /// Response body could not be read to the end
    #[error("Failed to read response body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            TransportError::Http {
                status: status.as_u16(),
            }
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Connection(e.to_string())
        }
    }
}

/// Terminal failure of a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Every permitted transport attempt failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The request was cancelled before it completed
    #[error("Request cancelled")]
    Cancelled,
}

impl TransferError {
    /// Cancellations are intentional and never reported to the user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
