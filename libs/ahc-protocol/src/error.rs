//! Protocol Error Types
//!
//! Error taxonomy for the register protocol engine.

use thiserror::Error;

/// Result type for ahc-protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Register protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Response CRC did not validate after all attempts
    #[error("CRC mismatch (rx: {preview})")]
    CrcMismatch {
        /// Hex preview of the received bytes
        preview: String,
    },

    /// No complete response within the receive timeout after all attempts
    #[error("Timeout waiting for response (rx: {preview})")]
    Timeout {
        /// Hex preview of any partially received bytes
        preview: String,
    },

    /// Channel number outside 1..=16, rejected before any I/O
    #[error("Invalid channel: {0}")]
    InvalidChannel(u8),

    /// Structurally invalid response (wrong byte count, truncated payload)
    #[error("Frame error: {0}")]
    Frame(String),

    /// Serial port or signal line failure
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid bus configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

impl From<tokio_serial::Error> for ProtocolError {
    fn from(err: tokio_serial::Error) -> Self {
        ProtocolError::Io(format!("Serial error: {err}"))
    }
}

// Helper methods for creating errors
impl ProtocolError {
    pub fn io(msg: impl Into<String>) -> Self {
        ProtocolError::Io(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        ProtocolError::Frame(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ProtocolError::Config(msg.into())
    }

    /// Check if the transaction engine should try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::CrcMismatch { .. }
                | ProtocolError::Timeout { .. }
                | ProtocolError::Frame(_)
        )
    }
}
