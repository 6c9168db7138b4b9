//! Error handling for the heating service

use ahc_protocol::ProtocolError;
use thiserror::Error;

/// Heating service error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UfhSrvError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Bus transaction errors
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    /// Invalid parameter from a caller
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Input/Output operation errors (log files, GPIO setup)
    #[error("IO error: {0}")]
    IoError(String),

    /// Write refused by policy, no bus I/O performed
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Per-invocation transaction budget ran out mid-operation
    #[error("Transaction budget exhausted")]
    BudgetExhausted,
}

/// Result type alias for the heating service
pub type Result<T> = std::result::Result<T, UfhSrvError>;

impl UfhSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        UfhSrvError::ConfigError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        UfhSrvError::ValidationError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        UfhSrvError::IoError(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        UfhSrvError::WriteRejected(msg.into())
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for UfhSrvError {
    fn from(err: std::io::Error) -> Self {
        UfhSrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for UfhSrvError {
    fn from(err: figment::Error) -> Self {
        UfhSrvError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_converts() {
        let err: UfhSrvError = ProtocolError::InvalidChannel(17).into();
        assert_eq!(err.to_string(), "Protocol error: Invalid channel: 17");
    }

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(
            UfhSrvError::rejected("mode writes disabled"),
            UfhSrvError::WriteRejected(_)
        ));
        assert_eq!(
            UfhSrvError::config("bad divisor").to_string(),
            "Configuration error: bad divisor"
        );
    }
}
