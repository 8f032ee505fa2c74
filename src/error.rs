//! Error types for droidpool
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Main error type for droidpool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("device manager has already been initialized")]
    AlreadyInitialized,

    #[error("device manager has not been initialized")]
    NotInitialized,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid serial: {0}")]
    InvalidSerial(String),

    #[error("Device not available: {0}")]
    DeviceNotAvailable(String),

    #[error("fastboot is not enabled")]
    FastbootNotEnabled,
}

/// Result type alias for droidpool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Check if this error indicates a device that may come back on its own
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PoolError::DeviceNotAvailable(_) | PoolError::Io(_))
    }
}
