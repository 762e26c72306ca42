//! Unified error types for the media sink

use thiserror::Error;

/// Main error type for sink operations
#[derive(Error, Debug)]
pub enum SinkError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device operation error
    #[error("Device '{device_id}' error: {message}")]
    DeviceError {
        device_id: String,
        message: String,
    },

    /// No devices in the requested direction
    #[error("No audio devices found")]
    NoDevices,

    /// Hardware refused every parameter set we offered
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Kernel display (DRM/KMS) failure
    #[error("Display error: {0}")]
    Display(String),

    /// Video decoder failure
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Component used before open()
    #[error("Component not opened")]
    NotOpened,

    /// Component already streaming
    #[error("Component already active")]
    AlreadyActive,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be loaded
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Thread communication error
    #[error("Thread communication error: {0}")]
    ChannelError(String),

    /// Error surfaced by an audio/video backend library
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for sink operations
pub type Result<T> = std::result::Result<T, SinkError>;

impl SinkError {
    /// Create a device error with context
    pub fn device_error(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceError {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    /// Create a display error
    pub fn display(message: impl Into<String>) -> Self {
        Self::Display(message.into())
    }

    /// Create a decoder error
    pub fn decoder(message: impl Into<String>) -> Self {
        Self::Decoder(message.into())
    }

    /// Check if this error is recoverable (can retry)
    ///
    /// Frame-level display and decode failures are dropped and the pipeline
    /// moves on to the next frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SinkError::DeviceError { .. } | SinkError::Display(_) | SinkError::Decoder(_)
        )
    }
}
