//! # Error Module
//!
//! Every failure a loopback cycle can report. Validation errors are raised
//! before any hardware is touched; device and stream errors abort the cycle
//! and leave the last published results in place.

use thiserror::Error;

/// Result type alias for loopback operations.
pub type Result<T> = std::result::Result<T, LoopbackError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoopbackError {
    /// A frequency, amplitude, duration or rate was outside its valid range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The output stream ran dry while the tone was playing.
    #[error("Output stream underrun: {0}")]
    StreamUnderrun(String),

    /// Captured samples were dropped before they could be collected.
    #[error("Input stream overrun: {0}")]
    StreamOverrun(String),

    #[error("A loopback test is already in progress")]
    TestAlreadyInProgress,

    #[error("Loopback test cancelled")]
    Cancelled,

    #[error("Audio I/O did not finish within {0} ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),
}

impl From<hound::Error> for LoopbackError {
    fn from(err: hound::Error) -> Self {
        LoopbackError::Capture(err.to_string())
    }
}
