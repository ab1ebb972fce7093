/*!
Common error types for the acquisition pipeline.
*/

use thiserror::Error;

/// Common result type used throughout the core library
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Per-frame decode failures. The frame is dropped and acquisition continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Raw frame size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Footer field at byte {offset} (+{width}) outside footer of {footer_len} bytes")]
    FooterOutOfRange {
        offset: usize,
        width: usize,
        footer_len: usize,
    },
}

/// Error type for all pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid calibration, layout or session settings. Fatal.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Appending to the persistent store failed. Fatal for the session.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The frame source failed
    #[error("Frame source error: {0}")]
    Source(String),

    /// I/O errors (raw dumps, replay files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker thread panicked
    #[error("Worker thread '{0}' panicked")]
    WorkerPanic(&'static str),
}

impl PipelineError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new frame source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Whether the session must stop because of this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_errors_are_recoverable() {
        let err: PipelineError = DecodeError::SizeMismatch {
            expected: 12352,
            actual: 100,
        }
        .into();
        assert!(!err.is_fatal());
        assert!(PipelineError::storage("disk full").is_fatal());
        assert!(PipelineError::config("zero denominator").is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = DecodeError::SizeMismatch {
            expected: 12352,
            actual: 12000,
        };
        assert_eq!(
            err.to_string(),
            "Raw frame size mismatch: expected 12352 bytes, got 12000"
        );
    }
}
