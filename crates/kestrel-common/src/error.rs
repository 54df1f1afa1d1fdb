//! Error types for KestrelDB.

use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in KestrelDB operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A delta list would exceed its 16-bit size limit. The entry is
    /// dropped; callers treat this as "do not index", not as a failure.
    #[error("Delta list overflow")]
    Overflow,

    /// The request has been parked by the I/O subsystem and will be
    /// restarted when the page read completes. Not a failure: the caller
    /// must do nothing further with the request.
    #[error("Request queued behind a page read")]
    Queued,

    #[error("Buffer error: {0}")]
    BufferError(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Bad state: {0}")]
    BadState(String),

    /// A collision entry was inserted onto a collision entry. Expected
    /// (and swallowed) while replaying closed chapters during rebuild.
    #[error("Duplicate record name")]
    DuplicateName,

    #[error("Index was not saved cleanly")]
    NotSavedCleanly,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("Index busy: {0}")]
    Busy(String),

    #[error("Chapter commit failed: {0}")]
    ChapterWrite(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl KestrelError {
    /// Returns true for the retryable parked-request marker.
    pub fn is_queued(&self) -> bool {
        matches!(self, KestrelError::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_overflow_display() {
        let err = KestrelError::Overflow;
        assert_eq!(err.to_string(), "Delta list overflow");
    }

    #[test]
    fn test_queued_is_not_confused_with_errors() {
        assert!(KestrelError::Queued.is_queued());
        assert!(!KestrelError::Overflow.is_queued());
        assert!(!KestrelError::DuplicateName.is_queued());
    }

    #[test]
    fn test_corrupt_data_display() {
        let err = KestrelError::CorruptData("bad page nonce".to_string());
        assert_eq!(err.to_string(), "Corrupt data: bad page nonce");
    }

    #[test]
    fn test_bad_state_display() {
        let err = KestrelError::BadState("entry is at end of list".to_string());
        assert_eq!(err.to_string(), "Bad state: entry is at end of list");
    }

    #[test]
    fn test_not_saved_cleanly_display() {
        assert_eq!(
            KestrelError::NotSavedCleanly.to_string(),
            "Index was not saved cleanly"
        );
    }

    #[test]
    fn test_chapter_write_display() {
        let err = KestrelError::ChapterWrite("disk full".to_string());
        assert_eq!(err.to_string(), "Chapter commit failed: disk full");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KestrelError>();
    }
}
