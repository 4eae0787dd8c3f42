//! Error types for the streaming processor.

use thiserror::Error;

use crate::session::SessionStatus;
use crate::transcribe::TranscribeError;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Buffer overflow: Session exceeds maximum size")]
    BufferOverflow,

    #[error("Operation '{operation}' not allowed in state {state:?}")]
    BadState {
        operation: &'static str,
        state: SessionStatus,
    },

    #[error("All stitch strategies failed: {0}")]
    StitchFailed(String),

    #[error("Transcription failed: {0}")]
    Transcribe(#[from] TranscribeError),

    #[error("Summarization failed: {0}")]
    Summarize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_message_is_client_facing() {
        // The exact text is part of the wire contract for `error` replies.
        assert_eq!(
            ProcessorError::BufferOverflow.to_string(),
            "Buffer overflow: Session exceeds maximum size"
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = ProcessorError::NotFound("sess-1".to_string());
        assert_eq!(err.to_string(), "Session not found: sess-1");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ProcessorError>();
        assert_sync::<ProcessorError>();
    }
}
