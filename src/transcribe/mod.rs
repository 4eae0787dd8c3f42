//! Transcription gateway
//!
//! This module provides:
//! - The `Transcriber` seam the pipeline calls once per chunk
//! - Error predicates the retry loop keys off
//! - Rolling-context prompt assembly
//! - Post-processing that scrubs refusals and hallucination loops

mod gateway;
mod http;
pub mod scrub;

pub use gateway::TranscriptionGateway;
pub use http::HttpTranscriber;

use std::time::Duration;
use thiserror::Error;

/// Failure from a transcriber call. The pipeline depends only on the
/// predicates, never on the message text.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TranscribeError {
    pub message: String,
    pub kind: TranscribeErrorKind,
    /// Server-suggested delay before the next attempt, when provided
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscribeErrorKind {
    Timeout,
    Connection,
    RateLimit,
    Server,
    /// Rejected input or malformed response; retrying cannot help
    Invalid,
}

impl TranscribeError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TranscribeErrorKind::Timeout,
            retry_after: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TranscribeErrorKind::Connection,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            message: message.into(),
            kind: TranscribeErrorKind::RateLimit,
            retry_after,
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TranscribeErrorKind::Server,
            retry_after: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TranscribeErrorKind::Invalid,
            retry_after: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TranscribeErrorKind::Timeout
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == TranscribeErrorKind::RateLimit
    }

    pub fn is_server_error(&self) -> bool {
        self.kind == TranscribeErrorKind::Server
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, TranscribeErrorKind::Invalid)
    }
}

/// External transcription capability. The gateway builds the full prompt
/// (instruction plus optional do-not-repeat context) so implementations
/// stay wire-only.
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio_b64: &str,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, TranscribeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_is_not_retryable() {
        assert!(!TranscribeError::invalid("bad audio").is_retryable());
        assert!(TranscribeError::timeout("slow").is_retryable());
        assert!(TranscribeError::server("500").is_retryable());
        assert!(TranscribeError::connection("refused").is_retryable());
        assert!(TranscribeError::rate_limited("429", None).is_retryable());
    }

    #[test]
    fn test_predicates() {
        let err = TranscribeError::rate_limited("slow down", Some(Duration::from_secs(9)));
        assert!(err.is_rate_limit());
        assert!(!err.is_timeout());
        assert!(!err.is_server_error());
        assert_eq!(err.retry_after, Some(Duration::from_secs(9)));
    }
}
