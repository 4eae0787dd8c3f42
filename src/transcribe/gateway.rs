use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::scrub::scrub_transcription;
use super::{TranscribeError, Transcriber};
use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::store::Database;

const BASE_INSTRUCTION: &str = "Transcribe this audio literally. Label each utterance as \
[Speaker N]: followed by the spoken words. Write [silence] if nothing is spoken and \
[inaudible] where speech cannot be made out.";

/// Markers that disqualify a chunk text from serving as context
const CONTEXT_SKIP_MARKERS: &[&str] = &["[silence]", "[inaudible]", "[unclear]"];

/// Minimum length for a chunk text to count as substantive context
const CONTEXT_MIN_CHARS: usize = 15;

/// Calls the external transcriber once per chunk: builds the rolling
/// context prompt, retries transient failures with exponential back-off
/// (a server-suggested delay overrides the computed one), and scrubs the
/// output before it is persisted.
#[derive(Clone)]
pub struct TranscriptionGateway {
    transcriber: Arc<dyn Transcriber>,
    db: Database,
    attempts: u32,
    retry_base: Duration,
    context_chunks: usize,
    context_chars: usize,
}

impl TranscriptionGateway {
    pub fn new(transcriber: Arc<dyn Transcriber>, db: Database, config: &ProcessorConfig) -> Self {
        Self {
            transcriber,
            db,
            attempts: config.transcribe_attempts.max(1),
            retry_base: config.retry_base(),
            context_chunks: config.context_chunks,
            context_chars: config.context_chars,
        }
    }

    /// Transcribe one stitched chunk, returning the scrubbed text
    pub async fn transcribe_chunk(
        &self,
        session_id: &str,
        audio_b64: &str,
        mime_type: &str,
    ) -> Result<String> {
        let recent = self.db.recent_chunk_texts(session_id, self.context_chunks)?;
        let context = rolling_context(&recent, self.context_chars);
        let prompt = build_prompt(context.as_deref());

        let raw = self.call_with_retry(session_id, audio_b64, mime_type, &prompt).await?;
        Ok(scrub_transcription(&raw, &prompt))
    }

    async fn call_with_retry(
        &self,
        session_id: &str,
        audio_b64: &str,
        mime_type: &str,
        prompt: &str,
    ) -> std::result::Result<String, TranscribeError> {
        let mut last_err: Option<TranscribeError> = None;

        for attempt in 1..=self.attempts {
            match self.transcriber.transcribe(audio_b64, mime_type, prompt).await {
                Ok(text) => {
                    if attempt > 1 {
                        info!("Transcriber succeeded for {} on attempt {}", session_id, attempt);
                    }
                    return Ok(text);
                }
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    // Exponential back-off unless the server told us how long to wait
                    let computed = self.retry_base * 2u32.saturating_pow(attempt - 1);
                    let delay = e.retry_after.unwrap_or(computed);
                    warn!(
                        "Transcriber attempt {}/{} failed for {}: {} (retrying in {:?})",
                        attempt, self.attempts, session_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => {
                    warn!(
                        "Transcriber failed for {} on attempt {}/{}: {}",
                        session_id, attempt, self.attempts, e
                    );
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TranscribeError::invalid("no attempts made")))
    }
}

/// Build the rolling context from recent chunk texts: drop markers and
/// trivial lines, join, and keep the final character budget.
pub fn rolling_context(recent: &[String], char_budget: usize) -> Option<String> {
    let substantive: Vec<&str> = recent
        .iter()
        .map(|t| t.trim())
        .filter(|t| t.len() >= CONTEXT_MIN_CHARS)
        .filter(|t| !CONTEXT_SKIP_MARKERS.contains(t))
        .collect();

    if substantive.is_empty() {
        return None;
    }

    let joined = substantive.join("\n");
    Some(tail_chars(&joined, char_budget).to_string())
}

/// The final `budget` characters of `text`, on a char boundary
fn tail_chars(text: &str, budget: usize) -> &str {
    let count = text.chars().count();
    if count <= budget {
        return text;
    }
    let skip = count - budget;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub fn build_prompt(context: Option<&str>) -> String {
    match context {
        Some(context) => format!(
            "Previous context (do not repeat any of this text in your transcription):\n\
             {}\n\n{}",
            context, BASE_INSTRUCTION
        ),
        None => BASE_INSTRUCTION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_context_drops_markers_and_trivia() {
        let recent = vec![
            "[silence]".to_string(),
            "[Speaker 1]: We agreed on the rollout plan for next week.".to_string(),
            "ok".to_string(),
            "[inaudible]".to_string(),
        ];
        let context = rolling_context(&recent, 500).unwrap();
        assert_eq!(context, "[Speaker 1]: We agreed on the rollout plan for next week.");
    }

    #[test]
    fn test_rolling_context_empty_when_nothing_substantive() {
        let recent = vec!["[silence]".to_string(), "hm".to_string()];
        assert!(rolling_context(&recent, 500).is_none());
    }

    #[test]
    fn test_rolling_context_keeps_tail_of_budget() {
        let recent = vec!["a".repeat(300), "b".repeat(300)];
        let context = rolling_context(&recent, 500).unwrap();
        assert_eq!(context.chars().count(), 500);
        assert!(context.ends_with(&"b".repeat(300)));
        // Tail-cropped: the oldest characters fall off first
        assert_eq!(context.chars().filter(|&c| c == 'a').count(), 199);
    }

    #[test]
    fn test_prompt_includes_do_not_repeat_only_with_context() {
        let bare = build_prompt(None);
        assert!(!bare.contains("do not repeat"));

        let with = build_prompt(Some("[Speaker 1]: earlier line"));
        assert!(with.contains("do not repeat"));
        assert!(with.contains("[Speaker 1]: earlier line"));
        assert!(with.ends_with(BASE_INSTRUCTION));
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        let text = "äöü".repeat(300);
        let tail = tail_chars(&text, 500);
        assert_eq!(tail.chars().count(), 500);
    }

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyTranscriber {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> TranscribeError,
        last_prompt: Mutex<Option<String>>,
    }

    impl FlakyTranscriber {
        fn new(fail_first: u32, error: fn() -> TranscribeError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                error,
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transcriber for FlakyTranscriber {
        async fn transcribe(
            &self,
            _audio_b64: &str,
            _mime_type: &str,
            prompt: &str,
        ) -> std::result::Result<String, TranscribeError> {
            *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err((self.error)())
            } else {
                Ok("[Speaker 1]: Recovered after the outage, moving on.".to_string())
            }
        }
    }

    fn gateway_with(transcriber: Arc<FlakyTranscriber>) -> (TranscriptionGateway, Database) {
        let db = Database::open_in_memory().unwrap();
        let gateway = TranscriptionGateway::new(
            transcriber,
            db.clone(),
            &crate::config::ProcessorConfig::default(),
        );
        (gateway, db)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures_until_success() {
        let transcriber = Arc::new(FlakyTranscriber::new(2, || {
            TranscribeError::server("stub 503")
        }));
        let (gateway, _db) = gateway_with(transcriber.clone());

        let text = gateway
            .transcribe_chunk("sess-a", "AAAA", "audio/mpeg")
            .await
            .unwrap();
        assert_eq!(text, "[Speaker 1]: Recovered after the outage, moving on.");
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_configured_attempts() {
        let transcriber = Arc::new(FlakyTranscriber::new(10, || {
            TranscribeError::rate_limited("stub 429", Some(Duration::from_secs(1)))
        }));
        let (gateway, _db) = gateway_with(transcriber.clone());

        let err = gateway
            .transcribe_chunk("sess-a", "AAAA", "audio/mpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ProcessorError::Transcribe(_)));
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_input_fails_without_retry() {
        let transcriber = Arc::new(FlakyTranscriber::new(10, || {
            TranscribeError::invalid("unsupported container")
        }));
        let (gateway, _db) = gateway_with(transcriber.clone());

        gateway
            .transcribe_chunk("sess-a", "AAAA", "audio/mpeg")
            .await
            .unwrap_err();
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prior_chunks_flow_into_the_prompt() {
        let transcriber = Arc::new(FlakyTranscriber::new(0, || {
            TranscribeError::server("unused")
        }));
        let (gateway, db) = gateway_with(transcriber.clone());

        db.insert_session("sess-a", "user-1", "Standup", chrono::Utc::now())
            .unwrap();
        db.insert_chunk(
            "sess-a",
            0,
            "[Speaker 1]: The migration finished over the weekend.",
            chrono::Utc::now(),
            None,
        )
        .unwrap();

        gateway
            .transcribe_chunk("sess-a", "AAAA", "audio/mpeg")
            .await
            .unwrap();

        let prompt = transcriber.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("do not repeat"));
        assert!(prompt.contains("The migration finished over the weekend."));
    }
}
