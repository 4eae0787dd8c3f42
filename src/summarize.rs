//! Summarization seam and final-transcript assembly.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::SummarizerConfig;
use crate::error::{ProcessorError, Result};
use crate::store::ChunkRow;
use crate::transcribe::scrub::is_boilerplate_chunk;

/// Returned when the summarizer fails; finalization still completes.
pub const SUMMARY_FALLBACK: &str = "Summary could not be generated from the transcript.";

/// Summary phrases that models invent about audio they never heard.
/// Sentences carrying one of these are dropped unless the transcript
/// itself contains the phrase.
const SUMMARY_HALLUCINATION_MARKERS: &[&str] = &[
    "audiobook",
    "thanked the listener",
    "thanks for listening",
    "thank you for listening",
    "subscribed to the channel",
    "like and subscribe",
];

/// Meta framings stripped from the head of a summary
const SUMMARY_META_PREFIXES: &[&str] = &[
    "here is a summary of the transcript:",
    "here's a summary of the transcript:",
    "here is a summary:",
    "here's a summary:",
    "summary:",
];

#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String>;
}

/// Join chunk texts into the final transcript, dropping refusal and
/// boilerplate entries.
pub fn assemble_transcript(chunks: &[ChunkRow]) -> String {
    chunks
        .iter()
        .map(|c| c.text.trim())
        .filter(|t| !is_boilerplate_chunk(t))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Strip hallucinated sentences and meta framing from a model summary
pub fn scrub_summary(summary: &str, transcript: &str) -> String {
    let mut text = summary.trim().to_string();

    let lowered = text.to_lowercase();
    for prefix in SUMMARY_META_PREFIXES {
        if lowered.starts_with(prefix) {
            text = text[prefix.len()..].trim_start().to_string();
            break;
        }
    }

    let transcript_lower = transcript.to_lowercase();
    let kept: Vec<&str> = split_sentences(&text)
        .into_iter()
        .filter(|sentence| {
            let s = sentence.to_lowercase();
            !SUMMARY_HALLUCINATION_MARKERS
                .iter()
                .any(|m| s.contains(m) && !transcript_lower.contains(m))
        })
        .collect();

    let cleaned = kept.join(" ").trim().to_string();
    if cleaned.is_empty() {
        SUMMARY_FALLBACK.to_string()
    } else {
        cleaned
    }
}

/// Sentence split on terminal punctuation, keeping the punctuation
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev_end = false;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            prev_end = true;
        } else if prev_end && c.is_whitespace() {
            let sentence = text[start..i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i;
            prev_end = false;
        } else {
            prev_end = false;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Production summarizer: JSON POST against a configured endpoint
pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    model: &'a str,
    transcript: &'a str,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    summary: String,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SummarizeRequest {
                model: &self.model,
                transcript,
            })
            .send()
            .await
            .map_err(|e| ProcessorError::Summarize(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Summarizer returned {}", status);
            return Err(ProcessorError::Summarize(format!(
                "summarizer returned {}",
                status
            )));
        }

        let parsed: SummarizeResponse = response
            .json()
            .await
            .map_err(|e| ProcessorError::Summarize(format!("malformed summarizer response: {}", e)))?;
        Ok(parsed.summary)
    }
}
