// Shared stub collaborators for the pipeline integration tests.
//
// The stitcher passes bytes through, the transcriber returns numbered
// speaker lines, and the summarizer echoes a marker, so every scenario
// can assert on exact pipeline output without ffmpeg or a network.

// Each test binary compiles this module separately and uses a different
// subset of it.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meetscribe::config::ProcessorConfig;
use meetscribe::error::Result;
use meetscribe::stitch::{StitchRequest, StitchedAudio, Stitcher};
use meetscribe::summarize::Summarizer;
use meetscribe::transcribe::{TranscribeError, Transcriber};
use meetscribe::{Database, FragmentStore, Processor, ProcessorError};

/// Pipeline constants shrunk for test pacing: 1 s ticks, tiny minimums
pub fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        chunk_period_secs: 1,
        retry_base_secs: 1,
        ..ProcessorConfig::default()
    }
}

pub struct StubStitcher {
    pub calls: AtomicU32,
    /// Fail the first N stitch calls to exercise the restore path
    pub fail_first: u32,
}

impl StubStitcher {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
        }
    }

    pub fn failing_first(n: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first: n,
        }
    }
}

#[async_trait::async_trait]
impl Stitcher for StubStitcher {
    async fn stitch(&self, request: StitchRequest<'_>) -> Result<StitchedAudio> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(ProcessorError::StitchFailed("stub stitch failure".to_string()));
        }
        Ok(StitchedAudio {
            bytes: request.combined_bytes(),
            mime_type: "audio/mpeg".to_string(),
        })
    }
}

pub struct StubTranscriber {
    pub calls: AtomicU32,
    chunk_counter: AtomicU32,
    /// Hold each call open this long (for cancellation scenarios)
    pub delay: Duration,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            chunk_counter: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            chunk_counter: AtomicU32::new(0),
            delay,
        }
    }
}

#[async_trait::async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        _audio_b64: &str,
        _mime_type: &str,
        _prompt: &str,
    ) -> std::result::Result<String, TranscribeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.chunk_counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("[Speaker 1]: Stub transcript line {}.", n))
    }
}

pub struct StubSummarizer {
    pub fail: bool,
}

impl StubSummarizer {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait::async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String> {
        if self.fail {
            return Err(ProcessorError::Summarize("stub summarizer down".to_string()));
        }
        Ok(format!("Stub summary of {} characters.", transcript.len()))
    }
}

pub struct TestHarness {
    pub processor: Processor,
    pub db: Database,
    pub stitcher: Arc<StubStitcher>,
    pub transcriber: Arc<StubTranscriber>,
}

/// Wire a processor against stub collaborators over a temp fragment root.
/// The database lives at `<root>/meetscribe.db` so a second harness over
/// the same directory sees the same rows (crash-recovery scenarios).
pub fn harness(root: &Path, config: ProcessorConfig) -> TestHarness {
    harness_with(
        root,
        config,
        Arc::new(StubStitcher::new()),
        Arc::new(StubTranscriber::new()),
        Arc::new(StubSummarizer::new()),
    )
}

pub fn harness_with(
    root: &Path,
    config: ProcessorConfig,
    stitcher: Arc<StubStitcher>,
    transcriber: Arc<StubTranscriber>,
    summarizer: Arc<StubSummarizer>,
) -> TestHarness {
    let db = Database::open(root.join("meetscribe.db")).unwrap();
    let store = Arc::new(FragmentStore::new(root.join("sessions"), false));
    let processor = Processor::new(
        config,
        false,
        db.clone(),
        store,
        stitcher.clone(),
        transcriber.clone(),
        summarizer,
    );
    TestHarness {
        processor,
        db,
        stitcher,
        transcriber,
    }
}

/// A patterned fragment payload of the given size
pub fn fragment(size: usize, seed: u8) -> Vec<u8> {
    (0..size).map(|i| seed.wrapping_add(i as u8)).collect()
}
