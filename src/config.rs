use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub processor: ProcessorConfig,
    pub transcriber: TranscriberConfig,
    pub summarizer: SummarizerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for per-session fragment files
    pub fragment_root: PathBuf,
    /// SQLite database path
    pub db_path: PathBuf,
    /// Keep stitched debug MP3s across session cleanup
    pub debug_save_stitched: bool,
    /// Days before an abandoned session directory is swept
    pub retention_days: u64,
}

/// Pipeline constants. The defaults are the production values; tests shrink
/// them to keep scenarios fast.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Seconds between scheduler ticks for a session
    pub chunk_period_secs: u64,
    /// Fragments below this size are dropped at ingest (silence gate)
    pub min_fragment_bytes: usize,
    /// Batches below this combined size produce no chunk
    pub min_stitch_bytes: usize,
    /// Hard cap on cumulative buffered bytes per session
    pub max_session_bytes: u64,
    /// Average client energy below this marks a batch as likely silence
    pub silence_energy: f32,
    /// Silence gating only applies below this combined size
    pub silence_max_bytes: usize,
    /// Previous chunks considered for rolling context
    pub context_chunks: usize,
    /// Character budget for the rolling context tail
    pub context_chars: usize,
    /// Transcriber attempts per chunk
    pub transcribe_attempts: u32,
    /// Base delay for transcriber retry back-off
    pub retry_base_secs: u64,
    /// External tool timeout for single-input invocations
    pub tool_timeout_secs: u64,
    /// External tool timeout for filter-graph invocations
    pub filter_graph_timeout_secs: u64,
    /// Cap on bytes read from an external tool's stdout
    pub tool_stdout_max: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    pub endpoint: String,
    /// One model per deployment
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            storage: StorageConfig::default(),
            processor: ProcessorConfig::default(),
            transcriber: TranscriberConfig::default(),
            summarizer: SummarizerConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fragment_root: PathBuf::from("./sessions"),
            db_path: PathBuf::from("./meetscribe.db"),
            debug_save_stitched: false,
            retention_days: 7,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_period_secs: 30,
            min_fragment_bytes: 1024,
            min_stitch_bytes: 10 * 1024,
            max_session_bytes: 2 * 1024 * 1024 * 1024,
            silence_energy: 0.02,
            silence_max_bytes: 40 * 1024,
            context_chunks: 5,
            context_chars: 500,
            transcribe_attempts: 3,
            retry_base_secs: 2,
            tool_timeout_secs: 30,
            filter_graph_timeout_secs: 60,
            tool_stdout_max: 10 * 1024 * 1024,
        }
    }
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8089/v1/transcribe".to_string(),
            model: "scribe-standard-1".to_string(),
            api_key_env: "MEETSCRIBE_TRANSCRIBER_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8089/v1/summarize".to_string(),
            model: "scribe-standard-1".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl ProcessorConfig {
    pub fn chunk_period(&self) -> Duration {
        Duration::from_secs(self.chunk_period_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_secs(self.retry_base_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn filter_graph_timeout(&self) -> Duration {
        Duration::from_secs(self.filter_graph_timeout_secs)
    }
}

impl Config {
    /// Load configuration from an optional file plus `MEETSCRIBE_*`
    /// environment overrides (e.g. `MEETSCRIBE_SERVICE__PORT=8080`).
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("MEETSCRIBE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_contract() {
        let config = Config::default();
        assert_eq!(config.processor.chunk_period_secs, 30);
        assert_eq!(config.processor.min_fragment_bytes, 1024);
        assert_eq!(config.processor.min_stitch_bytes, 10 * 1024);
        assert_eq!(config.processor.max_session_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.processor.transcribe_attempts, 3);
        assert_eq!(config.storage.retention_days, 7);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load("does-not-exist").unwrap();
        assert_eq!(config.service.port, 3000);
        assert_eq!(config.processor.context_chunks, 5);
    }
}
