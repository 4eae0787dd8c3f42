use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is accepting fragments and producing chunks
    Recording,
    /// Fragments are accepted but no chunks are produced
    Paused,
    /// Session is being finalized
    Processing,
    /// Finalization succeeded (terminal)
    Completed,
    /// Session was cancelled (terminal)
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Paused => "paused",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "recording" => Some(SessionStatus::Recording),
            "paused" => Some(SessionStatus::Paused),
            "processing" => Some(SessionStatus::Processing),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether the session should be resident in the in-memory registry
    pub fn is_resident(&self) -> bool {
        matches!(
            self,
            SessionStatus::Recording | SessionStatus::Paused | SessionStatus::Processing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Whether ingest may accept fragments in this state
    pub fn accepts_fragments(&self) -> bool {
        matches!(self, SessionStatus::Recording | SessionStatus::Paused)
    }
}

/// Container format hint supplied with each fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerHint {
    WebmOpus,
    OggOpus,
    Mp3,
    Mp4,
    Aac,
    Flac,
    Wav,
}

impl ContainerHint {
    /// Map a client MIME type onto a hint. Unknown types fall back to
    /// WebM-Opus, the format every browser recorder emits.
    pub fn from_mime_type(mime: &str) -> Self {
        let mime = mime
            .split(';')
            .next()
            .unwrap_or(mime)
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "audio/webm" | "video/webm" => ContainerHint::WebmOpus,
            "audio/ogg" | "application/ogg" => ContainerHint::OggOpus,
            "audio/mpeg" | "audio/mp3" => ContainerHint::Mp3,
            "audio/mp4" | "audio/x-m4a" | "audio/m4a" => ContainerHint::Mp4,
            "audio/aac" => ContainerHint::Aac,
            "audio/flac" | "audio/x-flac" => ContainerHint::Flac,
            "audio/wav" | "audio/x-wav" | "audio/wave" => ContainerHint::Wav,
            _ => ContainerHint::WebmOpus,
        }
    }

    /// File extension for the durable store
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerHint::WebmOpus => "webm",
            ContainerHint::OggOpus => "ogg",
            ContainerHint::Mp3 => "mp3",
            ContainerHint::Mp4 => "m4a",
            ContainerHint::Aac => "aac",
            ContainerHint::Flac => "flac",
            ContainerHint::Wav => "wav",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "webm" => Some(ContainerHint::WebmOpus),
            "ogg" => Some(ContainerHint::OggOpus),
            "mp3" => Some(ContainerHint::Mp3),
            "m4a" | "mp4" => Some(ContainerHint::Mp4),
            "aac" => Some(ContainerHint::Aac),
            "flac" => Some(ContainerHint::Flac),
            "wav" => Some(ContainerHint::Wav),
            _ => None,
        }
    }

    /// MIME type used when forwarding un-stitched bytes to the transcriber
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContainerHint::WebmOpus => "audio/webm",
            ContainerHint::OggOpus => "audio/ogg",
            ContainerHint::Mp3 => "audio/mpeg",
            ContainerHint::Mp4 => "audio/mp4",
            ContainerHint::Aac => "audio/aac",
            ContainerHint::Flac => "audio/flac",
            ContainerHint::Wav => "audio/wav",
        }
    }

    /// Fragmented WebM needs header-aware stitching
    pub fn is_webm(&self) -> bool {
        matches!(self, ContainerHint::WebmOpus)
    }
}

/// Metadata recorded per accepted fragment, in arrival order
#[derive(Debug, Clone)]
pub struct FragmentMeta {
    pub received_at: DateTime<Utc>,
    pub len: u64,
    pub hint: ContainerHint,
    /// Normalized RMS amplitude reported by the client, if any
    pub energy: Option<f32>,
    /// Client-supplied fragment identifier, if any
    pub fragment_id: Option<String>,
}

/// Per-session runtime buffers. Guarded by the session handle's mutex so
/// ingest and scheduler ticks never observe partial state.
#[derive(Debug, Default)]
pub struct SessionBuffers {
    /// Fragment payloads awaiting the next stitch, in arrival order
    pub payloads: Vec<Vec<u8>>,
    /// Metadata parallel to `payloads`
    pub meta: Vec<FragmentMeta>,
    /// Cumulative bytes accepted over the session lifetime (never resets)
    pub total_bytes: u64,
    /// Hash of the last successfully transcribed batch
    pub last_transcribed_hash: Option<String>,
}

impl SessionBuffers {
    pub fn push(&mut self, payload: Vec<u8>, meta: FragmentMeta) {
        self.total_bytes += meta.len;
        self.payloads.push(payload);
        self.meta.push(meta);
    }

    /// Take all buffered fragments, leaving the buffers empty
    pub fn drain(&mut self) -> (Vec<Vec<u8>>, Vec<FragmentMeta>) {
        (
            std::mem::take(&mut self.payloads),
            std::mem::take(&mut self.meta),
        )
    }

    /// Put a failed batch back at the head, ahead of anything that arrived
    /// while the pipeline pass was in flight.
    pub fn restore_front(&mut self, payloads: Vec<Vec<u8>>, meta: Vec<FragmentMeta>) {
        let newer_payloads = std::mem::replace(&mut self.payloads, payloads);
        let newer_meta = std::mem::replace(&mut self.meta, meta);
        self.payloads.extend(newer_payloads);
        self.meta.extend(newer_meta);
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(len: u64) -> FragmentMeta {
        FragmentMeta {
            received_at: Utc::now(),
            len,
            hint: ContainerHint::WebmOpus,
            energy: None,
            fragment_id: None,
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Recording,
            SessionStatus::Paused,
            SessionStatus::Processing,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(SessionStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_hint_from_mime_with_codec_parameter() {
        assert_eq!(
            ContainerHint::from_mime_type("audio/webm;codecs=opus"),
            ContainerHint::WebmOpus
        );
        assert_eq!(
            ContainerHint::from_mime_type("audio/ogg; codecs=opus"),
            ContainerHint::OggOpus
        );
    }

    #[test]
    fn test_unknown_mime_defaults_to_webm() {
        assert_eq!(
            ContainerHint::from_mime_type("application/octet-stream"),
            ContainerHint::WebmOpus
        );
    }

    #[test]
    fn test_restore_front_preserves_arrival_order() {
        let mut buffers = SessionBuffers::default();
        buffers.push(vec![1], meta(1));
        buffers.push(vec![2], meta(1));

        let (payloads, metas) = buffers.drain();
        assert!(buffers.is_empty());

        // A fragment arrives while the failed batch is in flight
        buffers.push(vec![3], meta(1));

        buffers.restore_front(payloads, metas);
        let order: Vec<u8> = buffers.payloads.iter().map(|p| p[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_total_bytes_accumulates_across_drains() {
        let mut buffers = SessionBuffers::default();
        buffers.push(vec![0; 100], meta(100));
        buffers.drain();
        buffers.push(vec![0; 50], meta(50));
        assert_eq!(buffers.total_bytes, 150);
    }
}
