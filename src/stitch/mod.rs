//! Fragment stitching
//!
//! Browser recorders emit fragmented container streams: the EBML header of
//! a WebM-Opus capture appears only in the first fragment, so later
//! fragments are not decodable on their own and naive byte concatenation
//! is not decodable either. This module provides:
//! - Pre-stitch gating (size, silence, duplicate suppression)
//! - The `Stitcher` seam the pipeline calls
//! - The ffmpeg-backed production stitcher with its strategy ladder

mod ffmpeg;

pub use ffmpeg::FfmpegStitcher;

use base64::Engine;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::Result;
use crate::session::{ContainerHint, FragmentMeta};

/// One batch of fragments handed to a stitch
pub struct StitchRequest<'a> {
    pub session_id: &'a str,
    /// Fragment payloads in arrival order
    pub payloads: &'a [Vec<u8>],
    /// Container hint per fragment, parallel to `payloads`
    pub hints: &'a [ContainerHint],
    /// On-disk fragment files, parallel to `payloads`
    pub paths: &'a [PathBuf],
}

impl StitchRequest<'_> {
    pub fn combined_bytes(&self) -> Vec<u8> {
        let total: usize = self.payloads.iter().map(|p| p.len()).sum();
        let mut combined = Vec::with_capacity(total);
        for payload in self.payloads {
            combined.extend_from_slice(payload);
        }
        combined
    }
}

/// Stitched, transcriber-ready audio
pub struct StitchedAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl StitchedAudio {
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

#[async_trait::async_trait]
pub trait Stitcher: Send + Sync {
    /// Turn a fragment batch into a single decodable audio artifact.
    /// Implementations must not fail just because one fragment is bad;
    /// an error means every strategy was exhausted.
    async fn stitch(&self, request: StitchRequest<'_>) -> Result<StitchedAudio>;
}

/// Why a batch produced no chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Combined size below the stitch minimum
    TooSmall,
    /// Low client-reported energy on a small batch
    Silence,
    /// Byte-identical to the previously transcribed batch
    Duplicate,
}

/// Gate outcome for one batch
#[derive(Debug)]
pub enum GateDecision {
    Skip(SkipReason),
    Proceed {
        combined_len: usize,
        /// sha256 of the concatenated input bytes
        content_hash: String,
        /// Mean of the client-reported energies, when any were reported
        avg_energy: Option<f32>,
    },
}

/// Gating parameters, lifted from the processor configuration
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub min_stitch_bytes: usize,
    pub silence_energy: f32,
    pub silence_max_bytes: usize,
}

/// Decide whether a batch is worth stitching. Runs before any external
/// tool is spawned; the hash doubles as the duplicate-suppression key.
pub fn gate(
    payloads: &[Vec<u8>],
    metas: &[FragmentMeta],
    config: GateConfig,
    last_hash: Option<&str>,
) -> GateDecision {
    let combined_len: usize = payloads.iter().map(|p| p.len()).sum();
    if combined_len < config.min_stitch_bytes {
        return GateDecision::Skip(SkipReason::TooSmall);
    }

    let energies: Vec<f32> = metas.iter().filter_map(|m| m.energy).collect();
    let avg_energy = if energies.is_empty() {
        None
    } else {
        Some(energies.iter().sum::<f32>() / energies.len() as f32)
    };

    if let Some(avg) = avg_energy {
        if avg < config.silence_energy && combined_len < config.silence_max_bytes {
            return GateDecision::Skip(SkipReason::Silence);
        }
    }

    let mut hasher = Sha256::new();
    for payload in payloads {
        hasher.update(payload);
    }
    let content_hash = format!("{:x}", hasher.finalize());

    if last_hash == Some(content_hash.as_str()) {
        return GateDecision::Skip(SkipReason::Duplicate);
    }

    GateDecision::Proceed {
        combined_len,
        content_hash,
        avg_energy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const CONFIG: GateConfig = GateConfig {
        min_stitch_bytes: 10 * 1024,
        silence_energy: 0.02,
        silence_max_bytes: 40 * 1024,
    };

    fn meta(len: u64, energy: Option<f32>) -> FragmentMeta {
        FragmentMeta {
            received_at: Utc::now(),
            len,
            hint: ContainerHint::WebmOpus,
            energy,
            fragment_id: None,
        }
    }

    fn batch(count: usize, size: usize, energy: Option<f32>) -> (Vec<Vec<u8>>, Vec<FragmentMeta>) {
        let payloads = vec![vec![7u8; size]; count];
        let metas = (0..count).map(|_| meta(size as u64, energy)).collect();
        (payloads, metas)
    }

    #[test]
    fn test_small_batch_is_skipped() {
        let (payloads, metas) = batch(2, 1024, Some(0.5));
        assert!(matches!(
            gate(&payloads, &metas, CONFIG, None),
            GateDecision::Skip(SkipReason::TooSmall)
        ));
    }

    #[test]
    fn test_silent_batch_is_skipped() {
        let (payloads, metas) = batch(30, 1024, Some(0.005));
        assert!(matches!(
            gate(&payloads, &metas, CONFIG, None),
            GateDecision::Skip(SkipReason::Silence)
        ));
    }

    #[test]
    fn test_silent_but_large_batch_proceeds() {
        let (payloads, metas) = batch(50, 1024, Some(0.005));
        assert!(matches!(
            gate(&payloads, &metas, CONFIG, None),
            GateDecision::Proceed { .. }
        ));
    }

    #[test]
    fn test_no_energy_reported_proceeds() {
        let (payloads, metas) = batch(30, 1024, None);
        match gate(&payloads, &metas, CONFIG, None) {
            GateDecision::Proceed { avg_energy, .. } => assert!(avg_energy.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_batch_is_skipped() {
        let (payloads, metas) = batch(30, 1024, Some(0.3));
        let hash = match gate(&payloads, &metas, CONFIG, None) {
            GateDecision::Proceed { content_hash, .. } => content_hash,
            other => panic!("unexpected: {:?}", other),
        };
        assert!(matches!(
            gate(&payloads, &metas, CONFIG, Some(&hash)),
            GateDecision::Skip(SkipReason::Duplicate)
        ));
    }

    #[test]
    fn test_avg_energy_becomes_confidence() {
        let payloads = vec![vec![0u8; 20 * 1024]; 2];
        let metas = vec![meta(20 * 1024, Some(0.2)), meta(20 * 1024, Some(0.4))];
        match gate(&payloads, &metas, CONFIG, None) {
            GateDecision::Proceed { avg_energy, .. } => {
                let avg = avg_energy.unwrap();
                assert!((avg - 0.3).abs() < 1e-6);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
