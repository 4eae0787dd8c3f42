//! Pipeline orchestration
//!
//! The `Processor` owns the session lifecycle and the timer-driven chunk
//! pipeline: ingest → durable store → (tick) stitch → transcribe →
//! persist → fan-out, plus the finalization path that produces the
//! consolidated transcript and summary.
//!
//! Concurrency model: sessions run in parallel; within one session every
//! buffer mutation and every pipeline pass happens under the session
//! handle's mutex, so ingest and ticks are strictly serialized and a
//! second tick can never preempt an in-flight one. Status flips (pause,
//! cancel) use a separate lock and take effect without waiting for an
//! in-flight pass; the pass re-checks status before persisting.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::error::{ProcessorError, Result};
use crate::fanout::{Fanout, SessionEvent};
use crate::session::{
    ContainerHint, FragmentMeta, SessionBuffers, SessionHandle, SessionRegistry, SessionStatus,
};
use crate::stitch::{gate, GateConfig, GateDecision, StitchRequest, Stitcher};
use crate::store::{Database, FragmentStore};
use crate::summarize::{assemble_transcript, scrub_summary, Summarizer, SUMMARY_FALLBACK};
use crate::transcribe::{Transcriber, TranscriptionGateway};

/// Result of one pipeline pass over a fragment batch
enum PassOutcome {
    /// Batch gated out (too small, silent, or duplicate)
    Skipped,
    /// Session was cancelled while the pass was in flight
    Discarded,
    Chunk {
        chunk_index: u32,
        text: String,
        content_hash: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct Processor {
    pub(crate) config: ProcessorConfig,
    pub(crate) debug_save: bool,
    pub(crate) db: Database,
    pub(crate) store: Arc<FragmentStore>,
    pub(crate) stitcher: Arc<dyn Stitcher>,
    pub(crate) gateway: TranscriptionGateway,
    pub(crate) summarizer: Arc<dyn Summarizer>,
    pub(crate) fanout: Fanout,
    pub(crate) registry: SessionRegistry,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        debug_save: bool,
        db: Database,
        store: Arc<FragmentStore>,
        stitcher: Arc<dyn Stitcher>,
        transcriber: Arc<dyn Transcriber>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let gateway = TranscriptionGateway::new(transcriber, db.clone(), &config);
        Self {
            config,
            debug_save,
            db,
            store,
            stitcher,
            gateway,
            summarizer,
            fanout: Fanout::new(),
            registry: SessionRegistry::new(),
        }
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> &Arc<FragmentStore> {
        &self.store
    }

    /// Create a session: persists the row in Recording state and installs
    /// the in-memory entry. Fails if the ID collides.
    pub async fn initialize_session(
        &self,
        session_id: &str,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<()> {
        let created_at = Utc::now();
        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| format!("Recording {}", created_at.format("%Y-%m-%d %H:%M")));

        if !self.db.insert_session(session_id, user_id, &title, created_at)? {
            let state = self
                .db
                .get_session(session_id)?
                .map(|row| row.status)
                .unwrap_or(SessionStatus::Cancelled);
            return Err(ProcessorError::BadState {
                operation: "start-recording",
                state,
            });
        }

        let handle = Arc::new(SessionHandle::new(
            session_id.to_string(),
            user_id.to_string(),
            created_at,
            SessionStatus::Recording,
        ));
        if !self.registry.insert(handle).await {
            return Err(ProcessorError::BadState {
                operation: "start-recording",
                state: SessionStatus::Recording,
            });
        }

        info!("Session {} initialized for user {}", session_id, user_id);
        self.fanout.publish_status(session_id, SessionStatus::Recording);
        Ok(())
    }

    /// Accept one fragment. Near-empty fragments are silently dropped;
    /// anything past the session byte cap fails with `BufferOverflow`.
    pub async fn add_fragment(
        &self,
        session_id: &str,
        payload: Vec<u8>,
        hint: ContainerHint,
        energy: Option<f32>,
        fragment_id: Option<String>,
    ) -> Result<()> {
        let handle = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| ProcessorError::NotFound(session_id.to_string()))?;

        let status = handle.status().await;
        if !status.accepts_fragments() {
            return Err(ProcessorError::BadState {
                operation: "audio-chunk",
                state: status,
            });
        }

        // Browser recorders emit near-empty tail fragments that
        // destabilize the stitcher; they never count against the cap.
        if payload.len() < self.config.min_fragment_bytes {
            debug!(
                "Dropping {}-byte fragment for session {} (below fragment minimum)",
                payload.len(),
                session_id
            );
            return Ok(());
        }

        let len = payload.len() as u64;
        {
            let mut bufs = handle.buffers.lock().await;
            if bufs.total_bytes + len > self.config.max_session_bytes {
                return Err(ProcessorError::BufferOverflow);
            }

            let received_at = Utc::now();
            self.store
                .append(session_id, &payload, received_at, hint.extension())
                .await?;
            bufs.push(
                payload,
                FragmentMeta {
                    received_at,
                    len,
                    hint,
                    energy,
                    fragment_id,
                },
            );
        }

        if status == SessionStatus::Recording && !handle.scheduler_armed().await {
            self.arm_scheduler(handle).await;
        }
        Ok(())
    }

    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let handle = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| ProcessorError::NotFound(session_id.to_string()))?;

        let status = handle.status().await;
        if status != SessionStatus::Recording {
            return Err(ProcessorError::BadState {
                operation: "pause-recording",
                state: status,
            });
        }

        // Wait out any in-flight pass so disarming never drops a batch
        {
            let _bufs = handle.buffers.lock().await;
            handle.disarm_scheduler().await;
        }
        self.transition(&handle, SessionStatus::Paused).await?;
        info!("Session {} paused", session_id);
        Ok(())
    }

    pub async fn resume(&self, session_id: &str) -> Result<()> {
        let handle = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| ProcessorError::NotFound(session_id.to_string()))?;

        let status = handle.status().await;
        if status != SessionStatus::Paused {
            return Err(ProcessorError::BadState {
                operation: "resume-recording",
                state: status,
            });
        }

        self.transition(&handle, SessionStatus::Recording).await?;
        self.arm_scheduler(handle).await;
        info!("Session {} resumed", session_id);
        Ok(())
    }

    /// Finalize a session: drain, disarm, assemble the transcript, invoke
    /// the summarizer, persist, clean up. Returns (transcript, summary).
    /// Calling stop on an already-completed session returns the stored
    /// result unchanged.
    pub async fn stop(&self, session_id: &str) -> Result<(String, String)> {
        let handle = match self.registry.get(session_id).await {
            Some(handle) => handle,
            None => {
                let row = self
                    .db
                    .get_session(session_id)?
                    .ok_or_else(|| ProcessorError::NotFound(session_id.to_string()))?;
                return match row.status {
                    SessionStatus::Completed => Ok((
                        row.transcript_text.unwrap_or_default(),
                        row.summary.unwrap_or_default(),
                    )),
                    state => Err(ProcessorError::BadState {
                        operation: "stop-recording",
                        state,
                    }),
                };
            }
        };

        // Drain: one final synchronous pass over anything still buffered
        {
            let mut bufs = handle.buffers.lock().await;
            if !bufs.is_empty() {
                if let Err(e) = self.pipeline_pass(&handle, &mut bufs).await {
                    warn!("Drain pass failed while stopping {}: {}", session_id, e);
                }
            }
            // Clear in-memory state; the start instant lives on the handle
            bufs.payloads.clear();
            bufs.meta.clear();
        }

        handle.disarm_scheduler().await;
        self.transition(&handle, SessionStatus::Processing).await?;

        let chunks = self.db.chunks(session_id)?;
        let transcript = assemble_transcript(&chunks);
        let summary = match self.summarizer.summarize(&transcript).await {
            Ok(raw) => scrub_summary(&raw, &transcript),
            Err(e) => {
                error!("Summarizer failed for session {}: {}", session_id, e);
                SUMMARY_FALLBACK.to_string()
            }
        };

        let duration_secs = (Utc::now() - handle.started_at).num_milliseconds() as f64 / 1000.0;
        self.db
            .finalize_session(session_id, &transcript, &summary, duration_secs)?;
        handle.set_status(SessionStatus::Completed).await;
        self.fanout.publish_status(session_id, SessionStatus::Completed);
        self.fanout.publish(
            session_id,
            SessionEvent::Completed {
                session_id: session_id.to_string(),
                transcript: transcript.clone(),
                summary: summary.clone(),
            },
        );

        if let Err(e) = self.store.purge_session(session_id).await {
            warn!("Failed to purge fragments for session {}: {}", session_id, e);
        }
        self.registry.remove(session_id).await;
        self.fanout.remove(session_id);

        info!(
            "Session {} completed ({:.1}s, {} chunks)",
            session_id,
            duration_secs,
            chunks.len()
        );
        Ok((transcript, summary))
    }

    /// Tear the session down without summarizing. Effective immediately
    /// for future ticks; an in-flight pass discards its result when it
    /// observes the cancelled state. Idempotent.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let handle = match self.registry.get(session_id).await {
            Some(handle) => handle,
            None => {
                let row = self
                    .db
                    .get_session(session_id)?
                    .ok_or_else(|| ProcessorError::NotFound(session_id.to_string()))?;
                return match row.status {
                    SessionStatus::Cancelled => Ok(()),
                    state => Err(ProcessorError::BadState {
                        operation: "cancel-recording",
                        state,
                    }),
                };
            }
        };

        handle.disarm_scheduler().await;
        handle.set_status(SessionStatus::Cancelled).await;
        self.db.update_status(session_id, SessionStatus::Cancelled)?;
        self.fanout.publish_status(session_id, SessionStatus::Cancelled);

        if let Err(e) = self.store.purge_session(session_id).await {
            warn!("Failed to purge fragments for session {}: {}", session_id, e);
        }
        self.registry.remove(session_id).await;
        self.fanout.remove(session_id);

        info!("Session {} cancelled", session_id);
        Ok(())
    }

    async fn transition(&self, handle: &SessionHandle, status: SessionStatus) -> Result<()> {
        handle.set_status(status).await;
        self.db.update_status(&handle.id, status)?;
        self.fanout.publish_status(&handle.id, status);
        Ok(())
    }

    /// Spawn the per-session tick task
    pub(crate) async fn arm_scheduler(&self, handle: Arc<SessionHandle>) {
        let processor = self.clone();
        let session_id = handle.id.clone();
        let period = self.config.chunk_period();

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !processor.scheduled_tick(&session_id).await {
                    break;
                }
            }
        });
        handle.arm_scheduler(task).await;
    }

    /// One timer tick. Returns false when the scheduler should disarm.
    async fn scheduled_tick(&self, session_id: &str) -> bool {
        let handle = match self.registry.get(session_id).await {
            Some(handle) => handle,
            None => return false,
        };

        // A straggler tick after stop/pause/cancel does no work
        let status = handle.status().await;
        if status != SessionStatus::Recording {
            debug!(
                "Tick for session {} in state {:?}, disarming",
                session_id, status
            );
            return false;
        }

        let mut bufs = handle.buffers.lock().await;
        match self.pipeline_pass(&handle, &mut bufs).await {
            Ok(_) => {}
            Err(e) => warn!(
                "Pipeline pass failed for session {}: {} (fragments restored for next tick)",
                session_id, e
            ),
        }
        true
    }

    /// One stitch-and-transcribe pass over everything currently buffered.
    /// Caller holds the session buffer lock. On failure the batch is
    /// restored, the chunk index does not advance, and the error is
    /// surfaced for logging only.
    pub(crate) async fn pipeline_pass(
        &self,
        handle: &SessionHandle,
        bufs: &mut SessionBuffers,
    ) -> Result<bool> {
        if bufs.is_empty() {
            return Ok(false);
        }

        let (payloads, metas) = bufs.drain();
        let paths = self.store.take_batch(&handle.id, payloads.len());

        match self
            .process_batch(handle, &payloads, &metas, &paths, bufs.last_transcribed_hash.as_deref())
            .await
        {
            Ok(PassOutcome::Chunk {
                chunk_index,
                text,
                content_hash,
                timestamp,
            }) => {
                bufs.last_transcribed_hash = Some(content_hash);
                self.store.discard(&paths).await;
                if !text.trim().is_empty() {
                    self.fanout.publish(
                        &handle.id,
                        SessionEvent::TranscriptUpdate {
                            session_id: handle.id.clone(),
                            chunk_index,
                            text,
                            timestamp,
                        },
                    );
                }
                Ok(true)
            }
            Ok(PassOutcome::Skipped) => {
                self.store.discard(&paths).await;
                Ok(false)
            }
            Ok(PassOutcome::Discarded) => Ok(false),
            Err(e) => {
                self.store.restore(&handle.id, paths);
                bufs.restore_front(payloads, metas);
                Err(e)
            }
        }
    }

    async fn process_batch(
        &self,
        handle: &SessionHandle,
        payloads: &[Vec<u8>],
        metas: &[FragmentMeta],
        paths: &[std::path::PathBuf],
        last_hash: Option<&str>,
    ) -> Result<PassOutcome> {
        let gate_config = GateConfig {
            min_stitch_bytes: self.config.min_stitch_bytes,
            silence_energy: self.config.silence_energy,
            silence_max_bytes: self.config.silence_max_bytes,
        };

        let (content_hash, avg_energy) = match gate(payloads, metas, gate_config, last_hash) {
            GateDecision::Skip(reason) => {
                debug!("Skipping batch for session {}: {:?}", handle.id, reason);
                return Ok(PassOutcome::Skipped);
            }
            GateDecision::Proceed {
                combined_len,
                content_hash,
                avg_energy,
            } => {
                debug!(
                    "Stitching {} fragments ({} bytes) for session {}",
                    payloads.len(),
                    combined_len,
                    handle.id
                );
                (content_hash, avg_energy)
            }
        };

        let hints: Vec<ContainerHint> = metas.iter().map(|m| m.hint).collect();
        let stitched = self
            .stitcher
            .stitch(StitchRequest {
                session_id: &handle.id,
                payloads,
                hints: &hints,
                paths,
            })
            .await?;

        if self.debug_save && stitched.mime_type == "audio/mpeg" {
            if let Err(e) = self.store.save_debug_artifact(&handle.id, &stitched.bytes).await {
                warn!("Failed to save debug artifact for {}: {}", handle.id, e);
            }
        }

        let text = self
            .gateway
            .transcribe_chunk(&handle.id, &stitched.to_base64(), &stitched.mime_type)
            .await?;

        // Post-flight: a cancel issued during the stitch or the
        // transcriber call wins; the result is discarded.
        if handle.status().await == SessionStatus::Cancelled {
            info!(
                "Discarding in-flight chunk result for cancelled session {}",
                handle.id
            );
            return Ok(PassOutcome::Discarded);
        }

        let chunk_index = self.db.chunk_count(&handle.id)?;
        let timestamp = Utc::now();
        self.db
            .insert_chunk(&handle.id, chunk_index, &text, timestamp, avg_energy)?;

        info!(
            "Session {} chunk {} transcribed ({} chars)",
            handle.id,
            chunk_index,
            text.len()
        );

        Ok(PassOutcome::Chunk {
            chunk_index,
            text,
            content_hash,
            timestamp,
        })
    }
}
