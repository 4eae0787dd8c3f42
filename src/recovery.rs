//! Crash recovery
//!
//! On startup every directory under the fragment root is checked against
//! the session table. Sessions that were Recording or Processing when the
//! process died are re-attached: their buffers are rebuilt from the
//! on-disk fragments, a Processing session gets one immediate drain pass,
//! and a Recording session gets its scheduler re-armed.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::processor::Processor;
use crate::session::{ContainerHint, FragmentMeta, SessionHandle, SessionStatus};
use crate::store::fragment_receive_time;

impl Processor {
    /// Re-attach in-flight sessions from disk. Returns how many were
    /// recovered; individual failures skip that session only.
    pub async fn recover(&self) -> Result<usize> {
        let session_ids = self.store.session_dirs().await?;
        let mut recovered = 0;

        for session_id in session_ids {
            match self.recover_session(&session_id).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to recover session {}: {}", session_id, e),
            }
        }

        if recovered > 0 {
            info!("Recovered {} in-flight sessions", recovered);
        }
        Ok(recovered)
    }

    async fn recover_session(&self, session_id: &str) -> Result<bool> {
        let row = match self.db.get_session(session_id)? {
            Some(row) => row,
            None => {
                debug!(
                    "Fragment directory {} has no session row, leaving for the sweep",
                    session_id
                );
                return Ok(false);
            }
        };

        if !matches!(
            row.status,
            SessionStatus::Recording | SessionStatus::Processing
        ) {
            debug!(
                "Session {} is {:?}, not recovering",
                session_id, row.status
            );
            return Ok(false);
        }

        let paths = self.store.list(session_id).await?;
        self.store.restore(session_id, paths.clone());

        let handle = Arc::new(SessionHandle::new(
            session_id.to_string(),
            row.user_id.clone(),
            row.created_at,
            row.status,
        ));

        let mut total = 0u64;
        {
            let mut bufs = handle.buffers.lock().await;
            for path in &paths {
                let payload = tokio::fs::read(path).await?;
                let hint = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .and_then(ContainerHint::from_extension)
                    .unwrap_or(ContainerHint::WebmOpus);
                let meta = FragmentMeta {
                    received_at: fragment_receive_time(path).unwrap_or_else(Utc::now),
                    len: payload.len() as u64,
                    hint,
                    energy: None,
                    fragment_id: None,
                };
                total += meta.len;
                bufs.push(payload, meta);
            }
        }

        if !self.registry.insert(handle.clone()).await {
            warn!("Session {} already resident, skipping recovery", session_id);
            return Ok(false);
        }

        info!(
            "Recovered session {} ({:?}, {} fragments, {} bytes)",
            session_id,
            row.status,
            paths.len(),
            total
        );

        match row.status {
            SessionStatus::Processing => {
                // Finish the interrupted drain; the session stays resident
                // in Processing until the client stops it again.
                let mut bufs = handle.buffers.lock().await;
                if let Err(e) = self.pipeline_pass(&handle, &mut bufs).await {
                    warn!("Recovery drain pass failed for {}: {}", session_id, e);
                }
            }
            _ => self.arm_scheduler(handle).await,
        }

        Ok(true)
    }
}
