use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::Result;

/// Durable store for raw audio fragments.
///
/// Layout: `<root>/<session_id>/chunk-<receive_millis>.<ext>`, with a
/// numeric suffix when two fragments land in the same millisecond. Files
/// are fsync'd before the append returns so a crash never loses an
/// acknowledged fragment. An in-memory arrival-order queue per session
/// backs `take_batch`/`restore`; recovery reseeds it from the directory
/// listing.
pub struct FragmentStore {
    root: PathBuf,
    debug_save: bool,
    queues: Mutex<HashMap<String, VecDeque<PathBuf>>>,
}

impl FragmentStore {
    pub fn new(root: PathBuf, debug_save: bool) -> Self {
        Self {
            root,
            debug_save,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Durably write one fragment and enqueue its path
    pub async fn append(
        &self,
        session_id: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
        ext: &str,
    ) -> Result<PathBuf> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let millis = received_at.timestamp_millis();
        let mut path = dir.join(format!("chunk-{}.{}", millis, ext));
        let mut suffix = 1u32;
        while tokio::fs::try_exists(&path).await? {
            path = dir.join(format!("chunk-{}-{}.{}", millis, suffix, ext));
            suffix += 1;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;

        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(session_id.to_string())
            .or_default()
            .push_back(path.clone());

        Ok(path)
    }

    /// Remove and return the first `n` paths in arrival order
    pub fn take_batch(&self, session_id: &str, n: usize) -> Vec<PathBuf> {
        let mut queues = self.queues.lock().unwrap();
        let queue = match queues.get_mut(session_id) {
            Some(q) => q,
            None => return Vec::new(),
        };
        let n = n.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Push paths back to the head of the queue, preserving their order.
    /// Used when a stitch attempt fails and when recovery reseeds.
    pub fn restore(&self, session_id: &str, paths: Vec<PathBuf>) {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(session_id.to_string()).or_default();
        for path in paths.into_iter().rev() {
            queue.push_front(path);
        }
    }

    /// Enumerate all fragment files for a session in arrival order
    pub async fn list(&self, session_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.session_dir(session_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut keyed: Vec<((i64, u32), PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(key) = parse_fragment_name(name) {
                keyed.push((key, path));
            }
        }

        keyed.sort_by_key(|(key, _)| *key);
        Ok(keyed.into_iter().map(|(_, path)| path).collect())
    }

    /// Best-effort delete of consumed fragment files
    pub async fn discard(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("Failed to remove consumed fragment {}: {}", path.display(), e);
            }
        }
    }

    /// Write a stitched debug MP3 alongside the session's fragments
    pub async fn save_debug_artifact(&self, session_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.session_dir(session_id).join("debug");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("combined-{}.mp3", Utc::now().timestamp_millis()));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Delete the session directory. With the debug flag set, stitched
    /// debug MP3s are first moved out to `<root>/debug/<session_id>/`.
    pub async fn purge_session(&self, session_id: &str) -> Result<()> {
        self.queues.lock().unwrap().remove(session_id);

        let dir = self.session_dir(session_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(());
        }

        let debug_dir = dir.join("debug");
        if self.debug_save && tokio::fs::try_exists(&debug_dir).await? {
            let archive = self.root.join("debug").join(session_id);
            tokio::fs::create_dir_all(&archive).await?;
            let mut entries = tokio::fs::read_dir(&debug_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let from = entry.path();
                if let Some(name) = from.file_name() {
                    let to = archive.join(name);
                    if let Err(e) = tokio::fs::rename(&from, &to).await {
                        warn!("Failed to preserve debug artifact {}: {}", from.display(), e);
                    }
                }
            }
            info!("Preserved debug artifacts for session {} in {}", session_id, archive.display());
        }

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    /// Session IDs that have a directory on disk (for recovery)
    pub async fn session_dirs(&self) -> Result<Vec<String>> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                // The debug archive lives under the root but is not a session
                if name == "debug" {
                    continue;
                }
                ids.push(name.to_string());
            }
        }
        Ok(ids)
    }

    /// Delete session directories whose last modification is older than
    /// the retention window. Returns the number of directories removed.
    pub async fn sweep_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for id in self.session_dirs().await? {
            let dir = self.session_dir(&id);
            let modified = match tokio::fs::metadata(&dir).await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if modified < cutoff {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {
                        self.queues.lock().unwrap().remove(&id);
                        info!("Swept expired session directory: {}", dir.display());
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to sweep {}: {}", dir.display(), e),
                }
            }
        }
        Ok(removed)
    }
}

/// Receive instant recorded in a fragment filename, used by recovery to
/// rebuild metadata for fragments that outlived the process
pub fn fragment_receive_time(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let (millis, _) = parse_fragment_name(name)?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Parse `chunk-<millis>[-<seq>].<ext>` into its ordering key
fn parse_fragment_name(name: &str) -> Option<(i64, u32)> {
    let stem = name.strip_prefix("chunk-")?;
    let stem = stem.rsplit_once('.')?.0;
    match stem.split_once('-') {
        Some((millis, seq)) => Some((millis.parse().ok()?, seq.parse().ok()?)),
        None => Some((stem.parse().ok()?, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fragment_name() {
        assert_eq!(parse_fragment_name("chunk-1700000000123.webm"), Some((1700000000123, 0)));
        assert_eq!(parse_fragment_name("chunk-1700000000123-2.webm"), Some((1700000000123, 2)));
        assert_eq!(parse_fragment_name("combined-170.mp3"), None);
        assert_eq!(parse_fragment_name("chunk-abc.webm"), None);
    }

    #[tokio::test]
    async fn test_append_take_restore_order() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path().to_path_buf(), false);
        let at = Utc::now();

        let p1 = store.append("sess-a", b"one", at, "webm").await.unwrap();
        let p2 = store.append("sess-a", b"two", at, "webm").await.unwrap();
        let p3 = store.append("sess-a", b"three", at, "webm").await.unwrap();
        // Same-millisecond appends stay distinct and ordered
        assert_ne!(p1, p2);

        let batch = store.take_batch("sess-a", 2);
        assert_eq!(batch, vec![p1.clone(), p2.clone()]);

        store.restore("sess-a", batch);
        let batch = store.take_batch("sess-a", 3);
        assert_eq!(batch, vec![p1, p2, p3]);
    }

    #[tokio::test]
    async fn test_list_orders_by_receive_time() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path().to_path_buf(), false);

        let t0 = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t1 = t0 + chrono::Duration::milliseconds(500);

        let late = store.append("sess-a", b"late", t1, "webm").await.unwrap();
        let early = store.append("sess-a", b"early", t0, "webm").await.unwrap();

        let listed = store.list("sess-a").await.unwrap();
        assert_eq!(listed, vec![early, late]);
    }

    #[tokio::test]
    async fn test_purge_removes_session_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path().to_path_buf(), false);

        store.append("sess-a", b"data", Utc::now(), "webm").await.unwrap();
        assert!(store.session_dir("sess-a").exists());

        store.purge_session("sess-a").await.unwrap();
        assert!(!store.session_dir("sess-a").exists());
        assert!(store.take_batch("sess-a", 10).is_empty());
    }

    #[tokio::test]
    async fn test_purge_preserves_debug_artifacts_when_enabled() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path().to_path_buf(), true);

        store.append("sess-a", b"data", Utc::now(), "webm").await.unwrap();
        store.save_debug_artifact("sess-a", b"mp3-bytes").await.unwrap();

        store.purge_session("sess-a").await.unwrap();
        assert!(!store.session_dir("sess-a").exists());

        let archive = temp.path().join("debug").join("sess-a");
        let preserved: Vec<_> = std::fs::read_dir(&archive).unwrap().collect();
        assert_eq!(preserved.len(), 1);
    }

    #[tokio::test]
    async fn test_session_dirs_skips_debug_archive() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path().to_path_buf(), true);

        store.append("sess-a", b"data", Utc::now(), "webm").await.unwrap();
        store.save_debug_artifact("sess-a", b"mp3").await.unwrap();
        store.purge_session("sess-a").await.unwrap();
        store.append("sess-b", b"data", Utc::now(), "webm").await.unwrap();

        let mut ids = store.session_dirs().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["sess-b"]);
    }
}
