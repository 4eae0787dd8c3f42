// Crash-recovery scenarios: a second processor over the same fragment
// root and database must re-attach in-flight sessions and continue the
// chunk sequence exactly where the dead process left off.

mod support;

use std::time::Duration;

use meetscribe::{ContainerHint, SessionStatus};
use support::*;
use tempfile::TempDir;

const FRAGMENT_SIZE: usize = 4096;

async fn add_fragments(harness: &TestHarness, session_id: &str, count: usize, seed: u8) {
    for i in 0..count {
        harness
            .processor
            .add_fragment(
                session_id,
                fragment(FRAGMENT_SIZE, seed.wrapping_add(i as u8)),
                ContainerHint::WebmOpus,
                Some(0.3),
                None,
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_recovery_reattaches_recording_session() {
    let temp = TempDir::new().unwrap();

    // First process: accept fragments, then vanish without stopping.
    // The long chunk period keeps its timer from ever firing.
    {
        let mut config = test_config();
        config.chunk_period_secs = 300;
        let harness = harness(temp.path(), config);
        harness
            .processor
            .initialize_session("sess-r", "user-1", None)
            .await
            .unwrap();
        add_fragments(&harness, "sess-r", 30, 1).await;
    }

    // Second process over the same root
    let mut config = test_config();
    config.chunk_period_secs = 300;
    let harness = harness(temp.path(), config);
    assert_eq!(harness.processor.recover().await.unwrap(), 1);

    // The recovered buffers produce the same chunk the first process
    // would have: the stop drain transcribes the 30 on-disk fragments.
    let (transcript, _) = harness.processor.stop("sess-r").await.unwrap();
    assert_eq!(transcript, "[Speaker 1]: Stub transcript line 0.");
    assert_eq!(harness.db.chunk_count("sess-r").unwrap(), 1);
}

#[tokio::test]
async fn test_recovery_drains_processing_session_immediately() {
    let temp = TempDir::new().unwrap();

    {
        let mut config = test_config();
        config.chunk_period_secs = 300;
        let harness = harness(temp.path(), config);
        harness
            .processor
            .initialize_session("sess-p", "user-1", None)
            .await
            .unwrap();
        add_fragments(&harness, "sess-p", 30, 1).await;
        // The process died mid-finalization, after flipping the row
        harness
            .db
            .update_status("sess-p", SessionStatus::Processing)
            .unwrap();
    }

    let mut config = test_config();
    config.chunk_period_secs = 300;
    let harness = harness(temp.path(), config);
    assert_eq!(harness.processor.recover().await.unwrap(), 1);

    // The drain pass ran synchronously during recovery
    assert_eq!(harness.db.chunk_count("sess-p").unwrap(), 1);

    // Stop remains legal from Processing and completes the session
    let (transcript, _) = harness.processor.stop("sess-p").await.unwrap();
    assert!(!transcript.is_empty());
    let row = harness.db.get_session("sess-p").unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_recovery_skips_directories_without_a_session_row() {
    let temp = TempDir::new().unwrap();
    let ghost = temp.path().join("sessions").join("ghost");
    std::fs::create_dir_all(&ghost).unwrap();
    std::fs::write(ghost.join("chunk-1700000000000.webm"), b"orphan").unwrap();

    let harness = harness(temp.path(), test_config());
    assert_eq!(harness.processor.recover().await.unwrap(), 0);

    // The directory is left in place for the retention sweep
    assert!(ghost.exists());
}

#[test]
fn test_crash_between_ticks_resumes_chunk_sequence() {
    let temp = TempDir::new().unwrap();

    // Phase one: two chunks land, a third batch is only on disk when the
    // runtime is torn down (killing every scheduler task mid-flight).
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let harness = harness(temp.path(), test_config());
        harness
            .processor
            .initialize_session("sess-s", "user-1", None)
            .await
            .unwrap();

        add_fragments(&harness, "sess-s", 30, 1).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(harness.db.chunk_count("sess-s").unwrap(), 1);

        add_fragments(&harness, "sess-s", 30, 50).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(harness.db.chunk_count("sess-s").unwrap(), 2);

        add_fragments(&harness, "sess-s", 30, 100).await;
    });
    drop(rt);

    // Phase two: restart, recover, and let the timer consume the batch
    // that survived only on disk.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let harness = harness(temp.path(), test_config());
        assert_eq!(harness.db.chunk_count("sess-s").unwrap(), 2);
        assert_eq!(harness.processor.recover().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert_eq!(harness.db.chunk_count("sess-s").unwrap(), 3);

        // Indices are gapless across the restart and the transcript
        // concatenates all three chunks in order
        let rows = harness.db.chunks("sess-s").unwrap();
        let indices: Vec<u32> = rows.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let (transcript, _) = harness.processor.stop("sess-s").await.unwrap();
        assert_eq!(transcript.matches("[Speaker 1]:").count(), 3);
    });
}
