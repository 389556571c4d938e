// Integration tests for session lifecycle
//
// These tests drive the session manager through chunk accounting, result
// merging, timeouts, eviction and the audio artifact it leaves behind.

use anyhow::Result;
use asr_gateway::config::{SessionConfig, StorageConfig};
use asr_gateway::session::{
    FileSessionStore, MemorySessionStore, SessionError, SessionManager, SessionStatus, SessionStore,
    ANONYMOUS_OWNER,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn session_config(merge_timeout_secs: u64) -> SessionConfig {
    SessionConfig {
        merge_timeout_secs,
        ..Default::default()
    }
}

fn storage(root: &Path) -> StorageConfig {
    StorageConfig {
        root: root.to_path_buf(),
        max_audio_files_per_user: 10,
    }
}

fn manager(root: &Path, config: SessionConfig) -> (Arc<SessionManager>, Arc<MemorySessionStore>) {
    let store = Arc::new(MemorySessionStore::new());
    let manager = SessionManager::new(config, &storage(root), store.clone());
    (Arc::new(manager), store)
}

/// 100ms of 16 kHz mono PCM
fn pcm_chunk(value: i16) -> Vec<u8> {
    (0..1600).flat_map(|_| value.to_le_bytes()).collect()
}

#[tokio::test]
async fn test_results_merge_in_index_order() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(60));

    sessions.create_session("s1", "u1").await;
    for idx in 0..3 {
        assert!(sessions.add_chunk("s1", idx, &pcm_chunk(0)).await);
    }

    // Results complete out of order
    sessions.set_result("s1", 2, "c", None).await;
    sessions.set_result("s1", 0, "a", None).await;
    sessions.set_result("s1", 1, "b", None).await;

    assert_eq!(sessions.pending("s1").await, Some(0));

    let transcript = sessions.wait_and_merge("s1").await;
    assert_eq!(transcript.text, "abc");
    assert_eq!(transcript.chunk_count, 3);

    let session = sessions.get_session("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Done);
    assert!(session.completed_at.is_some());

    Ok(())
}

#[tokio::test]
async fn test_finish_waits_for_outstanding_results() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(30));

    sessions.create_session("s1", "u1").await;
    for idx in 0..3 {
        sessions.add_chunk("s1", idx, &pcm_chunk(0)).await;
    }

    let finishing = {
        let sessions = sessions.clone();
        tokio::spawn(async move { sessions.wait_and_merge("s1").await })
    };

    // Let the finish flip the status before results arrive
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        sessions.get_session("s1").await.unwrap().status,
        SessionStatus::Finishing
    );

    let started = Instant::now();
    sessions.set_result("s1", 1, "world", None).await;
    sessions.set_result("s1", 0, "hello ", None).await;
    sessions.set_result("s1", 2, "!", None).await;

    let transcript = finishing.await?;
    assert_eq!(transcript.text, "hello world!");
    assert!(started.elapsed() < Duration::from_secs(5));

    Ok(())
}

#[tokio::test]
async fn test_missing_chunk_is_skipped_after_timeout() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(1));

    sessions.create_session("s1", "u1").await;
    for idx in 0..3 {
        sessions.add_chunk("s1", idx, &pcm_chunk(0)).await;
    }
    sessions.set_result("s1", 0, "a", None).await;
    sessions.set_result("s1", 2, "c", None).await;

    let started = Instant::now();
    let transcript = sessions.wait_and_merge("s1").await;
    let elapsed = started.elapsed();

    assert_eq!(transcript.text, "ac");
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(5), "merge took {:?}", elapsed);

    Ok(())
}

#[tokio::test]
async fn test_repeated_results_do_not_change_pending() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(60));

    sessions.create_session("s1", "u1").await;
    sessions.add_chunk("s1", 0, &pcm_chunk(0)).await;
    sessions.add_chunk("s1", 1, &pcm_chunk(0)).await;
    assert_eq!(sessions.pending("s1").await, Some(2));

    assert!(sessions.set_result("s1", 0, "first", None).await);
    assert!(sessions.set_result("s1", 0, "second", None).await);
    assert_eq!(sessions.pending("s1").await, Some(1));

    // A result for a chunk that was never accepted
    assert!(!sessions.set_result("s1", 7, "stray", None).await);
    assert_eq!(sessions.pending("s1").await, Some(1));

    let session = sessions.get_session("s1").await.unwrap();
    assert_eq!(session.results.get(&0).map(String::as_str), Some("second"));
    assert!(!session.results.contains_key(&7));

    Ok(())
}

#[tokio::test]
async fn test_failed_chunk_contributes_no_text() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(60));

    sessions.create_session("s1", "u1").await;
    sessions.add_chunk("s1", 0, &pcm_chunk(0)).await;
    sessions.add_chunk("s1", 1, &pcm_chunk(0)).await;

    sessions.set_result("s1", 0, "ok", None).await;
    sessions.set_result("s1", 1, "", Some("engine error")).await;

    let session = sessions.get_session("s1").await.unwrap();
    assert_eq!(session.errors.get(&1).map(String::as_str), Some("engine error"));

    let transcript = sessions.wait_and_merge("s1").await;
    assert_eq!(transcript.text, "ok");

    Ok(())
}

#[tokio::test]
async fn test_unknown_session_operations_are_noops() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(60));

    assert!(!sessions.add_chunk("missing", 0, &pcm_chunk(0)).await);
    assert!(!sessions.set_result("missing", 0, "x", None).await);

    let transcript = sessions.wait_and_merge("missing").await;
    assert_eq!(transcript.text, "");
    assert_eq!(transcript.duration, 0.0);

    Ok(())
}

#[tokio::test]
async fn test_create_assigns_id_and_owner() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, store) = manager(temp.path(), session_config(60));

    let session = sessions.create_session("", "").await;
    assert!(!session.id.is_empty());
    assert_eq!(session.owner, ANONYMOUS_OWNER);
    assert_eq!(session.status, SessionStatus::Recording);

    let record = store.get(&session.id).await?.unwrap();
    assert_eq!(record.status, SessionStatus::Recording);

    Ok(())
}

#[tokio::test]
async fn test_duplicate_create_reuses_live_session() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(60));

    sessions.create_session("s1", "u1").await;
    sessions.add_chunk("s1", 0, &pcm_chunk(0)).await;

    let again = sessions.create_session("s1", "u1").await;
    assert_eq!(again.chunk_count, 1);
    assert_eq!(sessions.active_count(), 1);

    sessions.set_result("s1", 0, "done", None).await;
    sessions.wait_and_merge("s1").await;

    // A finished session is replaced by a fresh one
    let fresh = sessions.create_session("s1", "u1").await;
    assert_eq!(fresh.chunk_count, 0);
    assert_eq!(fresh.status, SessionStatus::Recording);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_creates_register_one_session() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(60));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.create_session("shared", "u1").await })
        })
        .collect();

    let mut created = Vec::new();
    for handle in handles {
        created.push(handle.await?);
    }

    assert_eq!(sessions.active_count(), 1);
    let first = &created[0];
    assert!(created.iter().all(|s| s.created_at == first.created_at));

    // Only the registered buffer remains on disk
    let buffers = std::fs::read_dir(temp.path().join("temp"))?.count();
    assert_eq!(buffers, 1);

    Ok(())
}

#[tokio::test]
async fn test_second_finish_returns_stored_transcript() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, _) = manager(temp.path(), session_config(60));

    sessions.create_session("s1", "u1").await;
    sessions.add_chunk("s1", 0, &pcm_chunk(0)).await;
    sessions.set_result("s1", 0, "once", None).await;

    let first = sessions.wait_and_merge("s1").await;
    let second = sessions.wait_and_merge("s1").await;
    assert_eq!(first, second);

    Ok(())
}

#[tokio::test]
async fn test_delete_session() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, store) = manager(temp.path(), session_config(60));

    match sessions.delete_session("never-created").await {
        Err(SessionError::NotFound(id)) => assert_eq!(id, "never-created"),
        other => panic!("expected not found, got {:?}", other),
    }

    sessions.create_session("s1", "u1").await;
    sessions.delete_session("s1").await?;

    assert!(sessions.get_session("s1").await.is_none());
    assert!(store.get("s1").await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_sweep_evicts_idle_sessions_only() -> Result<()> {
    let temp = TempDir::new()?;
    let config = SessionConfig {
        inactivity_timeout_secs: 0,
        ..session_config(60)
    };
    let (sessions, store) = manager(temp.path(), config);

    sessions.create_session("idle", "u1").await;
    sessions.create_session("finished", "u1").await;
    sessions.wait_and_merge("finished").await;

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(sessions.sweep_expired().await, 1);
    assert!(!sessions.contains("idle"));
    assert!(sessions.contains("finished"));

    // Durable records survive eviction
    assert!(store.get("idle").await?.is_some());

    // The evicted session's temporary buffer is gone
    let buffers = std::fs::read_dir(temp.path().join("temp"))?.count();
    assert_eq!(buffers, 0);

    Ok(())
}

#[tokio::test]
async fn test_sweep_spares_finishing_sessions_by_default() -> Result<()> {
    let temp = TempDir::new()?;
    let config = SessionConfig {
        inactivity_timeout_secs: 0,
        ..session_config(30)
    };
    let (sessions, _) = manager(temp.path(), config);

    sessions.create_session("slow", "u1").await;
    sessions.add_chunk("slow", 0, &pcm_chunk(0)).await;

    let finishing = {
        let sessions = sessions.clone();
        tokio::spawn(async move { sessions.wait_and_merge("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sessions.sweep_expired().await, 0);
    assert!(sessions.contains("slow"));

    sessions.set_result("slow", 0, "late", None).await;
    assert_eq!(finishing.await?.text, "late");

    Ok(())
}

#[tokio::test]
async fn test_finish_saves_wav_recording() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, store) = manager(temp.path(), session_config(60));

    sessions.create_session("rec-1", "u1").await;
    sessions.add_chunk("rec-1", 0, &pcm_chunk(100)).await;
    sessions.add_chunk("rec-1", 1, &pcm_chunk(-100)).await;
    sessions.set_result("rec-1", 0, "a", None).await;
    sessions.set_result("rec-1", 1, "b", None).await;

    sessions.wait_and_merge("rec-1").await;

    let expected = temp.path().join("recordings").join("u1").join("rec-1.wav");
    assert!(expected.exists(), "Recording should exist at {:?}", expected);

    let reader = hound::WavReader::open(&expected)?;
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 3200);

    // 44-byte header plus the raw audio
    assert_eq!(std::fs::metadata(&expected)?.len(), 44 + 6400);

    // Temporary buffer removed
    assert_eq!(std::fs::read_dir(temp.path().join("temp"))?.count(), 0);

    let record = store.get("rec-1").await?.unwrap();
    assert_eq!(record.status, SessionStatus::Done);
    assert_eq!(record.final_text, "ab");
    assert_eq!(record.chunk_count, 2);
    assert_eq!(record.audio_path, Some(expected.display().to_string()));

    Ok(())
}

#[tokio::test]
async fn test_delete_never_touches_lookalike_session() -> Result<()> {
    let temp = TempDir::new()?;
    let store = Arc::new(FileSessionStore::open(temp.path().join("sessions")).await?);
    let sessions = SessionManager::new(session_config(60), &storage(temp.path()), store.clone());

    sessions.create_session("a_b", "u1").await;

    assert!(matches!(
        sessions.delete_session("a.b").await,
        Err(SessionError::NotFound(_))
    ));
    assert!(sessions.contains("a_b"));
    assert_eq!(sessions.record("a_b").await?.unwrap().id, "a_b");
    assert!(sessions.record("a.b").await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_lookalike_ids_keep_separate_recordings() -> Result<()> {
    let temp = TempDir::new()?;
    let (sessions, store) = manager(temp.path(), session_config(60));

    for (id, sample) in [("a.b", 1), ("a_b", 2), ("a/b", 3)] {
        sessions.create_session(id, "u1").await;
        sessions.add_chunk(id, 0, &pcm_chunk(sample)).await;
        sessions.set_result(id, 0, id, None).await;
        sessions.wait_and_merge(id).await;
    }

    let mut paths = Vec::new();
    for (id, sample) in [("a.b", 1i16), ("a_b", 2), ("a/b", 3)] {
        let path = store.get(id).await?.unwrap().audio_path.unwrap();
        let mut reader = hound::WavReader::open(&path)?;
        let first: i16 = reader.samples::<i16>().next().unwrap()?;
        assert_eq!(first, sample, "recording of {} was overwritten", id);
        paths.push(path);
    }
    let unique: std::collections::HashSet<_> = paths.iter().collect();
    assert_eq!(unique.len(), 3);

    let user_dir = temp.path().join("recordings").join("u1");
    assert_eq!(std::fs::read_dir(user_dir)?.count(), 3);

    Ok(())
}
