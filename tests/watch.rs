mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use common::{eventually, Fixture, HashEmbedder, DIMS, DOCKER_DOC, NOTES_DOC, PYTHON_DOC};
use grounded_kb::watch::{spawn_watch_loop, WatchEvent, WatchState};
use grounded_kb_core::embedding::Embedder;

const DEBOUNCE: Duration = Duration::from_millis(60);

#[tokio::test]
async fn test_startup_sync_catches_offline_changes() {
    let fx = Fixture::new();
    fx.write("docker/run.md", DOCKER_DOC);
    fx.write("notes.txt", NOTES_DOC);

    let handle = spawn_watch_loop(fx.sync.clone(), DEBOUNCE, 16);
    let store = fx.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.index_state().await.unwrap().len() == 2 }
        })
        .await
    );

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.rescans, 1);
    assert_eq!(summary.applied, 2);
}

#[tokio::test]
async fn test_burst_of_events_is_applied_once() {
    let fx = Fixture::new();
    let handle = spawn_watch_loop(fx.sync.clone(), DEBOUNCE, 16);

    let path = fx.write("docker/run.md", DOCKER_DOC);
    for _ in 0..5 {
        handle.push(WatchEvent::Upsert(path.clone())).await.unwrap();
    }

    let store = fx.store.clone();
    let key = fx.key("docker/run.md");
    assert!(
        eventually(|| {
            let (store, key) = (store.clone(), key.clone());
            async move { store.document_state(&key).await.unwrap().is_some() }
        })
        .await
    );

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.applied, 1);
}

#[tokio::test]
async fn test_rename_is_delete_plus_add() {
    let fx = Fixture::new();
    let from = fx.write("python/venv.md", PYTHON_DOC);
    let handle = spawn_watch_loop(fx.sync.clone(), DEBOUNCE, 16);

    let store = fx.store.clone();
    let old_key = fx.key("python/venv.md");
    assert!(
        eventually(|| {
            let (store, key) = (store.clone(), old_key.clone());
            async move { store.document_state(&key).await.unwrap().is_some() }
        })
        .await
    );

    let to = fx.root.join("python/virtualenv.md");
    fs::rename(&from, &to).unwrap();
    handle
        .push(WatchEvent::Rename {
            from: from.clone(),
            to: to.clone(),
        })
        .await
        .unwrap();

    let new_key = fx.key("python/virtualenv.md");
    assert!(
        eventually(|| {
            let store = store.clone();
            let (old_key, new_key) = (old_key.clone(), new_key.clone());
            async move {
                let state = store.index_state().await.unwrap();
                !state.contains_key(&old_key) && state.contains_key(&new_key)
            }
        })
        .await
    );
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_remove_event_deletes_document() {
    let fx = Fixture::new();
    let path = fx.write("notes.txt", NOTES_DOC);
    let handle = spawn_watch_loop(fx.sync.clone(), DEBOUNCE, 16);

    let store = fx.store.clone();
    let key = fx.key("notes.txt");
    assert!(
        eventually(|| {
            let (store, key) = (store.clone(), key.clone());
            async move { store.document_state(&key).await.unwrap().is_some() }
        })
        .await
    );

    fs::remove_file(&path).unwrap();
    handle.push(WatchEvent::Remove(path)).await.unwrap();
    assert!(
        eventually(|| {
            let (store, key) = (store.clone(), key.clone());
            async move { store.document_state(&key).await.unwrap().is_none() }
        })
        .await
    );
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_loop_returns_to_idle() {
    let fx = Fixture::new();
    let handle = spawn_watch_loop(fx.sync.clone(), DEBOUNCE, 16);
    let path = fx.write("notes.txt", NOTES_DOC);
    handle.push(WatchEvent::Upsert(path)).await.unwrap();

    let mut state = handle.subscribe();
    let idle = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let idle_now = *state.borrow_and_update() == WatchState::Idle;
            if idle_now
                && handle.state() == WatchState::Idle
                && fx
                    .store
                    .document_state(&fx.key("notes.txt"))
                    .await
                    .unwrap()
                    .is_some()
            {
                break;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(idle.is_ok());
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_with_pending_events_leaves_store_consistent() {
    let fx = Fixture::new();
    let handle = spawn_watch_loop(fx.sync.clone(), Duration::from_secs(30), 16);
    let mut state = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WatchState::Idle),
    )
    .await
    .unwrap()
    .unwrap();

    let path = fx.write("docker/run.md", DOCKER_DOC);
    handle.push(WatchEvent::Upsert(path)).await.unwrap();

    // Still debouncing: stop drops the pending path instead of applying it.
    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.applied, 0);
    assert!(fx.store.index_state().await.unwrap().is_empty());

    // The next startup sync picks it up.
    let report = fx.sync.sync_all().await.unwrap();
    assert_eq!(report.added, 1);
}

/// Takes long enough per call that a test can catch the loop mid-apply.
struct SlowEmbedder(Duration);

#[async_trait]
impl Embedder for SlowEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.0).await;
        Ok(texts.iter().map(|t| HashEmbedder::vector(t)).collect())
    }
}

#[tokio::test]
async fn test_stop_during_apply_finishes_the_document() {
    let fx = Fixture::new();
    let slow = Arc::new(fx.with_embedder(Arc::new(SlowEmbedder(Duration::from_millis(500)))));
    let handle = spawn_watch_loop(slow, Duration::from_millis(20), 16);
    let mut state = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WatchState::Idle),
    )
    .await
    .unwrap()
    .unwrap();

    let path = fx.write("docker/run.md", DOCKER_DOC);
    handle.push(WatchEvent::Upsert(path)).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WatchState::Applying),
    )
    .await
    .unwrap()
    .unwrap();

    let summary = handle.stop().await.unwrap();
    assert_eq!(summary.applied, 1);

    let doc = fx
        .store
        .document_state(&fx.key("docker/run.md"))
        .await
        .unwrap()
        .expect("in-flight document must be stored");
    let stats = fx.store.stats().await.unwrap();
    assert_eq!(stats.total_chunks, doc.chunk_ids.len());
    assert_eq!(stats.embedded_chunks, doc.chunk_ids.len());
}
