//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use grounded_kb::config::WatchConfig;
use grounded_kb::scan::FileFilter;
use grounded_kb::sync::Synchronizer;
use grounded_kb_core::chunk::ChunkCodec;
use grounded_kb_core::embedding::Embedder;
use grounded_kb_core::store::memory::InMemoryStore;
use grounded_kb_core::store::Store;

pub const DIMS: usize = 64;

/// Deterministic bag-of-words embedder: each lowercase word is hashed
/// into one of `DIMS` buckets, then the vector is normalised. Texts that
/// share words score higher.
#[derive(Default)]
pub struct HashEmbedder {
    pub calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
}

impl HashEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % DIMS as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    pub fn texts(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Always unavailable.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("connection refused")
    }
}

pub fn watch_config(root: &Path) -> WatchConfig {
    WatchConfig {
        root: root.to_path_buf(),
        include_globs: vec!["**/*.md".into(), "**/*.txt".into(), "**/*.pdf".into()],
        exclude_globs: vec![],
        follow_symlinks: false,
        debounce_ms: 50,
        queue_capacity: 64,
    }
}

/// Small windows so short test documents span several chunks.
pub fn small_codec() -> ChunkCodec {
    ChunkCodec::new(20, 5)
}

pub struct Fixture {
    pub tmp: TempDir,
    pub root: PathBuf,
    pub store: Arc<dyn Store>,
    pub embedder: Arc<HashEmbedder>,
    pub sync: Arc<Synchronizer>,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        let filter = FileFilter::new(&watch_config(&docs)).unwrap();
        let root = filter.root().to_path_buf();

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(HashEmbedder::default());
        let sync = Arc::new(Synchronizer::new(
            store.clone(),
            embedder.clone(),
            small_codec(),
            filter,
        ));
        Self {
            tmp,
            root,
            store,
            embedder,
            sync,
        }
    }

    /// A second synchronizer over the same store and root.
    pub fn with_embedder(&self, embedder: Arc<dyn Embedder>) -> Synchronizer {
        Synchronizer::new(
            self.store.clone(),
            embedder,
            small_codec(),
            self.sync.filter().clone(),
        )
    }

    pub fn write(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        path
    }

    pub fn key(&self, rel: &str) -> String {
        self.root.join(rel).to_string_lossy().to_string()
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

pub const DOCKER_DOC: &str = "# Docker\n\n## Running\n\nUse docker run -d nginx to start an nginx container in the background.\n\nStop it again with docker stop and the container id.\n";
pub const PYTHON_DOC: &str = "# Python\n\nCreate a virtual environment with python -m venv and activate it before installing packages with pip.\n";
pub const NOTES_DOC: &str = "Shopping list: apples, bread, coffee beans, and oat milk for the week.\n";
