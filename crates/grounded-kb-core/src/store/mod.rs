//! Vector store abstraction.
//!
//! The [`Store`] is the single source of truth for what has been indexed:
//! every chunk row carries its document's path and signature, so the
//! [`IndexState`] is recomputed from the store on demand and there is no
//! side ledger that can drift.
//!
//! Implementations must be `Send + Sync`; handles are passed explicitly
//! (usually as `Arc<dyn Store>`) to the synchronizer, the watcher, and
//! the retriever.

pub mod memory;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ChunkRecord, IndexState, IndexedDocument, Signature};

/// A chunk returned by nearest-neighbour search.
#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub chunk: ChunkRecord,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Aggregate counts over the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub total_documents: usize,
    pub embedded_chunks: usize,
    /// Documents per source group.
    pub groups: BTreeMap<String, usize>,
    /// Newest document mtime (unix ms), if any.
    pub last_modified: Option<i64>,
}

/// Storage backend for chunks and their vectors.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`replace_document`](Store::replace_document) | Atomically set a document's chunk set |
/// | [`delete_document`](Store::delete_document) | Remove every chunk of a document |
/// | [`touch_document`](Store::touch_document) | Refresh a document's stored signature |
/// | [`document_state`](Store::document_state) | Signature and chunk ids of one document |
/// | [`index_state`](Store::index_state) | Signature and chunk ids of every document |
/// | [`get_chunk`](Store::get_chunk) | Fetch one chunk by id |
/// | [`nearest`](Store::nearest) | Cosine nearest-neighbour search |
/// | [`clear`](Store::clear) | Drop everything |
/// | [`stats`](Store::stats) | Aggregate counts |
#[async_trait]
pub trait Store: Send + Sync {
    /// Make the stored chunk set for `path` exactly `records`, in one
    /// atomic step.
    ///
    /// Ids not in `records` are deleted. Ids already stored keep their
    /// vector unless `vectors` supplies a new one; ids that are new must
    /// have a vector in `vectors`, otherwise nothing is written and an
    /// error is returned. An empty `records` removes the document.
    async fn replace_document(
        &self,
        path: &str,
        records: &[ChunkRecord],
        vectors: &HashMap<String, Vec<f32>>,
    ) -> Result<()>;

    /// Remove every chunk of `path`. Returns how many were removed.
    async fn delete_document(&self, path: &str) -> Result<usize>;

    /// Overwrite the stored signature of `path` without touching chunks.
    async fn touch_document(&self, path: &str, signature: &Signature) -> Result<()>;

    async fn document_state(&self, path: &str) -> Result<Option<IndexedDocument>>;

    async fn index_state(&self) -> Result<IndexState>;

    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>>;

    /// Top-`k` chunks by cosine similarity, best first, ties broken by
    /// chunk id. `group` restricts results to one source group.
    async fn nearest(&self, vector: &[f32], k: usize, group: Option<&str>)
        -> Result<Vec<Neighbor>>;

    async fn clear(&self) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Order neighbours best first, ties by id, and keep the top `k`.
pub fn rank_neighbors(mut hits: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    hits.truncate(k);
    hits
}
