//! In-memory [`Store`] for tests and ephemeral indexes.
//!
//! All rows live in one `BTreeMap` keyed by chunk id behind a
//! `std::sync::RwLock`, so `replace_document` is atomic: it validates
//! first and mutates under a single write guard. Vector search is
//! brute-force cosine similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{index_state_from_records, ChunkRecord, IndexState, IndexedDocument, Signature};

use super::{rank_neighbors, Neighbor, Store, StoreStats};

struct Row {
    record: ChunkRecord,
    vector: Vec<f32>,
}

#[derive(Default)]
pub struct InMemoryStore {
    rows: RwLock<BTreeMap<String, Row>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl Store for InMemoryStore {
    async fn replace_document(
        &self,
        path: &str,
        records: &[ChunkRecord],
        vectors: &HashMap<String, Vec<f32>>,
    ) -> Result<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;

        let mut staged = Vec::with_capacity(records.len());
        for rec in records {
            if rec.path != path {
                bail!("chunk {} belongs to {}, not {}", rec.id, rec.path, path);
            }
            let vector = match vectors.get(&rec.id) {
                Some(v) => v.clone(),
                None => match rows.get(&rec.id) {
                    Some(existing) if existing.record.path == path => existing.vector.clone(),
                    _ => bail!("chunk {} has no embedding", rec.id),
                },
            };
            staged.push(Row {
                record: rec.clone(),
                vector,
            });
        }

        rows.retain(|_, row| row.record.path != path);
        for row in staged {
            rows.insert(row.record.id.clone(), row);
        }
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<usize> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let before = rows.len();
        rows.retain(|_, row| row.record.path != path);
        Ok(before - rows.len())
    }

    async fn touch_document(&self, path: &str, signature: &Signature) -> Result<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        for row in rows.values_mut().filter(|r| r.record.path == path) {
            row.record.signature = signature.clone();
        }
        Ok(())
    }

    async fn document_state(&self, path: &str) -> Result<Option<IndexedDocument>> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut state =
            index_state_from_records(rows.values().map(|r| &r.record).filter(|r| r.path == path));
        Ok(state.remove(path))
    }

    async fn index_state(&self) -> Result<IndexState> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(index_state_from_records(rows.values().map(|r| &r.record)))
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(id).map(|r| r.record.clone()))
    }

    async fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        group: Option<&str>,
    ) -> Result<Vec<Neighbor>> {
        let rows = self.rows.read().map_err(poisoned)?;
        let hits = rows
            .values()
            .filter(|r| group.map_or(true, |g| r.record.source_group == g))
            .map(|r| Neighbor {
                chunk: r.record.clone(),
                score: cosine_similarity(vector, &r.vector),
            })
            .collect();
        Ok(rank_neighbors(hits, k))
    }

    async fn clear(&self) -> Result<()> {
        self.rows.write().map_err(poisoned)?.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let rows = self.rows.read().map_err(poisoned)?;
        let state = index_state_from_records(rows.values().map(|r| &r.record));

        let mut groups: BTreeMap<String, usize> = BTreeMap::new();
        let mut seen_paths = std::collections::HashSet::new();
        for row in rows.values() {
            if seen_paths.insert(row.record.path.as_str()) {
                *groups.entry(row.record.source_group.clone()).or_default() += 1;
            }
        }

        Ok(StoreStats {
            total_chunks: rows.len(),
            total_documents: state.len(),
            embedded_chunks: rows.values().filter(|r| !r.vector.is_empty()).count(),
            groups,
            last_modified: state.values().map(|d| d.signature.mtime).max(),
        })
    }
}
