//! SQLite-backed [`Store`] implementation.
//!
//! Chunks and their vectors live in two tables (see [`crate::migrate`]).
//! `replace_document` runs in a single transaction, so a failure at any
//! step leaves the previous revision of the document in place. Vector
//! search is brute-force cosine similarity over the stored blobs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use grounded_kb_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use grounded_kb_core::models::{ChunkRecord, FileKind, IndexState, IndexedDocument, Signature};
use grounded_kb_core::store::{rank_neighbors, Neighbor, Store, StoreStats};

const CHUNK_COLUMNS: &str = "c.id, c.path, c.ordinal, c.text, c.content_hash, c.source_group, \
     c.kind, c.doc_mtime, c.doc_hash, c.start_char, c.end_char, c.headings";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    model: String,
}

impl SqliteStore {
    /// Wrap a pool. `model` is recorded next to every vector written.
    pub fn new(pool: SqlitePool, model: impl Into<String>) -> Self {
        Self {
            pool,
            model: model.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ChunkRecord> {
    let kind: String = row.try_get("kind")?;
    let headings: String = row.try_get("headings")?;
    let ordinal: i64 = row.try_get("ordinal")?;
    let start_char: i64 = row.try_get("start_char")?;
    let end_char: i64 = row.try_get("end_char")?;

    Ok(ChunkRecord {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        ordinal: ordinal as usize,
        text: row.try_get("text")?,
        hash: row.try_get("content_hash")?,
        source_group: row.try_get("source_group")?,
        kind: FileKind::parse(&kind).ok_or_else(|| anyhow!("unknown document kind '{}'", kind))?,
        signature: Signature {
            mtime: row.try_get("doc_mtime")?,
            hash: row.try_get("doc_hash")?,
        },
        start_char: start_char as usize,
        end_char: end_char as usize,
        headings: serde_json::from_str(&headings).unwrap_or_default(),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn replace_document(
        &self,
        path: &str,
        records: &[ChunkRecord],
        vectors: &HashMap<String, Vec<f32>>,
    ) -> Result<()> {
        if let Some(stray) = records.iter().find(|r| r.path != path) {
            bail!("chunk {} belongs to {}, not {}", stray.id, stray.path, path);
        }

        let mut tx = self.pool.begin().await?;

        for rec in records.iter().filter(|r| !vectors.contains_key(&r.id)) {
            let has_vector: bool = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) > 0 FROM chunk_vectors cv
                JOIN chunks c ON c.id = cv.chunk_id
                WHERE cv.chunk_id = ? AND c.path = ?
                "#,
            )
            .bind(&rec.id)
            .bind(path)
            .fetch_one(&mut *tx)
            .await?;
            if !has_vector {
                bail!("chunk {} has no embedding", rec.id);
            }
        }

        let keep: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE path = ?")
            .bind(path)
            .fetch_all(&mut *tx)
            .await?;
        for stale in existing.iter().filter(|id| !keep.contains(id.as_str())) {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(stale)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(stale)
                .execute(&mut *tx)
                .await?;
        }

        for rec in records {
            let headings = serde_json::to_string(&rec.headings)?;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, path, ordinal, text, content_hash, source_group, kind,
                                    doc_mtime, doc_hash, start_char, end_char, headings)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    source_group = excluded.source_group,
                    kind = excluded.kind,
                    doc_mtime = excluded.doc_mtime,
                    doc_hash = excluded.doc_hash,
                    start_char = excluded.start_char,
                    end_char = excluded.end_char,
                    headings = excluded.headings
                "#,
            )
            .bind(&rec.id)
            .bind(&rec.path)
            .bind(rec.ordinal as i64)
            .bind(&rec.text)
            .bind(&rec.hash)
            .bind(&rec.source_group)
            .bind(rec.kind.as_str())
            .bind(rec.signature.mtime)
            .bind(&rec.signature.hash)
            .bind(rec.start_char as i64)
            .bind(rec.end_char as i64)
            .bind(&headings)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to write chunk {}", rec.id))?;

            if let Some(vec) = vectors.get(&rec.id) {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, model, dims, embedding)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(chunk_id) DO UPDATE SET
                        model = excluded.model,
                        dims = excluded.dims,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&rec.id)
                .bind(&self.model)
                .bind(vec.len() as i64)
                .bind(vec_to_blob(vec))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE path = ?)")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn touch_document(&self, path: &str, signature: &Signature) -> Result<()> {
        sqlx::query("UPDATE chunks SET doc_mtime = ?, doc_hash = ? WHERE path = ?")
            .bind(signature.mtime)
            .bind(&signature.hash)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn document_state(&self, path: &str) -> Result<Option<IndexedDocument>> {
        let rows = sqlx::query("SELECT id, doc_mtime, doc_hash FROM chunks WHERE path = ? ORDER BY ordinal")
            .bind(path)
            .fetch_all(&self.pool)
            .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let signature = Signature {
            mtime: first.try_get("doc_mtime")?,
            hash: first.try_get("doc_hash")?,
        };
        let chunk_ids = rows
            .iter()
            .map(|r| r.try_get::<String, _>("id"))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Some(IndexedDocument {
            signature,
            chunk_ids,
        }))
    }

    async fn index_state(&self) -> Result<IndexState> {
        let rows = sqlx::query("SELECT id, path, doc_mtime, doc_hash FROM chunks ORDER BY path, ordinal")
            .fetch_all(&self.pool)
            .await?;

        let mut state = IndexState::new();
        for row in &rows {
            let path: String = row.try_get("path")?;
            let id: String = row.try_get("id")?;
            if !state.contains_key(&path) {
                let signature = Signature {
                    mtime: row.try_get("doc_mtime")?,
                    hash: row.try_get("doc_hash")?,
                };
                state.insert(
                    path.clone(),
                    IndexedDocument {
                        signature,
                        chunk_ids: BTreeSet::new(),
                    },
                );
            }
            if let Some(doc) = state.get_mut(&path) {
                doc.chunk_ids.insert(id);
            }
        }
        Ok(state)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM chunks c WHERE c.id = ?", CHUNK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        group: Option<&str>,
    ) -> Result<Vec<Neighbor>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE (?1 IS NULL OR c.source_group = ?1)
            "#,
            CHUNK_COLUMNS
        ))
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            hits.push(Neighbor {
                chunk: row_to_record(row)?,
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
            });
        }
        Ok(rank_neighbors(hits, k))
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_chunks,
                   COUNT(DISTINCT path) AS total_documents,
                   MAX(doc_mtime) AS last_modified
            FROM chunks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;

        let group_rows = sqlx::query(
            "SELECT source_group, COUNT(DISTINCT path) AS docs FROM chunks GROUP BY source_group",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut groups = BTreeMap::new();
        for r in &group_rows {
            let docs: i64 = r.try_get("docs")?;
            groups.insert(r.try_get::<String, _>("source_group")?, docs as usize);
        }

        let total_chunks: i64 = row.try_get("total_chunks")?;
        let total_documents: i64 = row.try_get("total_documents")?;
        Ok(StoreStats {
            total_chunks: total_chunks as usize,
            total_documents: total_documents as usize,
            embedded_chunks: embedded as usize,
            groups,
            last_modified: row.try_get("last_modified")?,
        })
    }
}
