//! Index synchronization: apply add/update/delete decisions to the store.
//!
//! The [`Synchronizer`] owns the ingestion side of the system. It reads a
//! document, extracts and chunks its text, embeds only the chunks whose ids
//! the store has not seen, and hands the full new chunk set to
//! [`Store::replace_document`], which swaps it in atomically. Any failure
//! before that call leaves the previous revision untouched, so re-running
//! the same apply converges on the same end state.
//!
//! The stored signature always pairs a content hash with an mtime taken
//! no later than the read that produced it. A write racing the read
//! therefore shows up as an mtime mismatch on the next diff.
//!
//! Documents with no indexable text (empty files, image-only PDFs) are not
//! stored. Their mtimes are remembered so later passes skip them until
//! they change.
//!
//! # Locking
//!
//! Every apply or touch holds a shared guard on the ingestion lock plus an
//! exclusive per-path lock, so two mutations of the same path never
//! overlap while different paths proceed freely. A full reindex takes the
//! ingestion lock exclusively for its whole duration. Queries never lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use grounded_kb_core::change::{classify, diff, Action, Decision, FileStat};
use grounded_kb_core::chunk::{content_hash, ChunkCodec};
use grounded_kb_core::embedding::Embedder;
use grounded_kb_core::models::{ChunkRecord, Document, FileKind, Signature};
use grounded_kb_core::store::Store;

use crate::extract::{extract_text, ExtractError};
use crate::scan::{hash_file, mtime_millis, path_key, stat_file, FileFilter};

/// Reads of a file that keeps changing before the last one is accepted.
const SNAPSHOT_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Transient; the file is retried on the next event or diff.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("could not extract text from {path}: {source}")]
    Extract {
        path: String,
        #[source]
        source: ExtractError,
    },
    /// The embedding service failed; the previous revision is intact.
    #[error("embedding unavailable for {path}: {source:#}")]
    Embedding {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("a full reindex deletes every chunk; pass confirm=true to proceed")]
    NotConfirmed,
}

/// What one successful apply did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub path: String,
    pub action: Action,
    /// Chunks now stored for the document.
    pub chunks: usize,
    /// Chunks that needed a fresh embedding.
    pub embedded: usize,
    /// Stale chunks removed.
    pub removed: usize,
    /// The document has no indexable text and is not stored.
    pub empty: bool,
}

/// Result of re-checking a single path (the watcher's unit of work).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    Applied(ApplyOutcome),
    Touched,
    Unchanged,
    Deferred(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub path: String,
    pub error: String,
}

/// Totals for a full-tree sync or reindex.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub touched: usize,
    pub unchanged: usize,
    /// Files with no indexable text.
    pub empty: usize,
    pub chunks_written: usize,
    pub embeddings_written: usize,
    pub deferred: Vec<String>,
    pub failures: Vec<DocumentFailure>,
}

impl SyncReport {
    fn record(&mut self, outcome: &ApplyOutcome) {
        if outcome.empty {
            self.empty += 1;
            return;
        }
        match outcome.action {
            Action::Add => self.added += 1,
            Action::Update => self.updated += 1,
            Action::Delete => self.deleted += 1,
        }
        if outcome.action != Action::Delete {
            self.chunks_written += outcome.chunks;
            self.embeddings_written += outcome.embedded;
        }
    }

    fn fail(&mut self, path: &str, err: &SyncError) {
        warn!(path, error = %err, "document sync failed; will retry next cycle");
        self.failures.push(DocumentFailure {
            path: path.to_string(),
            error: err.to_string(),
        });
    }
}

pub struct Synchronizer {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    codec: ChunkCodec,
    filter: FileFilter,
    ingest: RwLock<()>,
    path_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Path → mtime of files that produced no chunks.
    empty: Mutex<HashMap<String, i64>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        codec: ChunkCodec,
        filter: FileFilter,
    ) -> Self {
        Self {
            store,
            embedder,
            codec,
            filter,
            ingest: RwLock::new(()),
            path_locks: Mutex::new(HashMap::new()),
            empty: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn filter(&self) -> &FileFilter {
        &self.filter
    }

    /// Apply `action` to the document at `path`.
    ///
    /// Add and Update are treated alike: the stored chunk set becomes
    /// exactly what the file on disk chunks into now. A file that has
    /// disappeared by the time it is read is deleted instead.
    pub async fn apply(&self, path: &str, action: Action) -> Result<ApplyOutcome, SyncError> {
        self.locked(path, || self.apply_unlocked(path, action)).await
    }

    /// Apply a change-detector decision.
    pub async fn apply_decision(
        &self,
        path: &str,
        decision: Decision,
    ) -> Result<Refresh, SyncError> {
        match decision {
            Decision::Apply(action) => self.apply(path, action).await.map(Refresh::Applied),
            Decision::Touch(signature) => {
                self.locked(path, || self.touch_unlocked(path, &signature))
                    .await
            }
            Decision::Unchanged => Ok(Refresh::Unchanged),
            Decision::Deferred(reason) => Ok(Refresh::Deferred(reason)),
        }
    }

    /// Classify and apply a single path without a full-tree diff.
    ///
    /// Paths the filter rejects (renamed to an ignored extension, moved
    /// under an excluded directory) are treated as gone.
    pub async fn refresh_path(&self, path: &Path) -> Result<Refresh, SyncError> {
        let key = path_key(path);
        self.locked(&key, || self.refresh_unlocked(path, &key)).await
    }

    async fn refresh_unlocked(&self, path: &Path, key: &str) -> Result<Refresh, SyncError> {
        let indexed = self
            .store
            .document_state(key)
            .await
            .map_err(SyncError::Store)?;
        let accepted = self.filter.accepts(path);
        let known_empty = self.known_empty(key);
        let owned = path.to_path_buf();

        let decision = tokio::task::spawn_blocking(move || {
            let current = if accepted {
                match stat_file(&owned) {
                    Ok(stat) => Some(stat),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                    Err(e) => return Decision::Deferred(e.to_string()),
                }
            } else {
                None
            };
            if indexed.is_none()
                && current.as_ref().map(|s| s.mtime).is_some_and(|m| Some(m) == known_empty)
            {
                return Decision::Unchanged;
            }
            classify(current.as_ref(), indexed.as_ref(), hash_file)
        })
        .await
        .map_err(|e| SyncError::Store(e.into()))?;

        match decision {
            Decision::Apply(action) => self.apply_unlocked(key, action).await.map(Refresh::Applied),
            Decision::Touch(signature) => self.touch_unlocked(key, &signature).await,
            Decision::Unchanged => Ok(Refresh::Unchanged),
            Decision::Deferred(reason) => Ok(Refresh::Deferred(reason)),
        }
    }

    /// Diff the whole tree against the store and apply every change.
    ///
    /// A failing document is recorded in the report and does not stop the
    /// others.
    pub async fn sync_all(&self) -> Result<SyncReport, SyncError> {
        let files = self.scan().await?;
        let (files, skipped_empty) = self.skip_known_empty(files);
        let state = self.store.index_state().await.map_err(SyncError::Store)?;
        let changes = tokio::task::spawn_blocking(move || diff(&files, &state, hash_file))
            .await
            .map_err(|e| SyncError::Store(e.into()))?;

        info!(
            add = changes.to_add.len(),
            update = changes.to_update.len(),
            delete = changes.to_delete.len(),
            touched = changes.touched.len(),
            deferred = changes.deferred.len(),
            empty = skipped_empty,
            "sync diff computed"
        );

        let mut report = SyncReport {
            unchanged: changes.unchanged,
            empty: skipped_empty,
            deferred: changes.deferred.iter().map(|(p, _)| p.clone()).collect(),
            ..SyncReport::default()
        };
        for (path, reason) in &changes.deferred {
            warn!(path = %path, reason = %reason, "file unreadable; deferred to next cycle");
        }

        for (path, signature) in changes.touched.clone() {
            match self.apply_decision(&path, Decision::Touch(signature)).await {
                Ok(Refresh::Touched) => report.touched += 1,
                Ok(_) => {}
                Err(e) => report.fail(&path, &e),
            }
        }

        for (path, action) in changes.actions() {
            match self.apply(&path, action).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => report.fail(&path, &e),
            }
        }

        Ok(report)
    }

    /// Delete everything and re-ingest every file under the root.
    ///
    /// Holds the ingestion lock exclusively until done, so no watcher
    /// apply interleaves with it.
    pub async fn reindex_all(&self, confirm: bool) -> Result<SyncReport, SyncError> {
        if !confirm {
            return Err(SyncError::NotConfirmed);
        }
        let _exclusive = self.ingest.write().await;

        info!(root = %self.filter.root().display(), "full reindex started");
        self.store.clear().await.map_err(SyncError::Store)?;
        self.empty_docs().clear();

        let mut report = SyncReport::default();
        for stat in self.scan().await? {
            match self.apply_unlocked(&stat.path, Action::Add).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => report.fail(&stat.path, &e),
            }
        }
        info!(
            documents = report.added,
            chunks = report.chunks_written,
            empty = report.empty,
            failures = report.failures.len(),
            "full reindex finished"
        );
        Ok(report)
    }

    async fn scan(&self) -> Result<Vec<FileStat>, SyncError> {
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || filter.scan())
            .await
            .map_err(|e| SyncError::Store(e.into()))
    }

    /// Run `op` under the shared ingestion guard and the lock for `path`.
    async fn locked<T, F, Fut>(&self, path: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _shared = self.ingest.read().await;
        let lock = self.path_lock(path);
        let guard = lock.lock().await;
        let result = op().await;
        drop(guard);
        self.release_path_lock(path, lock);
        result
    }

    /// Refresh the stored signature, but only if the stored revision still
    /// has the content the signature was computed for.
    async fn touch_unlocked(&self, path: &str, signature: &Signature) -> Result<Refresh, SyncError> {
        let current = self
            .store
            .document_state(path)
            .await
            .map_err(SyncError::Store)?;
        match current {
            Some(doc) if doc.signature.hash == signature.hash => {
                self.store
                    .touch_document(path, signature)
                    .await
                    .map_err(SyncError::Store)?;
                debug!(path, mtime = signature.mtime, "content unchanged; signature refreshed");
                Ok(Refresh::Touched)
            }
            _ => {
                debug!(path, "stored revision changed since the diff; touch skipped");
                Ok(Refresh::Unchanged)
            }
        }
    }

    async fn apply_unlocked(&self, path: &str, action: Action) -> Result<ApplyOutcome, SyncError> {
        if action == Action::Delete {
            return self.delete_unlocked(path).await;
        }
        let Some(kind) = FileKind::from_path(path) else {
            return self.delete_unlocked(path).await;
        };

        let owned_path = path.to_string();
        let snapshot = tokio::task::spawn_blocking(move || {
            read_snapshot(Path::new(&owned_path), |p| fs::read(p))
        })
        .await
        .map_err(|e| SyncError::Store(e.into()))?;
        let (bytes, mtime) = match snapshot {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path, "file vanished before it could be read; deleting");
                return self.delete_unlocked(path).await;
            }
            Err(source) => {
                return Err(SyncError::Io {
                    path: path.to_string(),
                    source,
                })
            }
        };

        let signature = Signature {
            mtime,
            hash: content_hash(&bytes),
        };
        let source_group = self.filter.source_group(Path::new(path));
        let codec = self.codec;
        let owned_path = path.to_string();

        let (doc, chunks) = tokio::task::spawn_blocking(move || {
            let text = extract_text(&bytes, kind)?;
            let chunks = codec.chunk(&owned_path, &text, kind);
            let doc = Document {
                path: owned_path,
                kind,
                source_group,
                signature,
                text,
            };
            Ok::<_, ExtractError>((doc, chunks))
        })
        .await
        .map_err(|e| SyncError::Store(e.into()))?
        .map_err(|source| SyncError::Extract {
            path: path.to_string(),
            source,
        })?;

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .map(|c| ChunkRecord::from_chunk(&doc, c))
            .collect();

        let previous = self
            .store
            .document_state(path)
            .await
            .map_err(SyncError::Store)?;

        if records.is_empty() {
            return self.store_empty(path, doc.signature.mtime, previous.is_some()).await;
        }

        let old_ids: BTreeSet<String> = previous
            .as_ref()
            .map(|d| d.chunk_ids.clone())
            .unwrap_or_default();

        let fresh: Vec<&ChunkRecord> = records.iter().filter(|r| !old_ids.contains(&r.id)).collect();
        let vectors = self.embed_records(path, &fresh).await?;

        self.store
            .replace_document(path, &records, &vectors)
            .await
            .map_err(SyncError::Store)?;
        self.empty_docs().remove(path);

        let new_ids: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let removed = old_ids.iter().filter(|id| !new_ids.contains(id.as_str())).count();
        let action = if previous.is_some() {
            Action::Update
        } else {
            Action::Add
        };
        debug!(
            path,
            ?action,
            chunks = records.len(),
            embedded = fresh.len(),
            removed,
            "document applied"
        );

        Ok(ApplyOutcome {
            path: path.to_string(),
            action,
            chunks: records.len(),
            embedded: fresh.len(),
            removed,
            empty: false,
        })
    }

    /// A document that chunks into nothing: drop any earlier revision and
    /// remember its mtime.
    async fn store_empty(
        &self,
        path: &str,
        mtime: i64,
        was_indexed: bool,
    ) -> Result<ApplyOutcome, SyncError> {
        let removed = if was_indexed {
            self.store
                .delete_document(path)
                .await
                .map_err(SyncError::Store)?
        } else {
            0
        };
        self.empty_docs().insert(path.to_string(), mtime);
        debug!(path, removed, "no indexable text; nothing stored");
        Ok(ApplyOutcome {
            path: path.to_string(),
            action: if was_indexed { Action::Delete } else { Action::Add },
            chunks: 0,
            embedded: 0,
            removed,
            empty: true,
        })
    }

    async fn delete_unlocked(&self, path: &str) -> Result<ApplyOutcome, SyncError> {
        let removed = self
            .store
            .delete_document(path)
            .await
            .map_err(SyncError::Store)?;
        self.empty_docs().remove(path);
        debug!(path, removed, "document deleted");
        Ok(ApplyOutcome {
            path: path.to_string(),
            action: Action::Delete,
            chunks: 0,
            embedded: 0,
            removed,
            empty: false,
        })
    }

    async fn embed_records(
        &self,
        path: &str,
        records: &[&ChunkRecord],
    ) -> Result<HashMap<String, Vec<f32>>, SyncError> {
        if records.is_empty() {
            return Ok(HashMap::new());
        }
        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|source| SyncError::Embedding {
                path: path.to_string(),
                source,
            })?;
        if vectors.len() != records.len() {
            return Err(SyncError::Embedding {
                path: path.to_string(),
                source: anyhow::anyhow!(
                    "expected {} vectors, got {}",
                    records.len(),
                    vectors.len()
                ),
            });
        }
        Ok(records
            .iter()
            .map(|r| r.id.clone())
            .zip(vectors)
            .collect())
    }

    fn empty_docs(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        match self.empty.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn known_empty(&self, path: &str) -> Option<i64> {
        self.empty_docs().get(path).copied()
    }

    /// Drop files already known to be empty at their current mtime, and
    /// forget entries for files that are gone.
    fn skip_known_empty(&self, files: Vec<FileStat>) -> (Vec<FileStat>, usize) {
        let mut empty = self.empty_docs();
        {
            let present: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
            empty.retain(|path, _| present.contains(path.as_str()));
        }

        let (skipped, kept): (Vec<FileStat>, Vec<FileStat>) = files
            .into_iter()
            .partition(|f| empty.get(&f.path) == Some(&f.mtime));
        (kept, skipped.len())
    }

    fn path_lock(&self, path: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.path_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(path.to_string()).or_default())
    }

    /// Drop the map entry once nobody else holds or waits on it.
    fn release_path_lock(&self, path: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = match self.path_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }
}

/// Read a file together with an mtime that is no newer than its content.
///
/// The mtime is taken before each read and checked again after it. If a
/// write landed in between, the file is read again; after
/// `SNAPSHOT_ATTEMPTS` reads the pre-read mtime is kept, which the next
/// diff sees as stale.
fn read_snapshot<F>(path: &Path, mut read: F) -> io::Result<(Vec<u8>, i64)>
where
    F: FnMut(&Path) -> io::Result<Vec<u8>>,
{
    let mtime_of = |p: &Path| fs::metadata(p).map(|m| mtime_millis(&m));
    let mut before = mtime_of(path)?;
    let mut attempts = 1;
    loop {
        let bytes = read(path)?;
        let after = mtime_of(path)?;
        if after == before || attempts == SNAPSHOT_ATTEMPTS {
            return Ok((bytes, before));
        }
        debug!(path = %path.display(), "file changed while reading; reading again");
        before = after;
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn set_mtime(path: &Path, offset_secs: u64) -> io::Result<()> {
        let file = fs::File::options().write(true).open(path)?;
        file.set_modified(SystemTime::now() + Duration::from_secs(offset_secs))
    }

    #[test]
    fn test_report_counts_by_action() {
        let mut report = SyncReport::default();
        let outcome = |action, chunks| ApplyOutcome {
            path: "p".into(),
            action,
            chunks,
            embedded: chunks,
            removed: 0,
            empty: false,
        };
        report.record(&outcome(Action::Add, 3));
        report.record(&outcome(Action::Update, 2));
        report.record(&outcome(Action::Delete, 0));
        report.record(&ApplyOutcome {
            empty: true,
            ..outcome(Action::Add, 0)
        });
        assert_eq!((report.added, report.updated, report.deleted), (1, 1, 1));
        assert_eq!(report.empty, 1);
        assert_eq!(report.chunks_written, 5);
    }

    #[test]
    fn test_not_confirmed_message() {
        assert!(SyncError::NotConfirmed.to_string().contains("confirm"));
    }

    #[test]
    fn test_snapshot_rereads_after_concurrent_write() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.md");
        fs::write(&path, "first revision").unwrap();

        let mut reads = 0;
        let (bytes, mtime) = read_snapshot(&path, |p| {
            reads += 1;
            let bytes = fs::read(p)?;
            if reads == 1 {
                // Another writer lands between the read and the re-stat.
                fs::write(p, "second revision")?;
                set_mtime(p, 30)?;
            }
            Ok(bytes)
        })
        .unwrap();

        assert_eq!(reads, 2);
        assert_eq!(bytes, b"second revision");
        assert_eq!(mtime, mtime_millis(&fs::metadata(&path).unwrap()));
    }

    #[test]
    fn test_snapshot_keeps_stale_mtime_when_file_never_settles() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.md");
        fs::write(&path, "v0").unwrap();

        let mut reads = 0u64;
        let (bytes, mtime) = read_snapshot(&path, |p| {
            reads += 1;
            let bytes = fs::read(p)?;
            fs::write(p, format!("v{}", reads))?;
            set_mtime(p, 30 * reads)?;
            Ok(bytes)
        })
        .unwrap();

        assert_eq!(reads, SNAPSHOT_ATTEMPTS as u64);
        assert_eq!(bytes, format!("v{}", reads - 1).into_bytes());
        // Older than the file on disk, so the next diff re-hashes it.
        assert!(mtime < mtime_millis(&fs::metadata(&path).unwrap()));
    }
}
