//! Change detection: which files must be added, updated, or deleted.
//!
//! The detector compares the files currently on disk with the
//! [`IndexState`] read back from the store. The modification time is a
//! cheap short-circuit: if it matches the stored signature the file is
//! considered unchanged without reading it. If it differs, the content
//! hash decides, because editors often rewrite files with identical
//! bytes. A file whose hash still matches is reported as `touched` (its
//! stored mtime should be refreshed) rather than re-embedded.
//!
//! Hashing is delegated to a caller-supplied function so the detector
//! stays free of I/O. A file that vanished while being hashed becomes a
//! delete; any other read error defers the file to the next cycle.

use std::collections::HashSet;
use std::io;

use serde::Serialize;

use crate::models::{IndexState, IndexedDocument, Signature};

/// A file seen on disk during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: String,
    /// Modification time in unix milliseconds.
    pub mtime: i64,
}

/// Mutation to apply to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Update,
    Delete,
}

/// Classification of a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Apply an index mutation.
    Apply(Action),
    /// Content unchanged but mtime moved; refresh the stored signature.
    Touch(Signature),
    /// Nothing to do.
    Unchanged,
    /// Could not be read right now; retry next cycle.
    Deferred(String),
}

/// Result of a full-tree diff. All lists are sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub to_add: Vec<String>,
    pub to_update: Vec<String>,
    pub to_delete: Vec<String>,
    pub touched: Vec<(String, Signature)>,
    pub deferred: Vec<(String, String)>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_update.is_empty()
            && self.to_delete.is_empty()
            && self.touched.is_empty()
    }

    /// Every mutation in apply order: deletes first, then updates, then adds.
    pub fn actions(&self) -> Vec<(String, Action)> {
        self.to_delete
            .iter()
            .map(|p| (p.clone(), Action::Delete))
            .chain(self.to_update.iter().map(|p| (p.clone(), Action::Update)))
            .chain(self.to_add.iter().map(|p| (p.clone(), Action::Add)))
            .collect()
    }
}

/// Classify one path.
///
/// `current` is the file's stat if it exists on disk, `indexed` is what the
/// store holds for it. `hash_file` is only called when the mtime moved.
pub fn classify<F>(
    current: Option<&FileStat>,
    indexed: Option<&IndexedDocument>,
    hash_file: F,
) -> Decision
where
    F: FnOnce(&str) -> io::Result<String>,
{
    match (current, indexed) {
        (None, None) => Decision::Unchanged,
        (None, Some(_)) => Decision::Apply(Action::Delete),
        (Some(_), None) => Decision::Apply(Action::Add),
        (Some(stat), Some(doc)) => {
            if stat.mtime == doc.signature.mtime {
                return Decision::Unchanged;
            }
            match hash_file(&stat.path) {
                Ok(hash) if hash == doc.signature.hash => Decision::Touch(Signature {
                    mtime: stat.mtime,
                    hash,
                }),
                Ok(_) => Decision::Apply(Action::Update),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Decision::Apply(Action::Delete),
                Err(e) => Decision::Deferred(e.to_string()),
            }
        }
    }
}

/// Diff the current directory listing against the index.
pub fn diff<F>(current: &[FileStat], state: &IndexState, mut hash_file: F) -> ChangeSet
where
    F: FnMut(&str) -> io::Result<String>,
{
    let mut set = ChangeSet::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(current.len());

    for stat in current {
        if !seen.insert(stat.path.as_str()) {
            continue;
        }
        match classify(Some(stat), state.get(&stat.path), &mut hash_file) {
            Decision::Apply(Action::Add) => set.to_add.push(stat.path.clone()),
            Decision::Apply(Action::Update) => set.to_update.push(stat.path.clone()),
            Decision::Apply(Action::Delete) => set.to_delete.push(stat.path.clone()),
            Decision::Touch(sig) => set.touched.push((stat.path.clone(), sig)),
            Decision::Unchanged => set.unchanged += 1,
            Decision::Deferred(reason) => set.deferred.push((stat.path.clone(), reason)),
        }
    }

    for path in state.keys() {
        if !seen.contains(path.as_str()) {
            set.to_delete.push(path.clone());
        }
    }

    set.to_add.sort();
    set.to_update.sort();
    set.to_delete.sort();
    set.touched.sort_by(|a, b| a.0.cmp(&b.0));
    set.deferred.sort_by(|a, b| a.0.cmp(&b.0));
    set
}
