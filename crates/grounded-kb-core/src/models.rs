//! Core data models shared by the ingestion and query pipelines.
//!
//! A [`Document`] is a file under the watched root. It is split into
//! [`Chunk`]s, which are stored as [`ChunkRecord`]s together with the
//! document-level fields needed to rebuild the [`IndexState`] from the
//! store alone.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Group assigned to files that sit directly in the watched root.
pub const DEFAULT_GROUP: &str = "misc";

/// Kind of document, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Markdown,
    Text,
    Pdf,
}

impl FileKind {
    /// Classify a path by extension (case-insensitive). Unsupported
    /// extensions return `None` and are ignored by the pipeline.
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
        if ext.contains('/') || ext.contains('\\') {
            return None;
        }
        match ext.as_str() {
            "md" | "markdown" => Some(FileKind::Markdown),
            "txt" => Some(FileKind::Text),
            "pdf" => Some(FileKind::Pdf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Markdown => "markdown",
            FileKind::Text => "text",
            FileKind::Pdf => "pdf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markdown" => Some(FileKind::Markdown),
            "text" => Some(FileKind::Text),
            "pdf" => Some(FileKind::Pdf),
            _ => None,
        }
    }
}

/// Modification signature of a document: mtime in unix milliseconds plus
/// the SHA-256 of the raw file bytes. The hash is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub mtime: i64,
    pub hash: String,
}

/// A document read from disk, with its extracted text.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: String,
    pub kind: FileKind,
    pub source_group: String,
    pub signature: Signature,
    pub text: String,
}

/// A chunk produced by the chunk codec, before it is attached to a
/// document's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub ordinal: usize,
    pub text: String,
    pub hash: String,
    /// Byte offset of the chunk start in the extracted text.
    pub start_char: usize,
    /// Byte offset one past the chunk end.
    pub end_char: usize,
    /// Enclosing Markdown headings (h1, h2, h3), outermost first.
    pub headings: Vec<String>,
}

/// A chunk as persisted in the store, carrying its document metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub id: String,
    pub path: String,
    pub ordinal: usize,
    pub text: String,
    pub hash: String,
    pub source_group: String,
    pub kind: FileKind,
    pub signature: Signature,
    pub start_char: usize,
    pub end_char: usize,
    pub headings: Vec<String>,
}

impl ChunkRecord {
    pub fn from_chunk(doc: &Document, chunk: Chunk) -> Self {
        Self {
            id: chunk.id,
            path: doc.path.clone(),
            ordinal: chunk.ordinal,
            text: chunk.text,
            hash: chunk.hash,
            source_group: doc.source_group.clone(),
            kind: doc.kind,
            signature: doc.signature.clone(),
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            headings: chunk.headings,
        }
    }
}

/// What the index currently holds for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument {
    pub signature: Signature,
    pub chunk_ids: BTreeSet<String>,
}

/// Path → indexed document. Always computed from store contents.
pub type IndexState = BTreeMap<String, IndexedDocument>;

/// Group a set of records by path into an [`IndexState`].
///
/// Every record of a document carries the same signature; if they ever
/// disagree the first one seen wins, and the next sync repairs it.
pub fn index_state_from_records<'a, I>(records: I) -> IndexState
where
    I: IntoIterator<Item = &'a ChunkRecord>,
{
    let mut state = IndexState::new();
    for rec in records {
        state
            .entry(rec.path.clone())
            .or_insert_with(|| IndexedDocument {
                signature: rec.signature.clone(),
                chunk_ids: BTreeSet::new(),
            })
            .chunk_ids
            .insert(rec.id.clone());
    }
    state
}

/// Source group of a path relative to the watched root: its first
/// directory component, or [`DEFAULT_GROUP`] for top-level files.
pub fn source_group_for(relative_path: &str) -> String {
    let normalized = relative_path.replace('\\', "/");
    let mut parts = normalized.split('/').filter(|p| !p.is_empty() && *p != ".");
    match (parts.next(), parts.next()) {
        (Some(first), Some(_)) => first.to_string(),
        _ => DEFAULT_GROUP.to_string(),
    }
}
