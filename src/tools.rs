//! The query tool surface.
//!
//! | Tool | Backed by |
//! |------|-----------|
//! | `query_knowledge_base(query, n_results=5)` | Retriever |
//! | `get_chunk_by_id(id, max_chars, format)` | Store lookup |
//! | `get_knowledge_base_stats()` | Store stats |
//! | `refresh_knowledge_base()` | Incremental sync |
//! | `reindex_knowledge_base(confirm)` | Full reindex |
//! | `ask(question)` | Retriever + AnswerOrchestrator |
//!
//! Every response is a `Serialize` struct so a protocol layer can return
//! it as JSON unchanged. The CLI renders the same structs as text.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use grounded_kb_core::answer::{AnswerError, AnswerOrchestrator, GroundedAnswer};
use grounded_kb_core::chunk::is_valid_id;
use grounded_kb_core::prompt::{format_citation, make_snippet, truncate_chars};
use grounded_kb_core::retrieve::{search, Retrieval, RetrievalRequest};

use crate::config::RetrievalConfig;
use crate::stats::{collect_stats, KbStats};
use crate::sync::{SyncError, SyncReport, Synchronizer};

/// Upper bound on `n_results`.
pub const MAX_RESULTS: usize = 50;
pub const DEFAULT_RESULTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Confirmation(String),
    #[error(transparent)]
    Sync(SyncError),
    #[error(transparent)]
    Answer(#[from] AnswerError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<SyncError> for ToolError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotConfirmed => ToolError::Confirmation(e.to_string()),
            other => ToolError::Sync(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFormat {
    #[default]
    Raw,
    Markdown,
}

impl FromStr for ChunkFormat {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "text" => Ok(ChunkFormat::Raw),
            "markdown" | "md" => Ok(ChunkFormat::Markdown),
            other => Err(ToolError::InvalidArgument(format!(
                "unknown format '{}'; expected raw or markdown",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub n_results: Option<usize>,
    /// Only return chunks from this group.
    pub group: Option<String>,
    /// Prefer this group when scores tie.
    pub prefer_group: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub id: String,
    pub score: f32,
    pub path: String,
    pub source_group: String,
    pub ordinal: usize,
    pub citation: String,
    pub snippet: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub id: String,
    pub path: String,
    pub source_group: String,
    pub ordinal: usize,
    pub total_chunks: usize,
    pub citation: String,
    pub format: ChunkFormat,
    pub truncated: bool,
    pub content: String,
}

/// Tools over one synchronizer and its store.
pub struct KnowledgeBase {
    sync: Arc<Synchronizer>,
    retrieval: RetrievalConfig,
    db_path: PathBuf,
}

impl KnowledgeBase {
    pub fn new(sync: Arc<Synchronizer>, retrieval: RetrievalConfig, db_path: PathBuf) -> Self {
        Self {
            sync,
            retrieval,
            db_path,
        }
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    /// Run a retrieval. The returned hits are the allowed citation set for
    /// anything generated from them.
    pub async fn retrieve(&self, query: &str, opts: &QueryOptions) -> Result<Retrieval, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidArgument("query must not be empty".into()));
        }
        let k = opts.n_results.unwrap_or(self.retrieval.top_k);
        if k == 0 || k > MAX_RESULTS {
            return Err(ToolError::InvalidArgument(format!(
                "n_results must be between 1 and {}",
                MAX_RESULTS
            )));
        }

        let req = RetrievalRequest {
            question: query,
            k,
            group_hint: opts.prefer_group.as_deref(),
            group_filter: opts.group.as_deref(),
            min_score: self.retrieval.min_score,
        };
        Ok(search(
            self.sync.store().as_ref(),
            self.sync.embedder().as_ref(),
            &req,
        )
        .await?)
    }

    pub async fn query_knowledge_base(
        &self,
        query: &str,
        opts: &QueryOptions,
    ) -> Result<QueryResponse, ToolError> {
        let retrieval = self.retrieve(query, opts).await?;

        let mut results = Vec::with_capacity(retrieval.hits.len());
        for hit in retrieval.hits {
            let total = self.total_chunks(&hit.chunk.path).await?;
            results.push(QueryResult {
                citation: format_citation(&hit.chunk, total),
                snippet: make_snippet(&hit.chunk.text, self.retrieval.snippet_chars),
                text: truncate_chars(&hit.chunk.text, self.retrieval.max_chars_full),
                id: hit.chunk.id,
                score: hit.score,
                path: hit.chunk.path,
                source_group: hit.chunk.source_group,
                ordinal: hit.chunk.ordinal,
            });
        }

        Ok(QueryResponse {
            query: retrieval.question,
            results,
        })
    }

    pub async fn get_chunk_by_id(
        &self,
        id: &str,
        max_chars: Option<usize>,
        format: ChunkFormat,
    ) -> Result<ChunkResponse, ToolError> {
        let id = id.trim();
        if !is_valid_id(id) {
            return Err(ToolError::InvalidArgument(format!(
                "'{}' is not a chunk id (expected <hash>_<ordinal>)",
                id
            )));
        }
        let chunk = self
            .sync
            .store()
            .get_chunk(id)
            .await?
            .ok_or_else(|| ToolError::NotFound(format!("chunk {}", id)))?;

        let total_chunks = self.total_chunks(&chunk.path).await?;
        let citation = format_citation(&chunk, total_chunks);
        let limit = max_chars.unwrap_or(self.retrieval.max_chars_full);
        let body = truncate_chars(&chunk.text, limit);
        let truncated = body.len() < chunk.text.len();

        let content = match format {
            ChunkFormat::Raw => body,
            ChunkFormat::Markdown => {
                let mut md = format!("### [chunk:{}]\n\n_{}_\n\n", chunk.id, citation);
                for line in body.lines() {
                    md.push_str("> ");
                    md.push_str(line);
                    md.push('\n');
                }
                if truncated {
                    md.push_str(">\n> …\n");
                }
                md
            }
        };

        Ok(ChunkResponse {
            id: chunk.id,
            path: chunk.path,
            source_group: chunk.source_group,
            ordinal: chunk.ordinal,
            total_chunks,
            citation,
            format,
            truncated,
            content,
        })
    }

    pub async fn get_knowledge_base_stats(&self) -> Result<KbStats, ToolError> {
        Ok(collect_stats(
            self.sync.store().as_ref(),
            &self.db_path,
            self.sync.embedder().model_name(),
        )
        .await?)
    }

    /// Incremental sync of the whole tree.
    pub async fn refresh_knowledge_base(&self) -> Result<SyncReport, ToolError> {
        Ok(self.sync.sync_all().await?)
    }

    /// Delete everything and rebuild. Refused unless `confirm` is true.
    pub async fn reindex_knowledge_base(&self, confirm: bool) -> Result<SyncReport, ToolError> {
        Ok(self.sync.reindex_all(confirm).await?)
    }

    /// Retrieve, then answer through the orchestrator.
    pub async fn ask(
        &self,
        orchestrator: &AnswerOrchestrator,
        question: &str,
        opts: &QueryOptions,
    ) -> Result<(Retrieval, GroundedAnswer), ToolError> {
        let retrieval = self.retrieve(question, opts).await?;
        let answer = orchestrator.answer(&retrieval).await?;
        Ok((retrieval, answer))
    }

    async fn total_chunks(&self, path: &str) -> Result<usize, ToolError> {
        Ok(self
            .sync
            .store()
            .document_state(path)
            .await?
            .map(|d| d.chunk_ids.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_format_parse() {
        assert_eq!("raw".parse::<ChunkFormat>().unwrap(), ChunkFormat::Raw);
        assert_eq!("Markdown".parse::<ChunkFormat>().unwrap(), ChunkFormat::Markdown);
        assert!(matches!(
            "html".parse::<ChunkFormat>(),
            Err(ToolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unconfirmed_reindex_maps_to_confirmation() {
        let err: ToolError = SyncError::NotConfirmed.into();
        assert!(matches!(err, ToolError::Confirmation(_)));
    }
}
