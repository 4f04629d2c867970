//! # Grounded KB
//!
//! Keeps a vector index of a personal documents folder in sync with the
//! filesystem and answers questions against it with every claim checked
//! for a citation and a verbatim quote.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────┐
//! │  notify   │──▶│ watch loop   │──▶│ Synchronizer │──▶│ SQLite  │
//! │  events   │   │ (debounce)   │   │ chunk+embed  │   │ chunks  │
//! └───────────┘   └──────────────┘   └──────────────┘   └────┬────┘
//!                                                            │
//!              question ──▶ Retriever ──▶ AnswerOrchestrator ◀┘
//!                                          │
//!                                          ▼
//!                                   CitationValidator
//! ```
//!
//! The pure logic (chunking, change detection, retrieval, validation,
//! orchestration) lives in the `grounded-kb-core` crate. This crate adds
//! the native pieces: SQLite storage, file scanning and extraction,
//! embedding and LLM providers, the watcher, and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store trait |
//! | [`scan`] | Directory walking and path filtering |
//! | [`extract`] | Text extraction (Markdown, text, PDF) |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Text generators |
//! | [`sync`] | Index synchronizer |
//! | [`watch`] | Debounced filesystem watch loop |
//! | [`tools`] | Query tool surface |
//! | [`stats`] | Index statistics |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod llm;
pub mod migrate;
pub mod scan;
pub mod sqlite_store;
pub mod stats;
pub mod sync;
pub mod tools;
pub mod watch;

use std::sync::Arc;

use anyhow::Result;

use grounded_kb_core::chunk::ChunkCodec;

use crate::config::Config;
use crate::scan::FileFilter;
use crate::sqlite_store::SqliteStore;
use crate::sync::Synchronizer;
use crate::tools::KnowledgeBase;

/// Open the index described by `config`: connect, migrate, and wire the
/// store, embedder, and synchronizer together.
pub async fn open(config: &Config) -> Result<KnowledgeBase> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;

    let embedder = embedding::create_embedder(&config.embedding)?;
    let store = Arc::new(SqliteStore::new(pool, embedder.model_name()));
    let filter = FileFilter::new(&config.watch)?;
    let codec = ChunkCodec::new(config.chunking.max_tokens, config.chunking.overlap_tokens);

    let sync = Arc::new(Synchronizer::new(store, embedder, codec, filter));
    Ok(KnowledgeBase::new(
        sync,
        config.retrieval.clone(),
        config.db.path.clone(),
    ))
}
