//! # grounded-kb core
//!
//! Pure logic shared by the `gkb` application: data models, the chunk
//! codec, change detection, the [`Store`](store::Store) abstraction,
//! retrieval, citation validation, prompt rendering, and the answer
//! orchestrator.
//!
//! This crate performs no filesystem or network I/O of its own and pulls
//! in no async runtime. Everything that touches the outside world (the
//! embedding model, the LLM, the vector database) is reached through a
//! trait so tests can substitute in-memory fakes.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Documents, chunks, signatures, index state |
//! | [`chunk`] | Overlapping chunker and deterministic chunk ids |
//! | [`change`] | Diff of the directory tree against the index |
//! | [`store`] | Vector store trait and in-memory implementation |
//! | [`embedding`] | Embedder trait and vector helpers |
//! | [`retrieve`] | Top-k retrieval and the allowed citation set |
//! | [`validate`] | Citation contract checks on generated answers |
//! | [`prompt`] | Context payload and retry prompt rendering |
//! | [`answer`] | Draft, validate, retry-once orchestration |

pub mod answer;
pub mod change;
pub mod chunk;
pub mod embedding;
pub mod models;
pub mod prompt;
pub mod retrieve;
pub mod store;
pub mod validate;
