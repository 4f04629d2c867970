mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use common::{small_codec, watch_config, HashEmbedder, DOCKER_DOC, NOTES_DOC, PYTHON_DOC};
use grounded_kb::config::RetrievalConfig;
use grounded_kb::migrate::migrate;
use grounded_kb::scan::FileFilter;
use grounded_kb::sqlite_store::SqliteStore;
use grounded_kb::sync::Synchronizer;
use grounded_kb::tools::{ChunkFormat, KnowledgeBase, QueryOptions, ToolError};
use grounded_kb_core::answer::{AnswerError, AnswerOrchestrator, Generator};
use grounded_kb_core::prompt::{ContextOptions, Prompt};
use grounded_kb_core::validate::IDK_SENTINEL;

struct Env {
    _tmp: tempfile::TempDir,
    kb: KnowledgeBase,
}

async fn setup() -> Env {
    let tmp = tempfile::TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    for (rel, body) in [
        ("docker/run.md", DOCKER_DOC),
        ("python/venv.md", PYTHON_DOC),
        ("notes.txt", NOTES_DOC),
    ] {
        let p = docs.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    let db_path = tmp.path().join("kb.sqlite");
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true),
        )
        .await
        .unwrap();
    migrate(&pool).await.unwrap();

    let sync = Arc::new(Synchronizer::new(
        Arc::new(SqliteStore::new(pool, "hash-bow")),
        Arc::new(HashEmbedder::default()),
        small_codec(),
        FileFilter::new(&watch_config(&docs)).unwrap(),
    ));
    let kb = KnowledgeBase::new(sync, RetrievalConfig::default(), db_path);
    let report = kb.refresh_knowledge_base().await.unwrap();
    assert_eq!(report.added, 3);
    Env { _tmp: tmp, kb }
}

/// Cites the first chunk id in the prompt; optionally fails first.
struct CitingGenerator {
    calls: AtomicUsize,
    fail_first: bool,
    always_fail: bool,
}

impl CitingGenerator {
    fn new(fail_first: bool, always_fail: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_first,
            always_fail,
        }
    }
}

fn first_chunk_id(prompt: &Prompt) -> String {
    let marker = "CONTEXT:\n[chunk:";
    let start = prompt.user.find(marker).unwrap() + marker.len();
    let end = start + prompt.user[start..].find(']').unwrap();
    prompt.user[start..end].to_string()
}

#[async_trait]
impl Generator for CitingGenerator {
    fn name(&self) -> &str {
        "citing"
    }
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let id = first_chunk_id(prompt);
        if self.always_fail || (self.fail_first && n == 0) {
            return Ok(format!("Use docker run to start it [chunk:{}].", id));
        }
        Ok(format!("Use \"docker run -d nginx\" to start it [chunk:{}].", id))
    }
}

#[tokio::test]
async fn test_query_returns_relevant_group_first() {
    let env = setup().await;
    let resp = env
        .kb
        .query_knowledge_base("docker run nginx container", &QueryOptions::default())
        .await
        .unwrap();
    assert!(!resp.results.is_empty());
    assert!(resp.results.len() <= 5);
    assert_eq!(resp.results[0].source_group, "docker");
    assert!(resp.results[0].citation.contains("chunk="));
}

#[tokio::test]
async fn test_query_rejects_bad_arguments() {
    let env = setup().await;
    let empty = env.kb.query_knowledge_base("  ", &QueryOptions::default()).await;
    assert!(matches!(empty, Err(ToolError::InvalidArgument(_))));

    let zero = QueryOptions {
        n_results: Some(0),
        ..QueryOptions::default()
    };
    assert!(matches!(
        env.kb.query_knowledge_base("docker", &zero).await,
        Err(ToolError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_get_chunk_by_id_formats_and_truncates() {
    let env = setup().await;
    let resp = env
        .kb
        .query_knowledge_base("docker", &QueryOptions::default())
        .await
        .unwrap();
    let id = resp.results[0].id.clone();

    let raw = env
        .kb
        .get_chunk_by_id(&id, Some(10), ChunkFormat::Raw)
        .await
        .unwrap();
    assert_eq!(raw.content.chars().count(), 10);
    assert!(raw.truncated);

    let md = env
        .kb
        .get_chunk_by_id(&id, None, ChunkFormat::Markdown)
        .await
        .unwrap();
    assert!(md.content.starts_with(&format!("### [chunk:{}]", id)));
    assert!(!md.truncated);

    assert!(matches!(
        env.kb.get_chunk_by_id("abc_0001", None, ChunkFormat::Raw).await,
        Err(ToolError::NotFound(_))
    ));
    assert!(matches!(
        env.kb.get_chunk_by_id("no spaces allowed", None, ChunkFormat::Raw).await,
        Err(ToolError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_stats_and_reindex() {
    let env = setup().await;
    let stats = env.kb.get_knowledge_base_stats().await.unwrap();
    assert_eq!(stats.total_documents, 3);
    assert_eq!(stats.embedding_model, "hash-bow");
    assert!(stats.db_size_bytes > 0);
    assert!(stats.last_updated.is_some());

    assert!(matches!(
        env.kb.reindex_knowledge_base(false).await,
        Err(ToolError::Confirmation(_))
    ));
    let report = env.kb.reindex_knowledge_base(true).await.unwrap();
    assert_eq!(report.added, 3);
    let after = env.kb.get_knowledge_base_stats().await.unwrap();
    assert_eq!(after.total_chunks, stats.total_chunks);
}

#[tokio::test]
async fn test_ask_retries_once_then_accepts() {
    let env = setup().await;
    let orch = AnswerOrchestrator::new(
        Arc::new(CitingGenerator::new(true, false)),
        ContextOptions::default(),
    );
    let (retrieval, answer) = env
        .kb
        .ask(&orch, "how do I run nginx in docker", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(answer.attempts, 2);
    assert!(answer.validation.passed);
    assert!(answer
        .validation
        .cited_ids
        .is_subset(&retrieval.allowed_ids()));
}

#[tokio::test]
async fn test_ask_rejects_after_two_ungrounded_drafts() {
    let env = setup().await;
    let orch = AnswerOrchestrator::new(
        Arc::new(CitingGenerator::new(false, true)),
        ContextOptions::default(),
    );
    let err = env
        .kb
        .ask(&orch, "how do I run nginx in docker", &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Answer(AnswerError::Rejected { .. })));
}

#[tokio::test]
async fn test_ask_with_no_hits_is_idk() {
    let env = setup().await;
    let orch = AnswerOrchestrator::new(
        Arc::new(CitingGenerator::new(false, false)),
        ContextOptions::default(),
    );
    let opts = QueryOptions {
        group: Some("does-not-exist".into()),
        ..QueryOptions::default()
    };
    let (_, answer) = env.kb.ask(&orch, "anything", &opts).await.unwrap();
    assert_eq!(answer.answer, IDK_SENTINEL);
    assert_eq!(answer.attempts, 0);
}
