//! # Grounded KB CLI (`gkb`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gkb init` | Create the SQLite database and run schema migrations |
//! | `gkb sync` | Incrementally sync the watched folder into the index |
//! | `gkb reindex --yes` | Delete everything and re-ingest the whole folder |
//! | `gkb watch` | Sync, then follow filesystem events until Ctrl-C |
//! | `gkb query "<q>"` | Show the top-k chunks for a question |
//! | `gkb chunk <id>` | Print one chunk |
//! | `gkb stats` | Index statistics |
//! | `gkb ask "<q>"` | Answer a question with validated citations |
//!
//! ## Examples
//!
//! ```bash
//! gkb init --config ./config/gkb.toml
//! gkb sync
//! gkb query "how do I run nginx in docker" -k 3
//! gkb ask "how do I run nginx in docker" --prefer docker
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `warn`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use grounded_kb::config::{self, Config};
use grounded_kb::sync::SyncReport;
use grounded_kb::tools::{ChunkFormat, KnowledgeBase, QueryOptions, ToolError};
use grounded_kb::watch::{spawn_watch_loop, start_fs_watcher};
use grounded_kb::{llm, migrate, stats};
use grounded_kb_core::answer::{AnswerError, AnswerOrchestrator};

/// Grounded KB: a synced vector index of your docs folder, with answers
/// that must cite and quote what they claim.
#[derive(Parser)]
#[command(name = "gkb", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gkb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Diff the watched folder against the index and apply the changes.
    Sync,

    /// Delete every chunk and re-ingest the whole folder.
    Reindex {
        /// Confirm the full rebuild.
        #[arg(long)]
        yes: bool,
    },

    /// Run a full sync, then keep the index current from filesystem events.
    Watch,

    /// Retrieve the chunks most similar to a question.
    Query {
        query: String,
        /// Number of results.
        #[arg(short = 'k', long)]
        n_results: Option<usize>,
        /// Only search this source group.
        #[arg(long)]
        group: Option<String>,
        /// Prefer this source group when scores tie.
        #[arg(long)]
        prefer: Option<String>,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Print a chunk by id.
    Chunk {
        id: String,
        #[arg(long)]
        max_chars: Option<usize>,
        /// `raw` or `markdown`.
        #[arg(long, default_value = "raw")]
        format: String,
    },

    /// Show index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Answer a question using only retrieved chunks.
    Ask {
        question: String,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        prefer: Option<String>,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Sync => {
            let kb = grounded_kb::open(&cfg).await?;
            let report = kb.refresh_knowledge_base().await?;
            print_report("sync", &report);
            if !report.failures.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Reindex { yes } => {
            let kb = grounded_kb::open(&cfg).await?;
            match kb.reindex_knowledge_base(yes).await {
                Ok(report) => print_report("reindex", &report),
                Err(ToolError::Confirmation(msg)) => {
                    eprintln!("{} (use --yes)", msg);
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Watch => run_watch(&cfg).await?,
        Commands::Query {
            query,
            n_results,
            group,
            prefer,
            json,
        } => {
            let kb = grounded_kb::open(&cfg).await?;
            let opts = QueryOptions {
                n_results,
                group,
                prefer_group: prefer,
            };
            let response = kb.query_knowledge_base(&query, &opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in response.results.iter().enumerate() {
                    println!("{}. [{:.3}] [chunk:{}]", i + 1, r.score, r.id);
                    println!("    {}", r.citation);
                    println!("    {}", r.snippet);
                    println!();
                }
            }
        }
        Commands::Chunk {
            id,
            max_chars,
            format,
        } => {
            let kb = grounded_kb::open(&cfg).await?;
            let format: ChunkFormat = format.parse()?;
            let chunk = kb.get_chunk_by_id(&id, max_chars, format).await?;
            if format == ChunkFormat::Raw {
                println!("{}", chunk.citation);
                println!();
            }
            println!("{}", chunk.content);
        }
        Commands::Stats { json } => {
            let kb = grounded_kb::open(&cfg).await?;
            let s = kb.get_knowledge_base_stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                stats::print_stats(&s);
            }
        }
        Commands::Ask {
            question,
            group,
            prefer,
            json,
        } => {
            let kb = grounded_kb::open(&cfg).await?;
            return ask(&cfg, &kb, &question, group, prefer, json).await;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_watch(cfg: &Config) -> Result<()> {
    let kb = grounded_kb::open(cfg).await?;
    let sync = kb.synchronizer().clone();
    let root = sync.filter().root().to_path_buf();

    let handle = spawn_watch_loop(
        sync,
        Duration::from_millis(cfg.watch.debounce_ms),
        cfg.watch.queue_capacity,
    );
    let _watcher = start_fs_watcher(&root, handle.sender())?;
    println!("Watching {} (Ctrl-C to stop)", root.display());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; finishing in-flight work");
    let summary = handle.stop().await?;
    println!(
        "watch stopped: {} applied, {} touched, {} empty, {} deferred, {} failed",
        summary.applied, summary.touched, summary.empty, summary.deferred, summary.failed
    );
    Ok(())
}

async fn ask(
    cfg: &Config,
    kb: &KnowledgeBase,
    question: &str,
    group: Option<String>,
    prefer: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    let generator = llm::create_generator(&cfg.llm)?;
    let orchestrator = AnswerOrchestrator::new(generator, cfg.retrieval.context_options());
    let opts = QueryOptions {
        n_results: None,
        group,
        prefer_group: prefer,
    };

    match kb.ask(&orchestrator, question, &opts).await {
        Ok((retrieval, answer)) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "question": retrieval.question,
                        "answer": answer,
                        "sources": retrieval.hits.iter().map(|h| &h.chunk.id).collect::<Vec<_>>(),
                    }))?
                );
            } else {
                println!("{}", answer.answer);
                for warning in &answer.validation.warnings {
                    eprintln!("warning: {}", warning);
                }
                if !answer.is_idk() {
                    println!();
                    println!("Sources:");
                    for id in &answer.validation.cited_ids {
                        if let Some(hit) = retrieval.hits.iter().find(|h| &h.chunk.id == id) {
                            println!("  [chunk:{}] {}", id, hit.chunk.path);
                        }
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(ToolError::Answer(AnswerError::Rejected {
            first,
            second,
            second_draft,
            ..
        })) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "question": question,
                        "rejected": true,
                        "first": first,
                        "second": second,
                        "last_draft": second_draft,
                    }))?
                );
            } else {
                eprintln!("Answer rejected: no grounded answer after one retry.");
                eprintln!("  first draft:  {}", first.summary());
                eprintln!("  second draft: {}", second.summary());
            }
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(label: &str, report: &SyncReport) {
    println!("{}", label);
    println!("  added:     {}", report.added);
    println!("  updated:   {}", report.updated);
    println!("  deleted:   {}", report.deleted);
    println!("  touched:   {}", report.touched);
    println!("  unchanged: {}", report.unchanged);
    println!("  empty:     {}", report.empty);
    println!("  chunks written:     {}", report.chunks_written);
    println!("  embeddings written: {}", report.embeddings_written);
    for path in &report.deferred {
        println!("  deferred: {}", path);
    }
    for f in &report.failures {
        println!("  failed: {} ({})", f.path, f.error);
    }
    if report.failures.is_empty() {
        println!("ok");
    }
}
