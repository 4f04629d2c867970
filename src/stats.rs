//! Knowledge-base statistics.
//!
//! Backs both `gkb stats` and the `get_knowledge_base_stats` tool: chunk
//! and document counts, per-group breakdown, database size, and when the
//! newest document was last modified.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use grounded_kb_core::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub total_chunks: usize,
    pub total_documents: usize,
    pub embedded_chunks: usize,
    /// Documents per source group.
    pub groups: BTreeMap<String, usize>,
    pub db_path: String,
    pub db_size_bytes: u64,
    pub embedding_model: String,
    /// Newest document mtime, RFC 3339.
    pub last_updated: Option<String>,
}

pub async fn collect_stats(store: &dyn Store, db_path: &Path, embedding_model: &str) -> Result<KbStats> {
    let stats = store.stats().await?;
    let db_size_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    Ok(KbStats {
        total_chunks: stats.total_chunks,
        total_documents: stats.total_documents,
        embedded_chunks: stats.embedded_chunks,
        groups: stats.groups,
        db_path: db_path.display().to_string(),
        db_size_bytes,
        embedding_model: embedding_model.to_string(),
        last_updated: stats
            .last_modified
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339()),
    })
}

pub fn print_stats(stats: &KbStats) {
    println!("Grounded KB — Index Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", stats.db_path);
    println!("  Size:        {}", format_bytes(stats.db_size_bytes));
    println!("  Model:       {}", stats.embedding_model);
    println!();
    println!("  Documents:   {}", stats.total_documents);
    println!("  Chunks:      {}", stats.total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded_chunks,
        stats.total_chunks,
        if stats.total_chunks > 0 {
            (stats.embedded_chunks * 100) / stats.total_chunks
        } else {
            0
        }
    );
    let updated = stats
        .last_updated
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| format_ts_relative(dt.timestamp()))
        .unwrap_or_else(|| "never".to_string());
    println!("  Updated:     {}", updated);

    if !stats.groups.is_empty() {
        println!();
        println!("  By group:");
        println!("  {:<24} {:>6}", "GROUP", "DOCS");
        println!("  {}", "-".repeat(31));
        let mut groups: Vec<(&String, &usize)> = stats.groups.iter().collect();
        groups.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (group, docs) in groups {
            println!("  {:<24} {:>6}", group, docs);
        }
    }
    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Unix seconds as "3 hours ago", falling back to a date past 30 days.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 0 => format_ts_date(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_date(ts),
    }
}

fn format_ts_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounded_kb_core::store::memory::InMemoryStore;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }

    #[tokio::test]
    async fn test_collect_stats_on_empty_store() {
        let store = InMemoryStore::new();
        let stats = collect_stats(&store, Path::new("/nonexistent/kb.sqlite"), "test")
            .await
            .unwrap();
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.db_size_bytes, 0);
        assert!(stats.last_updated.is_none());
    }
}
