//! Top-k retrieval and the allowed citation set.
//!
//! Retrieval embeds the question, asks the store for its nearest
//! neighbours, and optionally drops hits below a similarity floor. The
//! only reordering applied is among hits with exactly equal scores: when
//! the caller names a group hint, tied hits from that group move first.
//!
//! The ids in a [`Retrieval`] are the *allowed citation set* for the
//! question; an answer may cite nothing else.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::Serialize;

use crate::embedding::{embed_one, Embedder};
use crate::models::ChunkRecord;
use crate::store::Store;

/// Bundles the inputs of one retrieval call.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest<'a> {
    pub question: &'a str,
    pub k: usize,
    /// Preferred group for breaking score ties.
    pub group_hint: Option<&'a str>,
    /// Restrict results to one group.
    pub group_filter: Option<&'a str>,
    /// Drop hits scoring below this cosine similarity.
    pub min_score: Option<f32>,
}

/// One retrieved chunk.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub chunk: ChunkRecord,
    pub score: f32,
}

/// Result of a retrieval call, best hit first.
#[derive(Debug, Clone, Serialize)]
pub struct Retrieval {
    pub question: String,
    pub hits: Vec<Hit>,
}

impl Retrieval {
    pub fn empty(question: &str) -> Self {
        Self {
            question: question.to_string(),
            hits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Exactly the ids returned by this call.
    pub fn allowed_ids(&self) -> BTreeSet<String> {
        self.hits.iter().map(|h| h.chunk.id.clone()).collect()
    }
}

/// Run a retrieval against `store` using `embedder` for the question.
pub async fn search(
    store: &dyn Store,
    embedder: &dyn Embedder,
    req: &RetrievalRequest<'_>,
) -> Result<Retrieval> {
    let question = req.question.trim();
    if question.is_empty() || req.k == 0 {
        return Ok(Retrieval::empty(req.question));
    }

    let vector = embed_one(embedder, question).await?;
    let neighbors = store.nearest(&vector, req.k, req.group_filter).await?;

    let mut hits: Vec<Hit> = neighbors
        .into_iter()
        .filter(|n| req.min_score.map_or(true, |min| n.score >= min))
        .map(|n| Hit {
            chunk: n.chunk,
            score: n.score,
        })
        .collect();

    if let Some(hint) = req.group_hint {
        prefer_group_on_ties(&mut hits, hint);
    }

    tracing::debug!(
        question = question,
        hits = hits.len(),
        "retrieval complete"
    );

    Ok(Retrieval {
        question: req.question.to_string(),
        hits,
    })
}

/// Stable reorder: equal scores put `group` first, otherwise order is kept.
pub fn prefer_group_on_ties(hits: &mut [Hit], group: &str) {
    hits.sort_by(|a, b| {
        b.score.total_cmp(&a.score).then_with(|| {
            let a_miss = a.chunk.source_group != group;
            let b_miss = b.chunk.source_group != group;
            a_miss.cmp(&b_miss)
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileKind, Signature};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("docker") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
    }

    fn record(path: &str, id: &str, group: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.into(),
            path: path.into(),
            ordinal: 0,
            text: "t".into(),
            hash: "h".into(),
            source_group: group.into(),
            kind: FileKind::Markdown,
            signature: Signature {
                mtime: 0,
                hash: "d".into(),
            },
            start_char: 0,
            end_char: 1,
            headings: vec![],
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        for (path, id, group, v) in [
            ("/r/a/1.md", "a_0000", "aaa", vec![1.0, 0.0]),
            ("/r/z/1.md", "z_0000", "zzz", vec![1.0, 0.0]),
            ("/r/m/1.md", "m_0000", "mmm", vec![0.0, 1.0]),
        ] {
            let vectors = HashMap::from([(id.to_string(), v)]);
            store
                .replace_document(path, &[record(path, id, group)], &vectors)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_allowed_set_is_exactly_returned_ids() {
        let store = seeded().await;
        let req = RetrievalRequest {
            question: "docker run",
            k: 2,
            ..Default::default()
        };
        let r = search(&store, &AxisEmbedder, &req).await.unwrap();
        assert_eq!(r.hits.len(), 2);
        let allowed = r.allowed_ids();
        assert_eq!(allowed.len(), 2);
        assert!(!allowed.contains("m_0000"));
    }

    #[tokio::test]
    async fn test_group_hint_reorders_ties_only() {
        let store = seeded().await;
        let plain = search(
            &store,
            &AxisEmbedder,
            &RetrievalRequest {
                question: "docker",
                k: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(plain.hits[0].chunk.id, "a_0000");

        let hinted = search(
            &store,
            &AxisEmbedder,
            &RetrievalRequest {
                question: "docker",
                k: 3,
                group_hint: Some("zzz"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hinted.hits[0].chunk.id, "z_0000");
        assert_eq!(hinted.hits[1].chunk.id, "a_0000");

        let lower = search(
            &store,
            &AxisEmbedder,
            &RetrievalRequest {
                question: "docker",
                k: 3,
                group_hint: Some("mmm"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(lower.hits[2].chunk.id, "m_0000");
    }

    #[tokio::test]
    async fn test_min_score_and_empty_question() {
        let store = seeded().await;
        let r = search(
            &store,
            &AxisEmbedder,
            &RetrievalRequest {
                question: "docker",
                k: 3,
                min_score: Some(0.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(r.hits.len(), 2);

        let empty = search(
            &store,
            &AxisEmbedder,
            &RetrievalRequest {
                question: "   ",
                k: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(empty.is_empty());
    }
}
