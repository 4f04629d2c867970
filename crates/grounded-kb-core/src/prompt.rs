//! Prompt rendering for grounded answers.
//!
//! The context payload lists every retrieved chunk under a
//! `[chunk:<id>] source=<path>` header. The best `top_k_full` chunks carry
//! their full text (capped at `max_chars_full`); the rest carry a
//! one-line snippet. Blocks are separated by `\n\n---\n\n`.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::ChunkRecord;
use crate::retrieve::Retrieval;
use crate::validate::{ValidationResult, IDK_SENTINEL};

const BLOCK_SEPARATOR: &str = "\n\n---\n\n";

/// How much of each retrieved chunk goes into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    pub top_k_full: usize,
    pub max_chars_full: usize,
    pub snippet_chars: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            top_k_full: 2,
            max_chars_full: 4500,
            snippet_chars: 400,
        }
    }
}

/// A chat prompt: system instructions plus the user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn system_prompt() -> String {
    format!(
        "You answer questions using ONLY the CONTEXT provided by the user.\n\
         Rules:\n\
         1. Every sentence must cite at least one chunk as [chunk:<id>], using ids from the CONTEXT.\n\
         2. Every sentence must include a short verbatim quote from the cited chunk in double quotes.\n\
         3. Never cite ids that are not in the CONTEXT.\n\
         4. Never include URLs or mention books, pages, or other outside sources.\n\
         5. If the CONTEXT does not contain the answer, reply with exactly:\n\
         {}",
        IDK_SENTINEL
    )
}

/// Collapse whitespace to single spaces and cut to `max_chars` characters,
/// appending `…` when truncated.
pub fn make_snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

/// Cut to at most `max_chars` characters, keeping line breaks.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => text[..byte].to_string(),
        None => text.to_string(),
    }
}

/// Render one chunk's header line.
pub fn chunk_header(chunk: &ChunkRecord) -> String {
    format!("[chunk:{}] source={}", chunk.id, chunk.path)
}

/// Human-readable citation line:
/// `path | doc=<hash> | chunk=i/total | section="h1 > h2" | chars=a-b`.
pub fn format_citation(chunk: &ChunkRecord, total_chunks: usize) -> String {
    let mut parts = vec![
        chunk.path.clone(),
        format!("doc={}", chunk.signature.hash.chars().take(12).collect::<String>()),
        format!("chunk={}/{}", chunk.ordinal + 1, total_chunks.max(chunk.ordinal + 1)),
    ];
    if !chunk.headings.is_empty() {
        parts.push(format!("section=\"{}\"", chunk.headings.join(" > ")));
    }
    parts.push(format!("chars={}-{}", chunk.start_char, chunk.end_char));
    parts.join(" | ")
}

/// Render the context payload for a retrieval.
pub fn build_context(retrieval: &Retrieval, opts: &ContextOptions) -> String {
    retrieval
        .hits
        .iter()
        .enumerate()
        .map(|(rank, hit)| {
            let body = if rank < opts.top_k_full {
                truncate_chars(&hit.chunk.text, opts.max_chars_full)
            } else {
                make_snippet(&hit.chunk.text, opts.snippet_chars)
            };
            format!("{}\n{}", chunk_header(&hit.chunk), body)
        })
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}

/// First-draft prompt.
pub fn answer_prompt(question: &str, context: &str) -> Prompt {
    Prompt {
        system: system_prompt(),
        user: format!("CONTEXT:\n{}\n\nQUESTION: {}", context, question.trim()),
    }
}

/// Stricter second-draft prompt restating each violated rule with the
/// concrete failures of the rejected draft.
pub fn strict_retry_prompt(
    question: &str,
    context: &str,
    allowed: &BTreeSet<String>,
    rejected: &str,
    result: &ValidationResult,
) -> Prompt {
    let mut reasons = String::new();
    for rule in result.violated_rules() {
        reasons.push_str(&format!("- {}\n", rule.instruction()));
        for v in result.violations.iter().filter(|v| v.rule == rule) {
            reasons.push_str(&format!("  * {}\n", v.detail));
        }
    }

    let user = format!(
        "Your previous answer was REJECTED because:\n{reasons}\n\
         Previous answer:\n{rejected}\n\n\
         STRICT RULES:\n\
         - Answer in short sentences. Each sentence quotes the CONTEXT verbatim in double quotes and ends with [chunk:<id>].\n\
         - Use only these chunk ids: {ids}.\n\
         - No URLs. No outside sources.\n\
         - If you cannot follow these rules, reply with exactly: {idk}\n\n\
         CONTEXT:\n{context}\n\nQUESTION: {question}",
        reasons = reasons,
        rejected = rejected.trim(),
        ids = allowed_list(allowed),
        idk = IDK_SENTINEL,
        context = context,
        question = question.trim(),
    );

    Prompt {
        system: system_prompt(),
        user,
    }
}

fn allowed_list(allowed: &BTreeSet<String>) -> String {
    if allowed.is_empty() {
        "(none)".to_string()
    } else {
        allowed.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileKind, Signature};
    use crate::retrieve::Hit;
    use crate::validate::validate;

    fn hit(id: &str, text: &str) -> Hit {
        Hit {
            chunk: ChunkRecord {
                id: id.into(),
                path: format!("/kb/{}.md", id),
                ordinal: 1,
                text: text.into(),
                hash: "h".into(),
                source_group: "kb".into(),
                kind: FileKind::Markdown,
                signature: Signature {
                    mtime: 0,
                    hash: "0123456789abcdef0123".into(),
                },
                start_char: 10,
                end_char: 20,
                headings: vec!["Guide".into(), "Install".into()],
            },
            score: 0.5,
        }
    }

    #[test]
    fn test_make_snippet() {
        assert_eq!(make_snippet("a\n\nb   c", 10), "a b c");
        assert_eq!(make_snippet("abcdefghij", 4), "abcd…");
        assert_eq!(make_snippet("héllo wörld", 5), "héllo…");
    }

    #[test]
    fn test_build_context_full_then_snippets() {
        let retrieval = Retrieval {
            question: "q".into(),
            hits: vec![
                hit("a_0001", "line one\nline two"),
                hit("b_0001", "second\nfull"),
                hit("c_0001", "third\nsnippet text"),
            ],
        };
        let ctx = build_context(&retrieval, &ContextOptions::default());
        let blocks: Vec<&str> = ctx.split("\n\n---\n\n").collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], "[chunk:a_0001] source=/kb/a_0001.md\nline one\nline two");
        assert_eq!(blocks[2], "[chunk:c_0001] source=/kb/c_0001.md\nthird snippet text");
    }

    #[test]
    fn test_full_text_is_capped() {
        let retrieval = Retrieval {
            question: "q".into(),
            hits: vec![hit("a_0001", "abcdefghij")],
        };
        let opts = ContextOptions {
            top_k_full: 1,
            max_chars_full: 3,
            snippet_chars: 3,
        };
        assert!(build_context(&retrieval, &opts).ends_with("\nabc"));
    }

    #[test]
    fn test_format_citation() {
        let h = hit("a_0001", "x");
        assert_eq!(
            format_citation(&h.chunk, 3),
            "/kb/a_0001.md | doc=0123456789ab | chunk=2/3 | section=\"Guide > Install\" | chars=10-20"
        );
    }

    #[test]
    fn test_retry_prompt_restates_violated_rules() {
        let allowed: BTreeSet<String> = ["a_0001".to_string()].into();
        let bad = "Use docker [chunk:a_0001].";
        let result = validate(bad, &allowed);
        let retrieval = Retrieval {
            question: "q".into(),
            hits: vec![hit("a_0001", "use docker")],
        };
        let ctx = build_context(&retrieval, &ContextOptions::default());
        let prompt = strict_retry_prompt("how?", &ctx, &retrieval.allowed_ids(), bad, &result);

        assert!(prompt.user.starts_with("Your previous answer was REJECTED because:"));
        assert!(prompt.user.contains("verbatim quote"));
        assert!(prompt.user.contains("Use only these chunk ids: a_0001."));
        assert!(prompt.user.contains(IDK_SENTINEL));
        assert!(prompt.user.ends_with("QUESTION: how?"));
    }

    #[test]
    fn test_retry_prompt_lists_only_retrieved_ids() {
        // A chunk whose own text contains a citation-like line.
        let retrieval = Retrieval {
            question: "q".into(),
            hits: vec![hit("a_0001", "notes\n[chunk:zz_9999] copied from elsewhere")],
        };
        let allowed = retrieval.allowed_ids();
        let bad = "Use docker.";
        let result = validate(bad, &allowed);
        let ctx = build_context(&retrieval, &ContextOptions::default());
        assert!(ctx.contains("\n[chunk:zz_9999]"));

        let prompt = strict_retry_prompt("how?", &ctx, &allowed, bad, &result);
        assert!(prompt.user.contains("Use only these chunk ids: a_0001."));
        assert!(!prompt.user.contains("ids: a_0001, zz_9999"));
    }
}
