//! Overlapping text chunker with deterministic chunk ids.
//!
//! The [`ChunkCodec`] slides a window of `max_tokens × 4` characters over
//! the extracted document text. Each window ends at the best natural break
//! it contains (paragraph, line, sentence, word, in that order of
//! preference), and the next window starts `overlap_tokens × 4` characters
//! before the previous end, moved forward to a word boundary, so a passage
//! that straddles a boundary appears whole in at least one chunk.
//!
//! Chunk ids are a pure function of `(path, ordinal, content hash)`:
//!
//! ```text
//! <first 16 hex chars of sha256(path \0 ordinal \0 hash)>_<ordinal:04>
//! ```
//!
//! so re-ingesting an unchanged document reproduces the same ids, and any
//! edit to a chunk's text yields a fresh id that cannot collide with the
//! stale one.
//!
//! # Example
//!
//! ```rust
//! use grounded_kb_core::chunk::ChunkCodec;
//! use grounded_kb_core::models::FileKind;
//!
//! let codec = ChunkCodec::new(250, 50);
//! let chunks = codec.chunk("/notes/a.md", "# Title\n\nHello world.", FileKind::Markdown);
//! assert_eq!(chunks.len(), 1);
//! assert!(chunks[0].id.ends_with("_0000"));
//! assert_eq!(chunks[0].headings, vec!["Title".to_string()]);
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, FileKind};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Hex characters of the digest kept in the public chunk id.
const ID_HASH_LEN: usize = 16;

/// Break points, most preferred first.
const BREAKS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Splits text into overlapping chunks and names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    max_chars: usize,
    overlap_chars: usize,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new(250, 50)
    }
}

impl ChunkCodec {
    /// Build a codec from token budgets. The overlap is capped at half
    /// the window so every step makes progress.
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
        let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);
        Self {
            max_chars,
            overlap_chars,
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Chunk a document. Empty or whitespace-only text yields no chunks.
    pub fn chunk(&self, path: &str, text: &str, kind: FileKind) -> Vec<Chunk> {
        let headings = if kind == FileKind::Markdown {
            heading_index(text)
        } else {
            Vec::new()
        };

        self.split(text)
            .into_iter()
            .enumerate()
            .map(|(ordinal, (start, end))| {
                let body = &text[start..end];
                let hash = content_hash(body.as_bytes());
                Chunk {
                    id: id_for(path, ordinal, &hash),
                    ordinal,
                    text: body.to_string(),
                    hash,
                    start_char: start,
                    end_char: end,
                    headings: headings_at(&headings, start),
                }
            })
            .collect()
    }

    /// Chunk texts only, in order.
    pub fn chunk_texts(&self, text: &str) -> Vec<String> {
        self.split(text)
            .into_iter()
            .map(|(s, e)| text[s..e].to_string())
            .collect()
    }

    /// Byte spans `(start, end)` of each chunk, trimmed of surrounding
    /// whitespace. Spans are ordered and consecutive spans overlap.
    pub fn split(&self, text: &str) -> Vec<(usize, usize)> {
        let len = text.len();
        let mut spans = Vec::new();
        let mut start = skip_whitespace(text, 0);

        while start < len {
            let mut hard_end = snap_to_char_boundary(text, (start + self.max_chars).min(len));
            if hard_end <= start {
                hard_end = next_char_boundary(text, start);
            }
            let end = if hard_end == len {
                len
            } else {
                self.find_break(text, start, hard_end)
            };

            let (s, e) = trim_span(text, start, end);
            if s < e {
                spans.push((s, e));
            }
            if end >= len {
                break;
            }

            let back = snap_to_char_boundary(text, end.saturating_sub(self.overlap_chars));
            let next = if back <= start {
                end
            } else {
                align_to_word(text, back, end)
            };
            start = skip_whitespace(text, next);
        }

        spans
    }

    fn find_break(&self, text: &str, start: usize, hard_end: usize) -> usize {
        let window = &text[start..hard_end];
        let min_len = (self.max_chars / 4).max(1);
        for sep in BREAKS {
            if let Some(pos) = window.rfind(sep) {
                let cut = match sep {
                    ". " => pos + 1,
                    " " => pos,
                    _ => pos + sep.len(),
                };
                if cut >= min_len {
                    return start + cut;
                }
            }
        }
        hard_end
    }
}

/// Deterministic chunk id for `(path, ordinal, content_hash)`.
pub fn id_for(path: &str, ordinal: usize, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update((ordinal as u64).to_le_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{:04}", &digest[..ID_HASH_LEN], ordinal)
}

/// SHA-256 of raw bytes, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Whether `id` has the `<hash>_<ordinal>` shape used for citations.
pub fn is_valid_id(id: &str) -> bool {
    match id.rsplit_once('_') {
        Some((hash, ordinal)) => {
            !hash.is_empty()
                && !ordinal.is_empty()
                && hash.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':')
                && ordinal.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}

fn skip_whitespace(s: &str, index: usize) -> usize {
    let rest = &s[index..];
    index + (rest.len() - rest.trim_start().len())
}

fn trim_span(s: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &s[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let body = slice.trim();
    (start + lead, start + lead + body.len())
}

/// Move `pos` forward to the next whitespace before `limit` unless it
/// already sits at the start of a word.
fn align_to_word(s: &str, pos: usize, limit: usize) -> usize {
    let at_word_start = s[..pos].chars().next_back().map_or(true, char::is_whitespace);
    if at_word_start {
        return pos;
    }
    match s[pos..limit].find(char::is_whitespace) {
        Some(i) => pos + i,
        None => pos,
    }
}

/// Heading context changes: `(byte offset of heading line, h1..h3 in effect)`.
fn heading_index(text: &str) -> Vec<(usize, Vec<String>)> {
    let mut out = Vec::new();
    let mut current: [Option<String>; 3] = [None, None, None];
    let mut in_fence = false;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some((level, title)) = parse_heading(trimmed) {
                if level <= 3 {
                    current[level - 1] = Some(title);
                    for slot in current.iter_mut().skip(level) {
                        *slot = None;
                    }
                    out.push((offset, current.iter().flatten().cloned().collect()));
                }
            }
        }
        offset += line.len();
    }

    out
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        None
    } else {
        Some((hashes, title.to_string()))
    }
}

fn headings_at(index: &[(usize, Vec<String>)], pos: usize) -> Vec<String> {
    index
        .iter()
        .rev()
        .find(|(offset, _)| *offset <= pos)
        .map(|(_, h)| h.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let codec = ChunkCodec::default();
        assert!(codec.chunk("/a.md", "", FileKind::Markdown).is_empty());
        assert!(codec.chunk("/a.md", "  \n\n\t ", FileKind::Text).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let codec = ChunkCodec::default();
        let chunks = codec.chunk("/a.txt", "  Hello, world!\n", FileKind::Text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].start_char, 2);
        assert_eq!(chunks[0].end_char, 15);
    }

    #[test]
    fn test_chunks_respect_window_and_overlap() {
        let codec = ChunkCodec::new(10, 2);
        let text = words(200);
        let chunks = codec.chunk("/a.txt", &text, FileKind::Text);
        assert!(chunks.len() > 5);

        for c in &chunks {
            assert!(c.text.len() <= codec.max_chars());
            assert_eq!(&text[c.start_char..c.end_char], c.text);
        }
        for pair in chunks.windows(2) {
            assert!(
                pair[1].start_char < pair[0].end_char,
                "chunk {} does not overlap chunk {}",
                pair[1].ordinal,
                pair[0].ordinal
            );
            assert!(pair[1].start_char > pair[0].start_char);
        }
        assert!(chunks.last().unwrap().text.ends_with("word199"));
    }

    #[test]
    fn test_no_text_is_lost_between_chunks() {
        let codec = ChunkCodec::new(8, 0);
        let text = "First paragraph here.\n\nSecond paragraph is a bit longer than that.\n\nThird.";
        let chunks = codec.chunk("/a.txt", text, FileKind::Text);
        for pair in chunks.windows(2) {
            if pair[1].start_char > pair[0].end_char {
                assert!(text[pair[0].end_char..pair[1].start_char].trim().is_empty());
            }
        }
        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks.last().unwrap().end_char, text.len());
    }

    #[test]
    fn test_prefers_paragraph_breaks() {
        let codec = ChunkCodec::new(10, 0);
        let text = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta iota kappa lambda.";
        let chunks = codec.chunk("/a.txt", text, FileKind::Text);
        assert_eq!(chunks[0].text, "Alpha beta gamma delta.");
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let codec = ChunkCodec::new(1, 0);
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = codec.chunk("/a.txt", text, FileKind::Text);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
            assert!(text.is_char_boundary(c.start_char));
            assert!(text.is_char_boundary(c.end_char));
        }
    }

    #[test]
    fn test_deterministic() {
        let codec = ChunkCodec::new(10, 2);
        let text = words(80);
        let a = codec.chunk("/docs/a.md", &text, FileKind::Markdown);
        let b = codec.chunk("/docs/a.md", &text, FileKind::Markdown);
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_format_and_stability() {
        let id = id_for("/docs/a.md", 3, "abc");
        assert_eq!(id, id_for("/docs/a.md", 3, "abc"));
        assert!(id.ends_with("_0003"));
        assert_eq!(id.len(), ID_HASH_LEN + 5);
        assert!(is_valid_id(&id));
    }

    #[test]
    fn test_id_changes_with_any_input() {
        let base = id_for("/docs/a.md", 0, "h1");
        assert_ne!(base, id_for("/docs/a.md", 0, "h2"));
        assert_ne!(base, id_for("/docs/b.md", 0, "h1"));
        assert_ne!(base, id_for("/docs/a.md", 1, "h1"));
    }

    #[test]
    fn test_edit_changes_only_affected_ids() {
        let codec = ChunkCodec::new(10, 0);
        let before = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta.";
        let after = "Alpha beta gamma delta.\n\nEpsilon zeta eta THETA.";
        let a = codec.chunk("/a.txt", before, FileKind::Text);
        let b = codec.chunk("/a.txt", after, FileKind::Text);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].id, b[0].id);
        assert_ne!(a[1].id, b[1].id);
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("abc_0001"));
        assert!(!is_valid_id("abc"));
        assert!(!is_valid_id("abc_"));
        assert!(!is_valid_id("_0001"));
        assert!(!is_valid_id("a b_0001"));
    }

    #[test]
    fn test_markdown_heading_context() {
        let codec = ChunkCodec::new(8, 0);
        let text = "# Guide\n\nIntro text goes here.\n\n## Install\n\nRun the installer now.\n\n```\n# not a heading\n```\n\n### Linux\n\nUse the package manager.";
        let chunks = codec.chunk("/g.md", text, FileKind::Markdown);
        let first = &chunks[0];
        assert_eq!(first.headings, vec!["Guide".to_string()]);

        let linux = chunks
            .iter()
            .find(|c| c.text.contains("package manager"))
            .unwrap();
        assert_eq!(
            linux.headings,
            vec!["Guide".to_string(), "Install".to_string(), "Linux".to_string()]
        );
    }

    #[test]
    fn test_text_files_have_no_headings() {
        let codec = ChunkCodec::default();
        let chunks = codec.chunk("/a.txt", "# Looks like a heading\n\nbody", FileKind::Text);
        assert!(chunks[0].headings.is_empty());
    }

    #[test]
    fn test_parse_heading() {
        assert_eq!(parse_heading("## Setup ##"), Some((2, "Setup".to_string())));
        assert_eq!(parse_heading("#hashtag"), None);
        assert_eq!(parse_heading("#"), None);
        assert_eq!(parse_heading("plain"), None);
    }
}
