//! Citation validator for generated answers.
//!
//! An answer passes if it is exactly the IDK sentinel, or if every claim
//! in it is grounded: it cites at least one retrieved chunk with a
//! `[chunk:<id>]` marker, every cited id belongs to the allowed set, each
//! claim carries a quoted excerpt, and no web link appears anywhere.
//!
//! Validation is a three-step pipeline: [`parse`] segments the answer
//! into [`ClaimUnit`]s and extracts citations, quotes, and URLs; each
//! [`Rule`] then inspects the parsed answer independently; finally the
//! violations are folded into a [`ValidationResult`]. Every step is total:
//! malformed input produces a [`Rule::Malformed`] violation, never a panic.
//!
//! # Claim segmentation
//!
//! - A newline outside quotation marks always ends a claim.
//! - `.`, `!` or `?` outside quotation marks ends a claim when followed by
//!   whitespace or the end of the text, except after `e.g.`, `i.e.`,
//!   `vs.`, `cf.` and numbered-list markers such as `2.`.
//! - A segment that holds only citation markers and punctuation is
//!   attached to the preceding claim (`... "quote". [chunk:x]`).
//! - Markdown headings and segments without any letter or digit are not
//!   claims.
//! - If quotation marks are unbalanced the answer is flagged malformed and
//!   segmented without quote awareness.
//!
//! # IDK sentinel
//!
//! The sentinel is compared after trimming leading and trailing
//! whitespace only; any other deviation goes through full validation.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// The only accepted "no answer" response.
pub const IDK_SENTINEL: &str = "I don't know based on the provided context.";

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[chunk:([A-Za-z0-9_:\-]+)\]").expect("citation regex"));

static LOOSE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*chunk\s*:").expect("marker regex"));

static QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]*)"|“([^”]*)”"#).expect("quote regex"));

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\bhttps?://[a-z0-9][^\s<>"'\)\]]*|\bwww\.[a-z0-9\-]+\.[a-z]{2,}[^\s<>"'\)\]]*"#,
    )
    .expect("url regex")
});

static SOURCE_TERMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(chapter|page|isbn|edition|wikipedia|stack ?overflow|arxiv|doi|et al|textbook)\b",
    )
    .expect("source terms regex")
});

const ABBREVIATIONS: [&str; 4] = ["e.g", "i.e", "vs", "cf"];

/// A validation rule. Declaration order is reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Every claim cites at least one chunk.
    CitationRequired,
    /// Every cited id was retrieved for this question.
    CitationAllowed,
    /// Every claim quotes an excerpt.
    QuoteRequired,
    /// No web links anywhere.
    NoUrls,
    /// The answer could not be parsed cleanly.
    Malformed,
}

impl Rule {
    pub const ALL: [Rule; 5] = [
        Rule::CitationRequired,
        Rule::CitationAllowed,
        Rule::QuoteRequired,
        Rule::NoUrls,
        Rule::Malformed,
    ];

    /// Position in the citation contract; `0` for the generic malformed rule.
    pub fn number(self) -> u8 {
        match self {
            Rule::CitationRequired => 2,
            Rule::CitationAllowed => 3,
            Rule::QuoteRequired => 4,
            Rule::NoUrls => 5,
            Rule::Malformed => 0,
        }
    }

    /// The rule restated as an instruction for a retry prompt.
    pub fn instruction(self) -> &'static str {
        match self {
            Rule::CitationRequired => {
                "Every sentence must end with at least one citation in the exact form [chunk:<id>]."
            }
            Rule::CitationAllowed => {
                "Cite ONLY chunk ids that appear in the CONTEXT below. Never invent or reuse other ids."
            }
            Rule::QuoteRequired => {
                "Every sentence must include a short verbatim quote from the cited chunk inside double quotes."
            }
            Rule::NoUrls => "Do not include any URLs or web links.",
            Rule::Malformed => {
                "Write plain sentences with balanced double quotes and well-formed [chunk:<id>] markers."
            }
        }
    }

    /// Check this rule alone against a parsed answer.
    pub fn check(self, parsed: &ParsedAnswer, allowed: &BTreeSet<String>) -> Vec<Violation> {
        match self {
            Rule::CitationRequired => parsed
                .units
                .iter()
                .enumerate()
                .filter(|(_, u)| u.citations.is_empty())
                .map(|(i, u)| Violation {
                    rule: self,
                    unit: Some(i),
                    detail: format!("claim {} has no [chunk:<id>] citation: \"{}\"", i + 1, excerpt(&u.text)),
                })
                .collect(),
            Rule::CitationAllowed => parsed
                .citations
                .iter()
                .filter(|id| !allowed.contains(*id))
                .map(|id| Violation {
                    rule: self,
                    unit: None,
                    detail: format!("cited chunk {} was not retrieved for this question", id),
                })
                .collect(),
            Rule::QuoteRequired => parsed
                .units
                .iter()
                .enumerate()
                .filter(|(_, u)| u.quotes.is_empty())
                .map(|(i, u)| Violation {
                    rule: self,
                    unit: Some(i),
                    detail: format!("claim {} has no quoted excerpt: \"{}\"", i + 1, excerpt(&u.text)),
                })
                .collect(),
            Rule::NoUrls => parsed
                .urls
                .iter()
                .map(|url| Violation {
                    rule: self,
                    unit: None,
                    detail: format!("answer contains a URL: {}", url),
                })
                .collect(),
            Rule::Malformed => parsed
                .problems
                .iter()
                .map(|p| Violation {
                    rule: self,
                    unit: None,
                    detail: p.clone(),
                })
                .collect(),
        }
    }
}

/// A specific rule failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: Rule,
    /// Index of the offending claim, when the failure is local to one.
    pub unit: Option<usize>,
    pub detail: String,
}

/// A sentence-like segment of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimUnit {
    pub text: String,
    pub citations: Vec<String>,
    pub quotes: Vec<String>,
}

/// Structural view of an answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAnswer {
    pub units: Vec<ClaimUnit>,
    /// Every well-formed citation id anywhere in the answer.
    pub citations: BTreeSet<String>,
    pub urls: Vec<String>,
    /// Structural problems found while parsing.
    pub problems: Vec<String>,
}

/// Outcome of validating one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub is_idk: bool,
    pub cited_ids: BTreeSet<String>,
    pub disallowed_ids: BTreeSet<String>,
    pub all_units_quoted: bool,
    pub violations: Vec<Violation>,
    /// Non-fatal observations, e.g. references to outside sources.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn idk() -> Self {
        Self {
            passed: true,
            is_idk: true,
            cited_ids: BTreeSet::new(),
            disallowed_ids: BTreeSet::new(),
            all_units_quoted: true,
            violations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn violated_rules(&self) -> BTreeSet<Rule> {
        self.violations.iter().map(|v| v.rule).collect()
    }

    /// First violated rule in reporting order.
    pub fn primary_rule(&self) -> Option<Rule> {
        self.violated_rules().into_iter().next()
    }

    /// One line per violation.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("rule {:?}: {}", v.rule, v.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn is_idk(answer: &str) -> bool {
    answer.trim() == IDK_SENTINEL
}

/// Validate `answer` against the allowed citation set.
pub fn validate(answer: &str, allowed: &BTreeSet<String>) -> ValidationResult {
    if is_idk(answer) {
        return ValidationResult::idk();
    }

    let parsed = parse(answer);
    let violations: Vec<Violation> = Rule::ALL
        .iter()
        .flat_map(|rule| rule.check(&parsed, allowed))
        .collect();

    let disallowed_ids = parsed
        .citations
        .iter()
        .filter(|id| !allowed.contains(*id))
        .cloned()
        .collect();
    let all_units_quoted = !parsed.units.is_empty() && parsed.units.iter().all(|u| !u.quotes.is_empty());

    let warnings = SOURCE_TERMS_RE
        .find_iter(answer)
        .map(|m| m.as_str().to_lowercase())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|term| format!("answer mentions an outside source term: {}", term))
        .collect();

    ValidationResult {
        passed: violations.is_empty(),
        is_idk: false,
        cited_ids: parsed.citations,
        disallowed_ids,
        all_units_quoted,
        violations,
        warnings,
    }
}

/// Segment an answer and extract its citations, quotes, and URLs.
pub fn parse(answer: &str) -> ParsedAnswer {
    let mut problems = Vec::new();

    if answer.trim().is_empty() {
        problems.push("answer is empty".to_string());
    }

    let balanced = quotes_balanced(answer);
    if !balanced {
        problems.push("unbalanced quotation marks".to_string());
    }

    let loose = LOOSE_MARKER_RE.find_iter(answer).count();
    let strict = CITATION_RE.find_iter(answer).count();
    if loose > strict {
        problems.push(format!(
            "{} malformed citation marker(s); use exactly [chunk:<id>]",
            loose - strict
        ));
    }

    let units = build_units(segment(answer, balanced));
    if units.is_empty() && !answer.trim().is_empty() {
        problems.push("answer contains no claims".to_string());
    }

    ParsedAnswer {
        units,
        citations: citations_in(answer).into_iter().collect(),
        urls: URL_RE
            .find_iter(answer)
            .map(|m| m.as_str().to_string())
            .collect(),
        problems,
    }
}

fn citations_in(text: &str) -> Vec<String> {
    CITATION_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn quotes_in(text: &str) -> Vec<String> {
    QUOTE_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

fn quotes_balanced(text: &str) -> bool {
    let straight = text.chars().filter(|c| *c == '"').count();
    let mut depth: i64 = 0;
    for c in text.chars() {
        match c {
            '“' => depth += 1,
            '”' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    straight % 2 == 0 && depth == 0
}

fn segment(text: &str, quote_aware: bool) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_straight = false;
    let mut curly_depth = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quote_aware {
            match c {
                '"' => in_straight = !in_straight,
                '“' => curly_depth += 1,
                '”' => curly_depth = curly_depth.saturating_sub(1),
                _ => {}
            }
        }
        let in_quote = quote_aware && (in_straight || curly_depth > 0);

        if c == '\n' && !in_quote {
            segments.push(std::mem::take(&mut current));
            continue;
        }
        current.push(c);

        if matches!(c, '.' | '!' | '?') && !in_quote {
            let at_break = chars.peek().map_or(true, |n| n.is_whitespace());
            if at_break && !(c == '.' && suppresses_break(&current)) {
                segments.push(std::mem::take(&mut current));
            }
        }
    }
    segments.push(current);
    segments
}

/// `current` ends with `.`; true for abbreviations and list markers.
fn suppresses_break(current: &str) -> bool {
    let before = &current[..current.len() - 1];
    let word = before
        .rsplit(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if ABBREVIATIONS.contains(&word.as_str()) {
        return true;
    }
    let trimmed = before.trim_start();
    !trimmed.is_empty() && trimmed.len() <= 3 && trimmed.chars().all(|c| c.is_ascii_digit())
}

fn is_heading(text: &str) -> bool {
    let hashes = text.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && text[hashes..].starts_with(' ')
}

fn build_units(segments: Vec<String>) -> Vec<ClaimUnit> {
    let mut units: Vec<ClaimUnit> = Vec::new();

    for raw in segments {
        let text = raw.trim();
        if text.is_empty() || is_heading(text) {
            continue;
        }

        let citations = citations_in(text);
        let has_content = CITATION_RE
            .replace_all(text, "")
            .chars()
            .any(char::is_alphanumeric);

        if !has_content {
            if citations.is_empty() {
                continue;
            }
            if let Some(prev) = units.last_mut() {
                prev.citations.extend(citations);
                prev.text.push(' ');
                prev.text.push_str(text);
                continue;
            }
        }

        units.push(ClaimUnit {
            text: text.to_string(),
            quotes: quotes_in(text),
            citations,
        });
    }

    units
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 80;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{}…", cut)
    }
}
