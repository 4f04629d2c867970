//! Answer orchestration: draft, validate, retry once, then accept or fail.
//!
//! ```text
//! Draft1 → Validate1 ─ pass ──────────────────────────▶ Done
//!                    └ fail → Draft2 (strict) → Validate2 ─ pass ▶ Done
//!                                                        └ fail ▶ Rejected
//! ```
//!
//! A rejected question surfaces as [`AnswerError::Rejected`] carrying both
//! validation results; the caller never receives an unvalidated draft.
//! An empty retrieval short-circuits to the IDK sentinel without calling
//! the generator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::prompt::{answer_prompt, build_context, strict_retry_prompt, ContextOptions, Prompt};
use crate::retrieve::Retrieval;
use crate::validate::{validate, ValidationResult, IDK_SENTINEL};

/// A text generator (LLM): `generate(prompt) -> text`.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &Prompt) -> anyhow::Result<String>;
}

pub type SharedGenerator = Arc<dyn Generator>;

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Draft1,
    Validate1,
    Draft2,
    Validate2,
    Done,
    Rejected,
}

/// A validated answer.
#[derive(Debug, Clone, Serialize)]
pub struct GroundedAnswer {
    pub answer: String,
    /// Generator calls made: 0 (nothing retrieved), 1, or 2.
    pub attempts: u8,
    pub validation: ValidationResult,
}

impl GroundedAnswer {
    pub fn is_idk(&self) -> bool {
        self.validation.is_idk
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("answer rejected after retry: {}", .second.summary())]
    Rejected {
        first_draft: String,
        first: Box<ValidationResult>,
        second_draft: String,
        second: Box<ValidationResult>,
    },
    #[error("generation failed at {stage:?}: {source:#}")]
    Generation {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

pub struct AnswerOrchestrator {
    generator: SharedGenerator,
    context: ContextOptions,
}

impl AnswerOrchestrator {
    pub fn new(generator: SharedGenerator, context: ContextOptions) -> Self {
        Self { generator, context }
    }

    /// Answer the retrieval's question using only its hits.
    pub async fn answer(&self, retrieval: &Retrieval) -> Result<GroundedAnswer, AnswerError> {
        let question = retrieval.question.as_str();
        if retrieval.is_empty() {
            debug!(question, "nothing retrieved; answering with the IDK sentinel");
            return Ok(GroundedAnswer {
                answer: IDK_SENTINEL.to_string(),
                attempts: 0,
                validation: validate(IDK_SENTINEL, &retrieval.allowed_ids()),
            });
        }

        let allowed = retrieval.allowed_ids();
        let context = build_context(retrieval, &self.context);

        let first_draft = self
            .draft(Stage::Draft1, &answer_prompt(question, &context))
            .await?;
        debug!(stage = ?Stage::Validate1, "validating first draft");
        let first = validate(&first_draft, &allowed);
        if first.passed {
            debug!(stage = ?Stage::Done, attempts = 1, "answer accepted");
            return Ok(GroundedAnswer {
                answer: first_draft,
                attempts: 1,
                validation: first,
            });
        }
        warn!(
            question,
            violations = %first.summary(),
            "first draft failed validation; retrying with strict prompt"
        );

        let retry = strict_retry_prompt(question, &context, &allowed, &first_draft, &first);
        let second_draft = self.draft(Stage::Draft2, &retry).await?;
        debug!(stage = ?Stage::Validate2, "validating second draft");
        let second = validate(&second_draft, &allowed);
        if second.passed {
            debug!(stage = ?Stage::Done, attempts = 2, "answer accepted");
            return Ok(GroundedAnswer {
                answer: second_draft,
                attempts: 2,
                validation: second,
            });
        }

        warn!(
            stage = ?Stage::Rejected,
            question,
            allowed = ?allowed,
            first = %first.summary(),
            second = %second.summary(),
            "answer rejected after retry"
        );
        Err(AnswerError::Rejected {
            first_draft,
            first: Box::new(first),
            second_draft,
            second: Box::new(second),
        })
    }

    async fn draft(&self, stage: Stage, prompt: &Prompt) -> Result<String, AnswerError> {
        debug!(stage = ?stage, generator = self.generator.name(), "requesting draft");
        self.generator
            .generate(prompt)
            .await
            .map_err(|source| AnswerError::Generation { stage, source })
    }
}
