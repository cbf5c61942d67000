// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staged enrichment pipeline orchestrator.
//!
//! The stage graph is a closed enum validated at startup, so an unknown stage
//! is unrepresentable and a dependency ordering mistake fails fast instead of
//! silently no-opping. Stages run strictly in dependency order; only the
//! case-law fan-out runs sub-queries concurrently, joined before advancing.
//!
//! Every stage output is checkpointed to durable storage immediately on
//! success. On stage failure the pipeline stops advancing, the failing stage
//! and error are recorded, and prior checkpoints stay intact and queryable.
//! There is no resume-from-checkpoint; a full re-run is the only retry path.

mod context;

pub use context::{CaseInput, EnrichmentContext};

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::ratelimit::{RateLimiter, RetryPolicy, estimate_tokens, retry_with_backoff};
use crate::services::EnrichmentServices;

/// The closed set of enrichment stages, in no particular order.
/// Execution order and dependencies are defined by [`StageKind::PLAN`] and
/// [`StageKind::dependencies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Extract text from attached documents.
    DocumentExtraction,
    /// Structure the raw case material into intake facts.
    IntakeAnalysis,
    /// Determine the governing jurisdiction.
    JurisdictionAnalysis,
    /// Enrich the case with derived legal framing.
    CaseEnhancement,
    /// Query external case-law sources (fan-out, joined).
    CaseLawSearch,
    /// Analyze the retrieved opinions.
    OpinionAnalysis,
    /// Score case complexity.
    ComplexityScore,
    /// Predict the likely outcome.
    OutcomePrediction,
    /// Produce supplementary analyses for the final report.
    SupplementaryAnalysis,
}

impl StageKind {
    /// Execution order of the pipeline.
    pub const PLAN: [StageKind; 9] = [
        StageKind::DocumentExtraction,
        StageKind::IntakeAnalysis,
        StageKind::JurisdictionAnalysis,
        StageKind::CaseEnhancement,
        StageKind::CaseLawSearch,
        StageKind::OpinionAnalysis,
        StageKind::ComplexityScore,
        StageKind::OutcomePrediction,
        StageKind::SupplementaryAnalysis,
    ];

    /// Stable string name used in stage checkpoint rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::DocumentExtraction => "document_extraction",
            StageKind::IntakeAnalysis => "intake_analysis",
            StageKind::JurisdictionAnalysis => "jurisdiction_analysis",
            StageKind::CaseEnhancement => "case_enhancement",
            StageKind::CaseLawSearch => "case_law_search",
            StageKind::OpinionAnalysis => "opinion_analysis",
            StageKind::ComplexityScore => "complexity_score",
            StageKind::OutcomePrediction => "outcome_prediction",
            StageKind::SupplementaryAnalysis => "supplementary_analysis",
        }
    }

    /// Stages that must have completed before this one may run.
    pub fn dependencies(&self) -> &'static [StageKind] {
        match self {
            StageKind::DocumentExtraction => &[],
            StageKind::IntakeAnalysis => &[StageKind::DocumentExtraction],
            StageKind::JurisdictionAnalysis => &[StageKind::IntakeAnalysis],
            StageKind::CaseEnhancement => {
                &[StageKind::IntakeAnalysis, StageKind::JurisdictionAnalysis]
            }
            StageKind::CaseLawSearch => &[StageKind::CaseEnhancement],
            StageKind::OpinionAnalysis => &[StageKind::CaseLawSearch],
            StageKind::ComplexityScore => {
                &[StageKind::CaseEnhancement, StageKind::OpinionAnalysis]
            }
            StageKind::OutcomePrediction => &[StageKind::ComplexityScore],
            StageKind::SupplementaryAnalysis => &[StageKind::OutcomePrediction],
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that every stage's dependencies precede it in [`StageKind::PLAN`].
pub fn validate_plan() -> Result<()> {
    for (index, stage) in StageKind::PLAN.iter().enumerate() {
        for dep in stage.dependencies() {
            let dep_index = StageKind::PLAN
                .iter()
                .position(|s| s == dep)
                .ok_or_else(|| CoreError::Validation {
                    field: "stage_plan".to_string(),
                    message: format!("stage '{stage}' depends on '{dep}' which is not planned"),
                })?;
            if dep_index >= index {
                return Err(CoreError::Validation {
                    field: "stage_plan".to_string(),
                    message: format!(
                        "stage '{stage}' depends on '{dep}' which runs later in the plan"
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Model name used for all LLM stages; also the rate-limit resource key.
    pub model: String,
    /// Case-law sources queried by the fan-out stage. Each source is its own
    /// rate-limit resource.
    pub search_sources: Vec<String>,
    /// Retry policy for transient external failures within a stage.
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: "enrichment-llm".to_string(),
            search_sources: vec!["courtlistener".to_string(), "openlegal".to_string()],
            retry: RetryPolicy::default(),
        }
    }
}

/// Runs the stage plan for one case, checkpointing as it goes.
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    services: Arc<dyn EnrichmentServices>,
    limiter: RateLimiter,
    config: PipelineConfig,
}

impl Orchestrator {
    /// Create an orchestrator, validating the stage plan up front.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        services: Arc<dyn EnrichmentServices>,
        limiter: RateLimiter,
        config: PipelineConfig,
    ) -> Result<Self> {
        validate_plan()?;
        if config.search_sources.is_empty() {
            return Err(CoreError::Validation {
                field: "search_sources".to_string(),
                message: "at least one case-law source is required".to_string(),
            });
        }
        Ok(Self {
            persistence,
            services,
            limiter,
            config,
        })
    }

    /// Run the full pipeline for one case.
    ///
    /// Returns the accumulated context on success. On stage failure the
    /// failing stage row is marked failed with the error, prior checkpoints
    /// are left untouched, and a [`CoreError::StageFailed`] naming the stage
    /// propagates to the caller.
    #[instrument(skip(self, input), fields(case_id = %input.case_id))]
    pub async fn run(&self, input: CaseInput) -> Result<EnrichmentContext> {
        let mut ctx = EnrichmentContext::from_input(input);

        for stage in StageKind::PLAN {
            self.persistence
                .mark_stage_running(&ctx.case_id, stage.as_str())
                .await?;

            match self.run_stage(stage, &mut ctx).await {
                Ok(output) => {
                    self.persistence
                        .save_stage_output(&ctx.case_id, stage.as_str(), &output)
                        .await?;
                    info!(case_id = %ctx.case_id, %stage, "Stage completed");
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(case_id = %ctx.case_id, %stage, error = %reason, "Stage failed");
                    self.persistence
                        .mark_stage_failed(&ctx.case_id, stage.as_str(), &reason)
                        .await?;
                    return Err(CoreError::StageFailed {
                        stage: stage.as_str().to_string(),
                        reason,
                    });
                }
            }
        }

        Ok(ctx)
    }

    async fn run_stage(&self, stage: StageKind, ctx: &mut EnrichmentContext) -> Result<Value> {
        match stage {
            StageKind::DocumentExtraction => self.document_extraction(ctx).await,
            StageKind::IntakeAnalysis => {
                let prompt = format!(
                    "Extract the intake facts (parties, claims, timeline, requested relief) \
                     as JSON from the following case material:\n{}",
                    ctx.analysis_text()
                );
                let output = self.completion(&prompt).await?;
                ctx.intake = Some(output.clone());
                Ok(output)
            }
            StageKind::JurisdictionAnalysis => {
                let prompt = format!(
                    "Determine the governing jurisdiction and applicable bodies of law as \
                     JSON for this case:\n{}\nIntake facts:\n{}",
                    ctx.analysis_text(),
                    summarize(&ctx.intake)
                );
                let output = self.completion(&prompt).await?;
                ctx.jurisdiction = Some(output.clone());
                Ok(output)
            }
            StageKind::CaseEnhancement => {
                let prompt = format!(
                    "Enhance this case with legal framing, relevant statutes, and open \
                     questions as JSON.\nIntake:\n{}\nJurisdiction:\n{}",
                    summarize(&ctx.intake),
                    summarize(&ctx.jurisdiction)
                );
                let output = self.completion(&prompt).await?;
                ctx.enhancement = Some(output.clone());
                Ok(output)
            }
            StageKind::CaseLawSearch => self.case_law_search(ctx).await,
            StageKind::OpinionAnalysis => {
                let corpus = serde_json::to_string(&ctx.case_law)?;
                let prompt = format!(
                    "Analyze the following retrieved opinions for holdings relevant to the \
                     case, as JSON:\n{corpus}"
                );
                let output = self.completion(&prompt).await?;
                ctx.opinion = Some(output.clone());
                Ok(output)
            }
            StageKind::ComplexityScore => {
                let prompt = format!(
                    "Score the complexity of this case from 1 to 10 with reasoning, as \
                     JSON.\nEnhancement:\n{}\nOpinion analysis:\n{}",
                    summarize(&ctx.enhancement),
                    summarize(&ctx.opinion)
                );
                let output = self.completion(&prompt).await?;
                ctx.complexity = Some(output.clone());
                Ok(output)
            }
            StageKind::OutcomePrediction => {
                let prompt = format!(
                    "Predict the likely outcome of this case with a confidence estimate, as \
                     JSON.\nComplexity:\n{}\nOpinion analysis:\n{}",
                    summarize(&ctx.complexity),
                    summarize(&ctx.opinion)
                );
                let output = self.completion(&prompt).await?;
                ctx.prediction = Some(output.clone());
                Ok(output)
            }
            StageKind::SupplementaryAnalysis => {
                let prompt = format!(
                    "Produce supplementary analyses (risks, recommended next steps, cost \
                     considerations) as JSON.\nPrediction:\n{}",
                    summarize(&ctx.prediction)
                );
                let output = self.completion(&prompt).await?;
                ctx.supplementary = Some(output.clone());
                Ok(output)
            }
        }
    }

    async fn document_extraction(&self, ctx: &mut EnrichmentContext) -> Result<Value> {
        if ctx.documents.is_empty() {
            return Ok(json!({ "skipped": true, "reason": "no documents attached" }));
        }

        let documents = ctx.documents.clone();
        let payload_size: usize = documents.iter().map(String::len).sum();
        self.limiter
            .acquire("document-extraction", (payload_size / 4).max(1) as i64)
            .await?;

        let text = retry_with_backoff(&self.config.retry, "document_extraction", || {
            self.services.extract_document_text(&documents)
        })
        .await?;

        let output = json!({ "text": text, "documents": documents.len() });
        ctx.document_text = Some(text);
        Ok(output)
    }

    /// Fan out over all configured case-law sources concurrently and join.
    ///
    /// Individual source failures are tolerated as long as at least one
    /// source returns usable data; if every source fails the stage fails.
    async fn case_law_search(&self, ctx: &mut EnrichmentContext) -> Result<Value> {
        let query = format!(
            "{}\n{}",
            summarize(&ctx.enhancement),
            summarize(&ctx.jurisdiction)
        );
        let query: &str = &query;

        let searches = self.config.search_sources.iter().map(|source| {
            let source = source.clone();
            async move {
                let result = self.search(&source, query).await;
                (source, result)
            }
        });

        let mut found = Vec::new();
        let mut failed = Vec::new();
        for (source, result) in join_all(searches).await {
            match result {
                Ok(results) => found.push(json!({ "source": source, "results": results })),
                Err(e) => {
                    warn!(case_id = %ctx.case_id, source = %source, error = %e, "Case-law source failed");
                    failed.push(json!({ "source": source, "error": e.to_string() }));
                }
            }
        }

        if found.is_empty() {
            return Err(CoreError::External {
                operation: "case_law_search".to_string(),
                details: format!("all {} sources failed", self.config.search_sources.len()),
            });
        }

        ctx.case_law = found.clone();
        Ok(json!({ "sources": found, "failed_sources": failed }))
    }

    /// One rate-limited, retried LLM completion.
    async fn completion(&self, prompt: &str) -> Result<Value> {
        self.limiter
            .acquire(&self.config.model, estimate_tokens(prompt))
            .await?;
        retry_with_backoff(&self.config.retry, "llm_completion", || {
            self.services.complete(&self.config.model, prompt)
        })
        .await
    }

    /// One rate-limited, retried case-law source query.
    async fn search(&self, source: &str, query: &str) -> Result<Value> {
        self.limiter.acquire(source, estimate_tokens(query)).await?;
        retry_with_backoff(&self.config.retry, "case_law_search", || {
            self.services.search_case_law(source, query)
        })
        .await
    }
}

fn summarize(value: &Option<Value>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_is_valid() {
        validate_plan().unwrap();
    }

    #[test]
    fn test_plan_covers_every_stage_once() {
        for (index, stage) in StageKind::PLAN.iter().enumerate() {
            let first = StageKind::PLAN.iter().position(|s| s == stage).unwrap();
            assert_eq!(first, index, "stage '{stage}' appears more than once");
        }
    }

    #[test]
    fn test_stage_names_are_stable() {
        assert_eq!(StageKind::DocumentExtraction.as_str(), "document_extraction");
        assert_eq!(StageKind::CaseLawSearch.as_str(), "case_law_search");
        assert_eq!(
            StageKind::SupplementaryAnalysis.as_str(),
            "supplementary_analysis"
        );
    }

    #[test]
    fn test_stage_serde_round_trip() {
        let value = serde_json::to_value(StageKind::IntakeAnalysis).unwrap();
        assert_eq!(value, serde_json::json!("intake_analysis"));
        let parsed: StageKind = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, StageKind::IntakeAnalysis);
    }
}
