// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Accumulating context threaded through the enrichment pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Input describing one case to enrich. This is also the job payload stored
/// in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseInput {
    /// Case identifier.
    pub case_id: String,
    /// Owning user identifier.
    pub user_id: String,
    /// Free-text case narrative.
    #[serde(default)]
    pub narrative: String,
    /// References to attached documents, if any.
    #[serde(default)]
    pub documents: Vec<String>,
}

/// Context accumulated across pipeline stages.
///
/// Each stage reads what prior stages produced and writes its own slot. The
/// orchestrator owns the context for the duration of one run; nothing here is
/// shared across invocations. The durable record is the stage checkpoint
/// table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentContext {
    /// Case identifier.
    pub case_id: String,
    /// Owning user identifier.
    pub user_id: String,
    /// Free-text case narrative from intake.
    pub narrative: String,
    /// References to attached documents.
    pub documents: Vec<String>,
    /// Text extracted from the attached documents.
    pub document_text: Option<String>,
    /// Intake analysis output.
    pub intake: Option<Value>,
    /// Jurisdiction analysis output.
    pub jurisdiction: Option<Value>,
    /// Case enhancement output.
    pub enhancement: Option<Value>,
    /// Per-source case-law search results that returned usable data.
    pub case_law: Vec<Value>,
    /// Opinion analysis over the retrieved case law.
    pub opinion: Option<Value>,
    /// Complexity scoring output.
    pub complexity: Option<Value>,
    /// Outcome prediction output.
    pub prediction: Option<Value>,
    /// Supplementary analyses output.
    pub supplementary: Option<Value>,
}

impl EnrichmentContext {
    /// Start a fresh context from case input.
    pub fn from_input(input: CaseInput) -> Self {
        Self {
            case_id: input.case_id,
            user_id: input.user_id,
            narrative: input.narrative,
            documents: input.documents,
            ..Self::default()
        }
    }

    /// The full source material available for analysis: narrative plus any
    /// extracted document text.
    pub fn analysis_text(&self) -> String {
        match &self.document_text {
            Some(text) if !text.is_empty() => format!("{}\n\n{}", self.narrative, text),
            _ => self.narrative.clone(),
        }
    }

    /// Final result summary persisted as the job result.
    pub fn results(&self) -> Value {
        json!({
            "caseId": self.case_id,
            "intake": self.intake,
            "jurisdiction": self.jurisdiction,
            "enhancement": self.enhancement,
            "caseLawSources": self.case_law.len(),
            "opinion": self.opinion,
            "complexity": self.complexity,
            "prediction": self.prediction,
            "supplementary": self.supplementary,
        })
    }
}
