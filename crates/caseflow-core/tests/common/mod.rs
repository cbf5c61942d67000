// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for caseflow-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use caseflow_core::config::{BackoffConfig, Environment};
use caseflow_core::error::{CoreError, Result};
use caseflow_core::notify::{LiveChannel, Notifier};
use caseflow_core::persistence::{Persistence, SqlitePersistence};
use caseflow_core::pipeline::{CaseInput, Orchestrator, PipelineConfig};
use caseflow_core::queue::JobQueue;
use caseflow_core::ratelimit::{RateLimitConfig, RateLimiter, RetryPolicy};
use caseflow_core::services::EnrichmentServices;
use caseflow_core::worker::Worker;

/// Fresh SQLite-backed persistence in a temp directory. Keep the TempDir
/// alive for the duration of the test.
pub async fn sqlite() -> (SqlitePersistence, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = SqlitePersistence::from_path(dir.path().join("caseflow.db"))
        .await
        .expect("initialize sqlite store");
    (store, dir)
}

/// Rate limiter with development limits and no inter-call delay.
pub fn test_limiter(persistence: Arc<dyn Persistence>) -> RateLimiter {
    let mut config = RateLimitConfig::for_environment(Environment::Development);
    config.min_call_interval = Duration::ZERO;
    RateLimiter::new(persistence, config)
}

/// Retry policy with millisecond delays so tests finish promptly.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

/// Pipeline configuration pointing at the mock services.
pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        model: "test-llm".to_string(),
        search_sources: vec!["alpha".to_string(), "beta".to_string()],
        retry: fast_retry(),
    }
}

/// Case input with narrative text only.
pub fn narrative_case(case_id: &str) -> CaseInput {
    CaseInput {
        case_id: case_id.to_string(),
        user_id: "u-1".to_string(),
        narrative: "Landlord withheld the full deposit after an inspection found no damage."
            .to_string(),
        documents: vec![],
    }
}

/// Scriptable in-memory stand-in for the external enrichment services.
///
/// LLM completions happen in a fixed order per pipeline run:
/// 1 intake, 2 jurisdiction, 3 enhancement, 4 opinion, 5 complexity,
/// 6 prediction, 7 supplementary. `fail_completion` targets one of those by
/// index.
#[derive(Default)]
pub struct MockServices {
    completion_calls: AtomicU32,
    /// 1-based completion call index from which every call (this one and all
    /// later ones, counted across runs) fails permanently.
    pub fail_completion: Option<u32>,
    /// Number of leading completion calls that fail transiently.
    pub transient_failures: AtomicU32,
    /// Sources whose searches always fail.
    pub failing_sources: Vec<String>,
}

impl MockServices {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing_completion(call: u32) -> Self {
        Self {
            fail_completion: Some(call),
            ..Self::default()
        }
    }

    pub fn with_transient_failures(count: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(count),
            ..Self::default()
        }
    }

    pub fn with_failing_sources(sources: &[&str]) -> Self {
        Self {
            failing_sources: sources.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn completion_call_count(&self) -> u32 {
        self.completion_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentServices for MockServices {
    async fn extract_document_text(&self, documents: &[String]) -> Result<String> {
        Ok(format!("extracted text from {} documents", documents.len()))
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<Value> {
        let call = self.completion_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoreError::TransientExternal {
                operation: "llm_completion".to_string(),
                details: "simulated timeout".to_string(),
            });
        }

        if self.fail_completion.is_some_and(|from| call >= from) {
            return Err(CoreError::External {
                operation: "llm_completion".to_string(),
                details: format!("simulated permanent failure on call {call}"),
            });
        }

        Ok(json!({
            "model": model,
            "analysis": format!("analysis over {} chars", prompt.len()),
        }))
    }

    async fn search_case_law(&self, source: &str, query: &str) -> Result<Value> {
        if self.failing_sources.iter().any(|s| s == source) {
            return Err(CoreError::External {
                operation: "case_law_search".to_string(),
                details: format!("source '{source}' unavailable"),
            });
        }
        Ok(json!({
            "hits": [{ "source": source, "relevance": 0.8, "query_len": query.len() }]
        }))
    }
}

/// Assemble an orchestrator over the given store and mock services.
pub fn build_orchestrator(
    store: &SqlitePersistence,
    services: Arc<dyn EnrichmentServices>,
) -> Orchestrator {
    let persistence: Arc<dyn Persistence> = Arc::new(store.clone());
    Orchestrator::new(
        persistence.clone(),
        services,
        test_limiter(persistence),
        test_pipeline_config(),
    )
    .expect("valid stage plan")
}

/// Assemble a full worker over the given store, services, and live channel.
pub fn build_worker(
    store: &SqlitePersistence,
    services: Arc<dyn EnrichmentServices>,
    channel: Arc<dyn LiveChannel>,
) -> Worker {
    let persistence: Arc<dyn Persistence> = Arc::new(store.clone());
    let queue = JobQueue::new(persistence.clone(), BackoffConfig::default());
    let orchestrator = Orchestrator::new(
        persistence.clone(),
        services,
        test_limiter(persistence.clone()),
        test_pipeline_config(),
    )
    .expect("valid stage plan");
    let notifier = Notifier::new(persistence.clone(), channel);
    Worker::new(queue, orchestrator, notifier, persistence)
}
