// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External enrichment services consumed by the pipeline.
//!
//! The orchestrator depends only on the [`EnrichmentServices`] trait; the
//! concrete HTTP implementation here talks to the document extraction, LLM
//! completion, and case-law search providers. Tests substitute mocks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::config::ConfigError;
use crate::error::{CoreError, Result};

/// External services the enrichment pipeline calls.
///
/// All three calls are slow and rate-limited upstream; callers gate them
/// through the rate limiter and the retry helper, not the implementations.
#[async_trait]
pub trait EnrichmentServices: Send + Sync {
    /// Extract plain text from the given document references.
    async fn extract_document_text(&self, documents: &[String]) -> Result<String>;

    /// Run an LLM completion against the named model, returning the parsed
    /// JSON response body.
    async fn complete(&self, model: &str, prompt: &str) -> Result<Value>;

    /// Query one case-law source, returning its raw result payload.
    async fn search_case_law(&self, source: &str, query: &str) -> Result<Value>;
}

/// Endpoint configuration for [`HttpEnrichmentServices`].
#[derive(Debug, Clone)]
pub struct HttpServicesConfig {
    /// Document extraction endpoint.
    pub extraction_url: String,
    /// LLM completion endpoint.
    pub completion_url: String,
    /// Case-law search endpoint.
    pub search_url: String,
    /// Bearer credential sent with every request, if set.
    pub api_key: Option<String>,
    /// Per-call timeout. A timed-out call fails that attempt; it never stalls
    /// the whole invocation.
    pub call_timeout: Duration,
}

impl HttpServicesConfig {
    /// Load endpoint configuration from environment variables.
    ///
    /// - `CASEFLOW_EXTRACTION_URL` (required)
    /// - `CASEFLOW_COMPLETION_URL` (required)
    /// - `CASEFLOW_SEARCH_URL` (required)
    /// - `CASEFLOW_API_KEY` (optional)
    /// - `CASEFLOW_CALL_TIMEOUT_SECS` (default: 120)
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let required =
            |name: &'static str| std::env::var(name).map_err(|_| ConfigError::Missing(name));

        let call_timeout_secs: u64 = std::env::var("CASEFLOW_CALL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CASEFLOW_CALL_TIMEOUT_SECS", "must be a positive integer")
            })?;

        Ok(Self {
            extraction_url: required("CASEFLOW_EXTRACTION_URL")?,
            completion_url: required("CASEFLOW_COMPLETION_URL")?,
            search_url: required("CASEFLOW_SEARCH_URL")?,
            api_key: std::env::var("CASEFLOW_API_KEY").ok(),
            call_timeout: Duration::from_secs(call_timeout_secs),
        })
    }
}

/// HTTP-backed implementation of [`EnrichmentServices`].
pub struct HttpEnrichmentServices {
    client: reqwest::Client,
    config: HttpServicesConfig,
}

impl HttpEnrichmentServices {
    /// Build an HTTP client with the configured per-call timeout.
    pub fn new(config: HttpServicesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| CoreError::External {
                operation: "http_client_init".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { client, config })
    }

    async fn post_json(&self, operation: &str, url: &str, body: &Value) -> Result<Value> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(operation, &e))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CoreError::TransientExternal {
                operation: operation.to_string(),
                details: format!("upstream returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(CoreError::External {
                operation: operation.to_string(),
                details: format!("upstream returned {status}"),
            });
        }

        response.json().await.map_err(|e| CoreError::External {
            operation: operation.to_string(),
            details: format!("malformed response body: {e}"),
        })
    }
}

/// Timeouts and connection failures are transient; everything else from the
/// client side is permanent.
fn classify_reqwest_error(operation: &str, error: &reqwest::Error) -> CoreError {
    if error.is_timeout() || error.is_connect() {
        CoreError::TransientExternal {
            operation: operation.to_string(),
            details: error.to_string(),
        }
    } else {
        CoreError::External {
            operation: operation.to_string(),
            details: error.to_string(),
        }
    }
}

#[async_trait]
impl EnrichmentServices for HttpEnrichmentServices {
    async fn extract_document_text(&self, documents: &[String]) -> Result<String> {
        let body = json!({ "documents": documents });
        let response = self
            .post_json("document_extraction", &self.config.extraction_url, &body)
            .await?;

        response
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::External {
                operation: "document_extraction".to_string(),
                details: "response missing 'text' field".to_string(),
            })
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<Value> {
        let body = json!({ "model": model, "prompt": prompt });
        self.post_json("llm_completion", &self.config.completion_url, &body)
            .await
    }

    async fn search_case_law(&self, source: &str, query: &str) -> Result<Value> {
        let body = json!({ "source": source, "query": query });
        self.post_json("case_law_search", &self.config.search_url, &body)
            .await
    }
}
