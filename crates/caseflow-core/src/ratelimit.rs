// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adaptive rate limiting for outbound external calls.
//!
//! Usage is tracked per resource (model name, search provider) in rolling
//! one-minute windows stored durably, because worker invocations are
//! short-lived and may run concurrently across processes. Admission never
//! rejects outright: callers wait for the window to roll over and try again.
//!
//! Token cost is estimated up front from payload size; exact usage is
//! unknowable before the call completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::Environment;
use crate::error::Result;
use crate::persistence::{Persistence, RateDecision};

/// Length of the rolling rate window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Characters-per-token heuristic used for cost estimation.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token cost of a call from its payload size.
pub fn estimate_tokens(payload: &str) -> i64 {
    (payload.len() / CHARS_PER_TOKEN).max(1) as i64
}

/// Per-resource request and token ceilings over one rolling window.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Maximum requests per minute.
    pub requests_per_minute: i64,
    /// Maximum estimated tokens per minute.
    pub tokens_per_minute: i64,
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Per-resource overrides.
    limits: HashMap<String, ResourceLimits>,
    /// Limits applied to resources without an override.
    pub default_limits: ResourceLimits,
    /// Fixed minimum delay between consecutive admitted calls.
    pub min_call_interval: Duration,
}

impl RateLimitConfig {
    /// Build the configuration for a deployment environment.
    ///
    /// Production runs stricter than development to leave headroom against
    /// the true provider ceiling.
    pub fn for_environment(environment: Environment) -> Self {
        let default_limits = match environment {
            Environment::Production => ResourceLimits {
                requests_per_minute: 40,
                tokens_per_minute: 60_000,
            },
            Environment::Development => ResourceLimits {
                requests_per_minute: 60,
                tokens_per_minute: 90_000,
            },
        };
        Self {
            limits: HashMap::new(),
            default_limits,
            min_call_interval: Duration::from_millis(500),
        }
    }

    /// Override the limits for one resource.
    pub fn with_limit(mut self, resource: impl Into<String>, limits: ResourceLimits) -> Self {
        self.limits.insert(resource.into(), limits);
        self
    }

    /// Limits in effect for a resource.
    pub fn limits_for(&self, resource: &str) -> ResourceLimits {
        self.limits
            .get(resource)
            .copied()
            .unwrap_or(self.default_limits)
    }
}

/// Time remaining until a window that started at `window_start` rolls over.
/// Zero if it already has.
pub fn time_until_rollover(window_start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let elapsed = now.signed_duration_since(window_start);
    let window = chrono::Duration::seconds(WINDOW.as_secs() as i64);
    (window - elapsed).to_std().unwrap_or(Duration::ZERO)
}

/// Rate limiter gating outbound external calls.
#[derive(Clone)]
pub struct RateLimiter {
    persistence: Arc<dyn Persistence>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter over the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>, config: RateLimitConfig) -> Self {
        Self {
            persistence,
            config,
        }
    }

    /// Wait until the resource's window has capacity for one request plus
    /// `estimated_tokens`, then record the usage.
    ///
    /// This is backpressure, not failure: the only error path is the store
    /// itself. After admission a fixed minimum inter-call delay is applied as
    /// an additional conservative throttle.
    pub async fn acquire(&self, resource: &str, estimated_tokens: i64) -> Result<()> {
        let limits = self.config.limits_for(resource);
        // An estimate above the whole ceiling would never fit any window;
        // clamp so an oversized call is admitted against an empty window.
        let estimated_tokens = estimated_tokens.min(limits.tokens_per_minute);

        loop {
            let now = Utc::now();
            let decision = self
                .persistence
                .try_admit(
                    resource,
                    now,
                    estimated_tokens,
                    limits.requests_per_minute,
                    limits.tokens_per_minute,
                )
                .await?;

            match decision {
                RateDecision::Admitted => {
                    debug!(resource, estimated_tokens, "Rate limiter admitted call");
                    tokio::time::sleep(self.config.min_call_interval).await;
                    return Ok(());
                }
                RateDecision::Denied { window_start } => {
                    // Sleep at least a little even if the window is about to
                    // roll over, so a tight loop cannot hammer the store.
                    let wait = time_until_rollover(window_start, now)
                        .max(Duration::from_millis(100));
                    debug!(
                        resource,
                        wait_ms = wait.as_millis() as u64,
                        "Rate window at capacity, waiting for rollover"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

/// Retry parameters for transient external failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the retry delay (before jitter).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for the given attempt: `min(base * 2^n, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay plus up to 50% random jitter.
    fn jittered(&self, delay: Duration) -> Duration {
        let jitter_ceiling = delay.as_millis() as u64 / 2;
        if jitter_ceiling == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        delay + Duration::from_millis(jitter)
    }
}

/// Run an operation, retrying transient failures with backoff and jitter.
///
/// Permanent errors propagate immediately. Once retries are exhausted the
/// last transient error propagates; the calling stage treats it as permanent
/// for that attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut run: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.jittered(policy.delay_for(attempt));
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient external failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
