// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job queue over the persistence layer.
//!
//! Jobs are claimed with a single atomic conditional update, so concurrent
//! worker invocations across processes never double-claim. Retry scheduling
//! is expressed as data (`attempts` plus a pushed-forward `scheduled_for`)
//! rather than in-process timers, which keeps the backoff sequence testable
//! without touching the real clock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BackoffConfig;
use crate::error::{CoreError, Result};
use crate::persistence::{JobRecord, NewJob, Persistence, QueueStats};

/// Options for enqueueing a job.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Higher priority jobs are claimed first.
    pub priority: i32,
    /// Maximum attempts before the job permanently fails.
    pub max_attempts: i32,
    /// Earliest time the job may be claimed. Defaults to now.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 3,
            scheduled_for: None,
        }
    }
}

/// What happened to a job passed to [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Transient failure; the job is pending again at the given time.
    Retried {
        /// When the job becomes eligible again.
        scheduled_for: DateTime<Utc>,
    },
    /// Attempts exhausted; the job is permanently failed.
    Failed,
}

/// Aggregate result of a batch-processing pass.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Jobs claimed and handed to the handler.
    pub processed: u32,
    /// Jobs whose handler succeeded.
    pub succeeded: u32,
    /// Jobs whose handler failed (retried or permanently failed).
    pub failed: u32,
    /// IDs of the claimed jobs, in claim order.
    pub job_ids: Vec<String>,
}

/// Compute the retry delay for the given attempt number.
///
/// `delay(n) = min(base_delay * 2^n, max_delay)`, non-decreasing and bounded.
pub fn backoff_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(20));
    config.base_delay.saturating_mul(factor).min(config.max_delay)
}

/// Durable job queue.
#[derive(Clone)]
pub struct JobQueue {
    persistence: Arc<dyn Persistence>,
    backoff: BackoffConfig,
}

impl JobQueue {
    /// Create a new queue facade over the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>, backoff: BackoffConfig) -> Self {
        Self {
            persistence,
            backoff,
        }
    }

    /// Enqueue a job, returning its id.
    ///
    /// No duplicate-payload detection is attempted; callers that need
    /// idempotency must enforce it themselves.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        let now = Utc::now();
        let job = NewJob {
            id: Uuid::new_v4().to_string(),
            queue_name: queue_name.to_string(),
            data,
            priority: options.priority,
            max_attempts: options.max_attempts,
            created_at: now,
            scheduled_for: options.scheduled_for.unwrap_or(now),
        };
        self.persistence.insert_job(&job).await?;

        debug!(job_id = %job.id, queue = queue_name, priority = job.priority, "Job enqueued");
        Ok(job.id)
    }

    /// Claim the next eligible job. `Ok(None)` means the queue is empty;
    /// callers must not treat that as a fault.
    pub async fn claim_next(&self, queue_name: &str) -> Result<Option<JobRecord>> {
        let claimed = self.persistence.claim_next_job(queue_name, Utc::now()).await?;
        if let Some(ref job) = claimed {
            debug!(job_id = %job.id, queue = queue_name, attempts = job.attempts, "Job claimed");
        }
        Ok(claimed)
    }

    /// Complete a leased job, recording its result.
    pub async fn complete(&self, job_id: &str, result: serde_json::Value) -> Result<()> {
        let applied = self.persistence.complete_job(job_id, &result).await?;
        if !applied {
            return Err(self.state_error(job_id).await);
        }
        debug!(job_id, "Job completed");
        Ok(())
    }

    /// Fail a leased job.
    ///
    /// If attempts remain after the increment, the job returns to pending
    /// with `scheduled_for` pushed forward by the backoff delay. Otherwise it
    /// is permanently failed; only an explicit new enqueue can run the work
    /// again.
    pub async fn fail(&self, job: &JobRecord, error: &str) -> Result<FailOutcome> {
        let next_attempts = job.attempts + 1;
        if next_attempts < job.max_attempts {
            let delay = backoff_delay(&self.backoff, next_attempts as u32);
            let scheduled_for = Utc::now()
                + ChronoDuration::from_std(delay)
                    .unwrap_or_else(|_| ChronoDuration::seconds(self.backoff.max_delay.as_secs() as i64));
            let applied = self
                .persistence
                .retry_job(&job.id, error, scheduled_for)
                .await?;
            if !applied {
                return Err(self.state_error(&job.id).await);
            }
            info!(
                job_id = %job.id,
                attempts = next_attempts,
                retry_at = %scheduled_for,
                "Job failed transiently, scheduled for retry"
            );
            Ok(FailOutcome::Retried { scheduled_for })
        } else {
            let applied = self.persistence.fail_job(&job.id, error).await?;
            if !applied {
                return Err(self.state_error(&job.id).await);
            }
            warn!(job_id = %job.id, attempts = next_attempts, error, "Job permanently failed");
            Ok(FailOutcome::Failed)
        }
    }

    /// Claim up to `batch_size` jobs and process each with the handler.
    ///
    /// A handler error fails that job per the retry policy and moves on; it
    /// never aborts the remaining jobs in the batch.
    pub async fn claim_batch<F, Fut>(
        &self,
        queue_name: &str,
        batch_size: u32,
        handler: F,
    ) -> Result<BatchOutcome>
    where
        F: Fn(JobRecord) -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        let mut outcome = BatchOutcome::default();

        for _ in 0..batch_size {
            let Some(job) = self.claim_next(queue_name).await? else {
                break;
            };
            outcome.processed += 1;
            outcome.job_ids.push(job.id.clone());

            match handler(job.clone()).await {
                Ok(result) => {
                    self.complete(&job.id, result).await?;
                    outcome.succeeded += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Batch handler failed");
                    self.fail(&job, &e.to_string()).await?;
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Per-status job counts for a queue.
    pub async fn stats(&self, queue_name: &str) -> Result<QueueStats> {
        self.persistence.queue_stats(queue_name).await
    }

    /// Delete terminal jobs older than `max_age_hours`. Returns the count
    /// removed.
    pub async fn cleanup(&self, queue_name: &str, max_age_hours: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours as i64);
        let removed = self
            .persistence
            .delete_terminal_jobs_older_than(queue_name, cutoff)
            .await?;
        if removed > 0 {
            info!(queue = queue_name, removed, "Cleaned up old terminal jobs");
        }
        Ok(removed)
    }

    async fn state_error(&self, job_id: &str) -> CoreError {
        match self.persistence.get_job(job_id).await {
            Ok(Some(job)) => CoreError::InvalidJobState {
                job_id: job_id.to_string(),
                expected: "processing".to_string(),
                actual: job.status,
            },
            Ok(None) => CoreError::JobNotFound {
                job_id: job_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_non_decreasing_and_bounded() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = backoff_delay(&config, attempt);
            assert!(delay >= previous, "delay must be non-decreasing");
            assert!(delay <= config.max_delay, "delay must be bounded");
            previous = delay;
        }

        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(120));
        assert_eq!(backoff_delay(&config, 10), config.max_delay);
    }

    #[test]
    fn test_backoff_no_overflow_at_large_attempts() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        };
        assert_eq!(backoff_delay(&config, u32::MAX), config.max_delay);
    }

    #[test]
    fn test_enqueue_options_defaults() {
        let options = EnqueueOptions::default();
        assert_eq!(options.priority, 0);
        assert_eq!(options.max_attempts, 3);
        assert!(options.scheduled_for.is_none());
    }
}
