// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker tick: the glue between queue, pipeline, and notifier.
//!
//! Each tick is a short-lived, independently invoked unit of execution: claim
//! at most one job, run the pipeline for its case, record the outcome. Stage
//! errors are converted into job and case bookkeeping at this boundary and
//! never re-thrown past it.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::notify::{CaseStatus, Notifier};
use crate::persistence::Persistence;
use crate::pipeline::{CaseInput, Orchestrator};
use crate::queue::{EnqueueOptions, FailOutcome, JobQueue};

/// Queue name used for case enrichment jobs.
pub const CASE_QUEUE: &str = "case-enrichment";

/// Result of one worker tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No eligible job existed. A normal outcome, not a fault.
    QueueEmpty,
    /// One job was claimed and processed to a job-level outcome.
    Processed {
        /// The processed job.
        job_id: String,
        /// The case the job was for.
        case_id: String,
        /// Whether the pipeline succeeded.
        succeeded: bool,
    },
}

/// Aggregate result of a bounded batch of ticks.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BatchSummary {
    /// Jobs claimed and processed.
    pub processed: u32,
    /// Pipelines that succeeded.
    pub succeeded: u32,
    /// Pipelines that failed (job retried or permanently failed).
    pub failed: u32,
}

/// Claims jobs and drives the enrichment pipeline for each.
pub struct Worker {
    queue: JobQueue,
    orchestrator: Orchestrator,
    notifier: Notifier,
    persistence: Arc<dyn Persistence>,
}

impl Worker {
    /// Assemble a worker from its collaborators.
    pub fn new(
        queue: JobQueue,
        orchestrator: Orchestrator,
        notifier: Notifier,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            notifier,
            persistence,
        }
    }

    /// Enqueue an enrichment job for a case, creating the case record if it
    /// does not exist yet. Returns the job id.
    pub async fn enqueue_case(&self, input: &CaseInput) -> Result<String> {
        self.persistence
            .upsert_case(&input.case_id, &input.user_id)
            .await?;
        let job_id = self
            .queue
            .enqueue(
                CASE_QUEUE,
                serde_json::to_value(input)?,
                EnqueueOptions::default(),
            )
            .await?;
        info!(case_id = %input.case_id, job_id = %job_id, "Case enqueued for enrichment");
        Ok(job_id)
    }

    /// Re-run a permanently failed case from scratch.
    ///
    /// This is the only resurrection path once a job has exhausted its
    /// attempts: the case returns to pending, its stage checkpoints are
    /// cleared, and a fresh job is enqueued.
    pub async fn reprocess(&self, input: &CaseInput) -> Result<String> {
        let case = self
            .persistence
            .get_case(&input.case_id)
            .await?
            .ok_or_else(|| CoreError::CaseNotFound {
                case_id: input.case_id.clone(),
            })?;

        if CaseStatus::parse(&case.processing_status) != Some(CaseStatus::Failed) {
            return Err(CoreError::InvalidStatusTransition {
                case_id: input.case_id.clone(),
                from: case.processing_status,
                to: "pending".to_string(),
            });
        }

        self.notifier
            .transition(&input.case_id, CaseStatus::Pending, None)
            .await?;
        self.persistence.clear_stages(&input.case_id).await?;

        let job_id = self
            .queue
            .enqueue(
                CASE_QUEUE,
                serde_json::to_value(input)?,
                EnqueueOptions::default(),
            )
            .await?;
        info!(case_id = %input.case_id, job_id = %job_id, "Case requeued for reprocessing");
        Ok(job_id)
    }

    /// Claim and process at most one job from a queue.
    #[instrument(skip(self))]
    pub async fn tick(&self, queue_name: &str) -> Result<TickOutcome> {
        let Some(job) = self.queue.claim_next(queue_name).await? else {
            return Ok(TickOutcome::QueueEmpty);
        };

        let input: CaseInput = match serde_json::from_value(job.data.clone()) {
            Ok(input) => input,
            Err(e) => {
                // A malformed payload can never succeed; burn its attempts.
                error!(job_id = %job.id, error = %e, "Job payload is not a valid case input");
                self.queue.fail(&job, &format!("malformed payload: {e}")).await?;
                return Err(CoreError::Validation {
                    field: "job.data".to_string(),
                    message: e.to_string(),
                });
            }
        };

        let case_id = input.case_id.clone();
        self.persistence
            .upsert_case(&case_id, &input.user_id)
            .await?;
        if let Err(e) = self
            .notifier
            .transition(&case_id, CaseStatus::Processing, None)
            .await
        {
            return match e {
                // A job can arrive for a case the state machine will not
                // move, e.g. an UPDATE event on an already-completed case.
                // The job completes as a no-op so it never stays leased.
                CoreError::InvalidStatusTransition { .. } => {
                    info!(
                        job_id = %job.id,
                        case_id = %case_id,
                        reason = %e,
                        "Case not eligible for enrichment, job skipped"
                    );
                    self.queue
                        .complete(&job.id, json!({ "skipped": true, "reason": e.to_string() }))
                        .await?;
                    Ok(TickOutcome::Processed {
                        job_id: job.id,
                        case_id,
                        succeeded: true,
                    })
                }
                _ => {
                    self.queue.fail(&job, &e.to_string()).await?;
                    Err(e)
                }
            };
        }

        match self.orchestrator.run(input).await {
            Ok(ctx) => {
                self.queue.complete(&job.id, ctx.results()).await?;
                self.notifier
                    .transition(&case_id, CaseStatus::Completed, None)
                    .await?;
                info!(job_id = %job.id, case_id = %case_id, "Case enrichment completed");
                Ok(TickOutcome::Processed {
                    job_id: job.id,
                    case_id,
                    succeeded: true,
                })
            }
            Err(e) => {
                let detail = match &e {
                    CoreError::StageFailed { stage, .. } => {
                        format!("enrichment failed at stage '{stage}'")
                    }
                    _ => "enrichment failed".to_string(),
                };
                let outcome = self.queue.fail(&job, &e.to_string()).await?;
                self.notifier
                    .transition(&case_id, CaseStatus::Failed, Some(&detail))
                    .await?;
                match outcome {
                    FailOutcome::Retried { scheduled_for } => {
                        warn!(
                            job_id = %job.id,
                            case_id = %case_id,
                            retry_at = %scheduled_for,
                            error = %e,
                            "Case enrichment failed, will retry"
                        );
                    }
                    FailOutcome::Failed => {
                        error!(
                            job_id = %job.id,
                            case_id = %case_id,
                            error = %e,
                            "Case enrichment permanently failed"
                        );
                    }
                }
                Ok(TickOutcome::Processed {
                    job_id: job.id,
                    case_id,
                    succeeded: false,
                })
            }
        }
    }

    /// Run up to `batch_size` ticks, stopping early when the queue empties.
    ///
    /// A tick error counts against `failed` and the batch moves on; one bad
    /// job never aborts the rest of the batch.
    pub async fn run_batch(&self, queue_name: &str, batch_size: u32) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for _ in 0..batch_size {
            match self.tick(queue_name).await {
                Ok(TickOutcome::QueueEmpty) => break,
                Ok(TickOutcome::Processed { succeeded, .. }) => {
                    summary.processed += 1;
                    if succeeded {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Err(e) => {
                    warn!(queue = queue_name, error = %e, "Tick failed during batch run");
                    summary.processed += 1;
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Per-status job counts for a queue, plus the queue name, for the
    /// operational status endpoint.
    pub async fn queue_report(&self, queue_name: &str) -> Result<serde_json::Value> {
        let stats = self.queue.stats(queue_name).await?;
        Ok(json!({ "queue": queue_name, "stats": stats }))
    }
}
