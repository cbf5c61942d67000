// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for the job-retention sweep.
//!
//! Terminal jobs (completed, failed) older than the configured retention
//! period are deleted periodically. Disabled by default.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::queue::JobQueue;

/// Configuration for the retention sweep worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Whether the sweep is enabled.
    pub enabled: bool,
    /// How often to run the sweep.
    pub poll_interval: Duration,
    /// Maximum age in hours for terminal jobs before deletion.
    pub max_age_hours: u32,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age_hours: 24 * 30,
        }
    }
}

impl CleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `CASEFLOW_CLEANUP_ENABLED`: "true" or "1" to enable (default: false)
    /// - `CASEFLOW_CLEANUP_POLL_INTERVAL_SECS`: seconds between sweeps (default: 3600)
    /// - `CASEFLOW_CLEANUP_MAX_AGE_HOURS`: hours before terminal jobs are deleted (default: 720)
    pub fn from_env() -> Self {
        let enabled = std::env::var("CASEFLOW_CLEANUP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("CASEFLOW_CLEANUP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let max_age_hours = std::env::var("CASEFLOW_CLEANUP_MAX_AGE_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24 * 30);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age_hours,
        }
    }
}

/// Background worker that deletes old terminal jobs.
pub struct CleanupWorker {
    queue: JobQueue,
    queue_name: String,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new retention sweep worker for one queue.
    pub fn new(queue: JobQueue, queue_name: impl Into<String>, config: CleanupWorkerConfig) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop. Exits when the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention sweep worker disabled");
            return;
        }

        info!(
            queue = %self.queue_name,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age_hours,
            "Retention sweep worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention sweep worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.queue.cleanup(&self.queue_name, self.config.max_age_hours).await {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }

        info!("Retention sweep worker stopped");
    }
}
