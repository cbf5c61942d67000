// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caseflow server - change-event intake and case enrichment.
//!
//! Exposes:
//! - webhook intake for case change events
//! - case status queries
//! - the internal machine-to-machine worker trigger
//! - optional WebSocket live status notifications

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use caseflow_core::cleanup::{CleanupWorker, CleanupWorkerConfig};
use caseflow_core::config::Config;
use caseflow_core::notify::{LiveChannel, NoopChannel, Notifier, SubscriptionRegistry};
use caseflow_core::pipeline::{Orchestrator, PipelineConfig};
use caseflow_core::queue::JobQueue;
use caseflow_core::ratelimit::{RateLimitConfig, RateLimiter};
use caseflow_core::services::{HttpEnrichmentServices, HttpServicesConfig};
use caseflow_core::worker::{CASE_QUEUE, Worker};

mod config;
mod error;
mod routes;
mod state;
mod ws;

use config::ServerConfig;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caseflow_server=info".parse()?)
                .add_directive("caseflow_core=info".parse()?),
        )
        .init();

    info!("Starting caseflow server");

    let core_config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let server_config = Arc::new(ServerConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?);

    info!("Connecting to database...");
    let persistence = caseflow_core::connect(&core_config.database_url).await?;
    info!("Database connected, migrations applied");

    let queue = JobQueue::new(persistence.clone(), core_config.backoff.clone());
    let limiter = RateLimiter::new(
        persistence.clone(),
        RateLimitConfig::for_environment(core_config.environment),
    );
    let services = Arc::new(HttpEnrichmentServices::new(HttpServicesConfig::from_env()?)?);

    // Capability detection: a live channel exists only when a WS credential
    // is configured. Without one, durable status is the single source of
    // truth for consumers.
    let registry = server_config
        .ws_token
        .as_ref()
        .map(|_| Arc::new(SubscriptionRegistry::new()));
    let channel: Arc<dyn LiveChannel> = match &registry {
        Some(registry) => registry.clone(),
        None => Arc::new(NoopChannel),
    };
    let notifier = Notifier::new(persistence.clone(), channel);

    let orchestrator = Orchestrator::new(
        persistence.clone(),
        services,
        limiter,
        PipelineConfig::default(),
    )?;
    let worker = Arc::new(Worker::new(
        queue.clone(),
        orchestrator,
        notifier,
        persistence.clone(),
    ));

    let cleanup = CleanupWorker::new(queue, CASE_QUEUE, CleanupWorkerConfig::from_env());
    let cleanup_shutdown = cleanup.shutdown_handle();
    let cleanup_handle = tokio::spawn(async move { cleanup.run().await });

    let live_channel_enabled = registry.is_some();
    let app = routes::router(AppState {
        worker,
        persistence,
        registry,
        config: server_config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(server_config.bind_addr).await?;
    info!(
        addr = %server_config.bind_addr,
        live_channel = live_channel_enabled,
        "Caseflow server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup_shutdown.notify_one();
    let _ = cleanup_handle.await;
    info!("Caseflow server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
