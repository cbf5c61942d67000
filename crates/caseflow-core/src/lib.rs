// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caseflow Core - Durable Case Enrichment Engine
//!
//! This crate drives a case through a multi-stage enrichment pipeline that
//! calls slow, rate-limited external services, persisting every intermediate
//! result so that short-lived, concurrently running worker invocations can
//! coordinate through the database alone.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     External Triggers                        │
//! │          (change-event webhook, cron, manual call)           │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ enqueue
//!                               ▼
//! ┌───────────────┐      ┌─────────────┐      ┌────────────────┐
//! │   Notifier    │◄─────│   Worker    │─────►│   Job Queue    │
//! │ status writes │      │   (tick)    │      │ claim/complete │
//! │ + live fanout │      └──────┬──────┘      │     /fail      │
//! └───────────────┘             │             └────────────────┘
//!                               ▼
//!                     ┌──────────────────┐
//!                     │   Orchestrator   │
//!                     │  staged pipeline │
//!                     └────────┬─────────┘
//!                              │ gated by
//!                              ▼
//!                     ┌──────────────────┐      ┌───────────────┐
//!                     │   Rate Limiter   │─────►│   External    │
//!                     │ rolling windows  │      │   Services    │
//!                     └──────────────────┘      └───────────────┘
//!
//!           All durable state (jobs, cases, stage checkpoints,
//!           rate windows) lives in PostgreSQL or SQLite via the
//!           Persistence trait.
//! ```
//!
//! # Case Status State Machine
//!
//! ```text
//!     ┌─────────┐
//!     │ PENDING │◄─────────────┐
//!     └────┬────┘              │
//!          │ job claimed       │ reprocess
//!          ▼                   │
//!     ┌────────────┐           │
//!     │ PROCESSING │◄──────────┤ job retry
//!     └────┬───────┘           │
//!          │                   │
//!    ┌─────┴─────┐             │
//!    ▼           ▼             │
//! ┌───────────┐ ┌────────┐     │
//! │ COMPLETED │ │ FAILED │─────┘
//! └───────────┘ └────────┘
//! ```
//!
//! `completed` is terminal. A permanently failed job is only run again
//! through an explicit reprocess, which clears the case's stage checkpoints
//! and enqueues a fresh job.
//!
//! # Module Overview
//!
//! - [`config`]: Environment-variable configuration
//! - [`persistence`]: The `Persistence` trait with PostgreSQL and SQLite backends
//! - [`queue`]: Durable job queue with atomic claim and backoff retry
//! - [`pipeline`]: Staged enrichment orchestrator with eager checkpoints
//! - [`ratelimit`]: Rolling-window rate limiter and transient-failure retry
//! - [`notify`]: Case status state machine and best-effort live delivery
//! - [`worker`]: The tick gluing queue, pipeline, and notifier together
//! - [`webhook`]: Change-event signature verification and validation
//! - [`cleanup`]: Background retention sweep for old terminal jobs
//! - [`error`]: Error taxonomy with machine-readable codes

#![deny(missing_docs)]

/// Environment-variable configuration for the core.
pub mod config;

/// Background retention sweep deleting old terminal jobs.
pub mod cleanup;

/// Error types for core operations with machine-readable code mapping.
pub mod error;

/// Embedded database migrations for both backends.
pub mod migrations;

/// Case status state machine, live channel, and subscription registry.
pub mod notify;

/// Persistence trait and the PostgreSQL/SQLite implementations.
pub mod persistence;

/// Staged enrichment pipeline orchestrator.
pub mod pipeline;

/// Durable job queue with atomic claim/complete/fail semantics.
pub mod queue;

/// Per-resource rolling-window rate limiting and retry with backoff.
pub mod ratelimit;

/// External enrichment services trait and HTTP implementation.
pub mod services;

/// Change-event webhook verification and validation.
pub mod webhook;

/// Worker tick: claim a job, run the pipeline, record the outcome.
pub mod worker;

pub use config::{BackoffConfig, Config, ConfigError, Environment};
pub use error::{CoreError, Result};
pub use notify::{CaseStatus, LiveChannel, Notifier, StatusEvent, SubscriptionRegistry};
pub use persistence::{Persistence, connect};
pub use pipeline::{CaseInput, EnrichmentContext, Orchestrator, PipelineConfig, StageKind};
pub use queue::{EnqueueOptions, FailOutcome, JobQueue};
pub use ratelimit::{RateLimitConfig, RateLimiter, ResourceLimits, RetryPolicy};
pub use services::{EnrichmentServices, HttpEnrichmentServices, HttpServicesConfig};
pub use worker::{CASE_QUEUE, TickOutcome, Worker};
