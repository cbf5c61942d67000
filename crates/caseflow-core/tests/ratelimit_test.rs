// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the durable rolling-window rate limiter.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use caseflow_core::persistence::{Persistence, RateDecision, SqlitePersistence};
use caseflow_core::ratelimit::{RateLimitConfig, RateLimiter, ResourceLimits};

/// Rewind a resource's window so it reads as expired.
async fn expire_window(store: &SqlitePersistence, resource: &str) {
    sqlx::query("UPDATE rate_windows SET window_start = ?1 WHERE resource = ?2")
        .bind(Utc::now() - ChronoDuration::seconds(61))
        .bind(resource)
        .execute(store.pool())
        .await
        .expect("expire window");
}

#[tokio::test]
async fn test_rpm_limit_admits_exactly_n_per_window() {
    let (store, _dir) = common::sqlite().await;
    let rpm = 3;

    for _ in 0..rpm {
        let decision = store
            .try_admit("model-a", Utc::now(), 1, rpm, 1_000_000)
            .await
            .unwrap();
        assert_eq!(decision, RateDecision::Admitted);
    }

    // The N+1th call is denied, not rejected with an error.
    let decision = store
        .try_admit("model-a", Utc::now(), 1, rpm, 1_000_000)
        .await
        .unwrap();
    assert!(matches!(decision, RateDecision::Denied { .. }));

    // After rollover the same call is admitted and counters restart.
    expire_window(&store, "model-a").await;
    let decision = store
        .try_admit("model-a", Utc::now(), 1, rpm, 1_000_000)
        .await
        .unwrap();
    assert_eq!(decision, RateDecision::Admitted);

    let (requests, window_start): (i64, chrono::DateTime<Utc>) = sqlx::query_as(
        "SELECT request_count, window_start FROM rate_windows WHERE resource = ?1",
    )
    .bind("model-a")
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(requests, 1, "counters reset on rollover");
    assert!(window_start > Utc::now() - ChronoDuration::seconds(5));
}

#[tokio::test]
async fn test_tpm_limit_counts_estimated_tokens() {
    let (store, _dir) = common::sqlite().await;

    // 40 tokens each against a 100-token ceiling: two fit, the third does not.
    for _ in 0..2 {
        let decision = store
            .try_admit("model-b", Utc::now(), 40, 1000, 100)
            .await
            .unwrap();
        assert_eq!(decision, RateDecision::Admitted);
    }
    let decision = store
        .try_admit("model-b", Utc::now(), 40, 1000, 100)
        .await
        .unwrap();
    assert!(matches!(decision, RateDecision::Denied { .. }));

    // A smaller call still fits under the remaining token budget.
    let decision = store
        .try_admit("model-b", Utc::now(), 20, 1000, 100)
        .await
        .unwrap();
    assert_eq!(decision, RateDecision::Admitted);
}

#[tokio::test]
async fn test_denied_decision_reports_window_start() {
    let (store, _dir) = common::sqlite().await;

    store
        .try_admit("model-c", Utc::now(), 1, 1, 1_000_000)
        .await
        .unwrap();
    let decision = store
        .try_admit("model-c", Utc::now(), 1, 1, 1_000_000)
        .await
        .unwrap();

    let RateDecision::Denied { window_start } = decision else {
        panic!("expected denial");
    };
    let age = Utc::now().signed_duration_since(window_start);
    assert!(age >= ChronoDuration::zero());
    assert!(age < ChronoDuration::seconds(60));
}

#[tokio::test]
async fn test_windows_are_independent_per_resource() {
    let (store, _dir) = common::sqlite().await;

    store
        .try_admit("model-d", Utc::now(), 1, 1, 1_000_000)
        .await
        .unwrap();
    let decision = store
        .try_admit("model-d", Utc::now(), 1, 1, 1_000_000)
        .await
        .unwrap();
    assert!(matches!(decision, RateDecision::Denied { .. }));

    // Another resource is unaffected.
    let decision = store
        .try_admit("model-e", Utc::now(), 1, 1, 1_000_000)
        .await
        .unwrap();
    assert_eq!(decision, RateDecision::Admitted);
}

#[tokio::test]
async fn test_acquire_admits_under_capacity() {
    let (store, _dir) = common::sqlite().await;
    let persistence: Arc<dyn Persistence> = Arc::new(store.clone());

    let mut config = RateLimitConfig::for_environment(caseflow_core::Environment::Development);
    config.min_call_interval = Duration::ZERO;
    let config = config.with_limit(
        "model-f",
        ResourceLimits {
            requests_per_minute: 5,
            tokens_per_minute: 10_000,
        },
    );
    let limiter = RateLimiter::new(persistence, config);

    for _ in 0..5 {
        limiter.acquire("model-f", 100).await.unwrap();
    }

    let (requests, tokens): (i64, i64) =
        sqlx::query_as("SELECT request_count, token_count FROM rate_windows WHERE resource = ?1")
            .bind("model-f")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(requests, 5);
    assert_eq!(tokens, 500);
}

#[tokio::test]
async fn test_acquire_admits_oversized_estimate_against_empty_window() {
    let (store, _dir) = common::sqlite().await;
    let persistence: Arc<dyn Persistence> = Arc::new(store.clone());

    let mut config = RateLimitConfig::for_environment(caseflow_core::Environment::Development);
    config.min_call_interval = Duration::ZERO;
    let config = config.with_limit(
        "model-h",
        ResourceLimits {
            requests_per_minute: 10,
            tokens_per_minute: 100,
        },
    );
    let limiter = RateLimiter::new(persistence, config);

    // An estimate above the whole TPM ceiling is clamped, not looped on
    // forever.
    tokio::time::timeout(Duration::from_secs(5), limiter.acquire("model-h", 1000))
        .await
        .expect("oversized call must still be admitted")
        .unwrap();

    // The clamped call saturated the window's token budget.
    let (tokens,): (i64,) =
        sqlx::query_as("SELECT token_count FROM rate_windows WHERE resource = ?1")
            .bind("model-h")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(tokens, 100);

    let decision = store
        .try_admit("model-h", Utc::now(), 1, 10, 100)
        .await
        .unwrap();
    assert!(matches!(decision, RateDecision::Denied { .. }));
}

#[tokio::test]
async fn test_acquire_waits_for_rollover_instead_of_rejecting() {
    let (store, _dir) = common::sqlite().await;
    let persistence: Arc<dyn Persistence> = Arc::new(store.clone());

    let mut config = RateLimitConfig::for_environment(caseflow_core::Environment::Development);
    config.min_call_interval = Duration::ZERO;
    let config = config.with_limit(
        "model-g",
        ResourceLimits {
            requests_per_minute: 1,
            tokens_per_minute: 10_000,
        },
    );
    let limiter = RateLimiter::new(persistence, config);

    limiter.acquire("model-g", 1).await.unwrap();

    // Age the saturated window to one second before rollover. The next
    // acquire is denied, waits out the remainder, then gets admitted against
    // the reset window.
    sqlx::query("UPDATE rate_windows SET window_start = ?1 WHERE resource = ?2")
        .bind(Utc::now() - ChronoDuration::seconds(59))
        .bind("model-g")
        .execute(store.pool())
        .await
        .unwrap();

    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(30), limiter.acquire("model-g", 1))
        .await
        .expect("acquire must be admitted after rollover")
        .unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "acquire must have waited, not errored through"
    );
}
