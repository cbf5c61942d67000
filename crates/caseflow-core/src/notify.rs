// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Case status state machine and notification delivery.
//!
//! Every transition is written durably first; that write is surfaced to the
//! caller if it fails and is the single source of truth polling consumers
//! read. Live delivery through a [`LiveChannel`] is best-effort on top: a
//! missing subscriber or absent transport is a normal state, never an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

/// Case-level processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    /// Enqueued, not yet picked up.
    Pending,
    /// A worker is running the pipeline.
    Processing,
    /// The pipeline finished successfully.
    Completed,
    /// The pipeline failed.
    Failed,
}

impl CaseStatus {
    /// Stable string form stored in the case record.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pending => "pending",
            CaseStatus::Processing => "processing",
            CaseStatus::Completed => "completed",
            CaseStatus::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CaseStatus::Pending),
            "processing" => Some(CaseStatus::Processing),
            "completed" => Some(CaseStatus::Completed),
            "failed" => Some(CaseStatus::Failed),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Within one run the machine is one-directional with no cycles.
    /// `failed -> processing` is the explicit re-run edge taken by a job
    /// retry or a manual reprocess; `completed` is terminal.
    pub fn can_transition_to(&self, next: CaseStatus) -> bool {
        matches!(
            (self, next),
            (CaseStatus::Pending, CaseStatus::Processing)
                | (CaseStatus::Processing, CaseStatus::Completed)
                | (CaseStatus::Processing, CaseStatus::Failed)
                | (CaseStatus::Failed, CaseStatus::Processing)
                | (CaseStatus::Failed, CaseStatus::Pending)
        )
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseStatus::Completed)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status transition pushed to live subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Case whose status changed.
    pub case_id: String,
    /// Owning user.
    pub user_id: String,
    /// New status.
    pub status: CaseStatus,
    /// Human-readable detail accompanying a failed status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

/// Best-effort live delivery of status events.
///
/// Implementations must not fail: a dropped or undeliverable event is
/// tolerated by design, because the durable status write has already
/// happened before any send.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Deliver an event to any live subscribers for its case.
    async fn send(&self, event: StatusEvent);
}

/// No-op channel for environments without a live transport.
pub struct NoopChannel;

#[async_trait]
impl LiveChannel for NoopChannel {
    async fn send(&self, event: StatusEvent) {
        debug!(case_id = %event.case_id, status = %event.status, "No live channel, event dropped");
    }
}

/// Handle returned by [`SubscriptionRegistry::subscribe`], used to
/// unsubscribe.
pub type SubscriptionToken = u64;

/// In-process registry of live subscribers, keyed by case id.
///
/// The registry is ephemeral by design: subscriptions exist only while a
/// connection is open, and an empty registry is the normal state.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_token: AtomicU64,
    by_case: DashMap<String, Vec<(SubscriptionToken, mpsc::UnboundedSender<StatusEvent>)>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender for a case. Events for that case are pushed to the
    /// sender until [`SubscriptionRegistry::unsubscribe`] or the receiver is
    /// dropped.
    pub fn subscribe(
        &self,
        case_id: &str,
        sender: mpsc::UnboundedSender<StatusEvent>,
    ) -> SubscriptionToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.by_case
            .entry(case_id.to_string())
            .or_default()
            .push((token, sender));
        token
    }

    /// Remove one subscription for a case.
    pub fn unsubscribe(&self, case_id: &str, token: SubscriptionToken) {
        if let Some(mut entry) = self.by_case.get_mut(case_id) {
            entry.retain(|(t, _)| *t != token);
        }
        self.by_case.remove_if(case_id, |_, senders| senders.is_empty());
    }

    /// Number of live subscriptions for a case.
    pub fn subscriber_count(&self, case_id: &str) -> usize {
        self.by_case.get(case_id).map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LiveChannel for SubscriptionRegistry {
    async fn send(&self, event: StatusEvent) {
        if let Some(mut entry) = self.by_case.get_mut(&event.case_id) {
            // Closed receivers are pruned on the way through.
            entry.retain(|(_, sender)| sender.send(event.clone()).is_ok());
        }
    }
}

/// Emits case status transitions: durable write first, live delivery second.
#[derive(Clone)]
pub struct Notifier {
    persistence: Arc<dyn Persistence>,
    channel: Arc<dyn LiveChannel>,
}

impl Notifier {
    /// Create a notifier over the given persistence and live channel.
    pub fn new(persistence: Arc<dyn Persistence>, channel: Arc<dyn LiveChannel>) -> Self {
        Self {
            persistence,
            channel,
        }
    }

    /// Transition a case to a new status.
    ///
    /// The state machine is enforced here: an illegal edge returns
    /// [`CoreError::InvalidStatusTransition`] without writing anything. The
    /// durable write happens before any live delivery and its failure
    /// propagates to the caller.
    pub async fn transition(
        &self,
        case_id: &str,
        to: CaseStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let case = self
            .persistence
            .get_case(case_id)
            .await?
            .ok_or_else(|| CoreError::CaseNotFound {
                case_id: case_id.to_string(),
            })?;

        let from = CaseStatus::parse(&case.processing_status).ok_or_else(|| {
            CoreError::Validation {
                field: "processing_status".to_string(),
                message: format!(
                    "case '{}' has unknown status '{}'",
                    case_id, case.processing_status
                ),
            }
        })?;

        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidStatusTransition {
                case_id: case_id.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        self.persistence
            .set_case_status(case_id, to.as_str(), detail)
            .await?;
        debug!(case_id, from = %from, to = %to, "Case status transition");

        self.channel
            .send(StatusEvent {
                case_id: case_id.to_string(),
                user_id: case.user_id,
                status: to,
                detail: detail.map(str::to_string),
                timestamp: Utc::now(),
            })
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(CaseStatus::Pending.can_transition_to(CaseStatus::Processing));
        assert!(CaseStatus::Processing.can_transition_to(CaseStatus::Completed));
        assert!(CaseStatus::Processing.can_transition_to(CaseStatus::Failed));
    }

    #[test]
    fn test_rerun_edges_from_failed() {
        assert!(CaseStatus::Failed.can_transition_to(CaseStatus::Processing));
        assert!(CaseStatus::Failed.can_transition_to(CaseStatus::Pending));
    }

    #[test]
    fn test_completed_is_terminal() {
        assert!(CaseStatus::Completed.is_terminal());
        for next in [
            CaseStatus::Pending,
            CaseStatus::Processing,
            CaseStatus::Completed,
            CaseStatus::Failed,
        ] {
            assert!(!CaseStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn test_no_backward_or_skip_edges() {
        assert!(!CaseStatus::Pending.can_transition_to(CaseStatus::Completed));
        assert!(!CaseStatus::Pending.can_transition_to(CaseStatus::Failed));
        assert!(!CaseStatus::Processing.can_transition_to(CaseStatus::Pending));
        assert!(!CaseStatus::Processing.can_transition_to(CaseStatus::Processing));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CaseStatus::Pending,
            CaseStatus::Processing,
            CaseStatus::Completed,
            CaseStatus::Failed,
        ] {
            assert_eq!(CaseStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CaseStatus::parse("cancelled"), None);
    }

    #[tokio::test]
    async fn test_registry_delivers_and_prunes() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = registry.subscribe("c-1", tx);
        assert_eq!(registry.subscriber_count("c-1"), 1);

        let event = StatusEvent {
            case_id: "c-1".to_string(),
            user_id: "u-1".to_string(),
            status: CaseStatus::Processing,
            detail: None,
            timestamp: Utc::now(),
        };
        registry.send(event).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.status, CaseStatus::Processing);

        registry.unsubscribe("c-1", token);
        assert_eq!(registry.subscriber_count("c-1"), 0);
    }

    #[tokio::test]
    async fn test_registry_send_without_subscribers_is_noop() {
        let registry = SubscriptionRegistry::new();
        registry
            .send(StatusEvent {
                case_id: "c-2".to_string(),
                user_id: "u-1".to_string(),
                status: CaseStatus::Completed,
                detail: None,
                timestamp: Utc::now(),
            })
            .await;
        assert_eq!(registry.subscriber_count("c-2"), 0);
    }

    #[tokio::test]
    async fn test_registry_drops_closed_receivers() {
        let registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.subscribe("c-3", tx);
        drop(rx);

        registry
            .send(StatusEvent {
                case_id: "c-3".to_string(),
                user_id: "u-1".to_string(),
                status: CaseStatus::Failed,
                detail: Some("stage failed".to_string()),
                timestamp: Utc::now(),
            })
            .await;

        assert_eq!(registry.subscriber_count("c-3"), 0);
    }
}
