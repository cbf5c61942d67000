// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handler state.

use std::sync::Arc;

use caseflow_core::notify::SubscriptionRegistry;
use caseflow_core::persistence::Persistence;
use caseflow_core::worker::Worker;

use crate::config::ServerConfig;

/// State shared by all HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    /// The worker used for enqueue, tick, and reprocess.
    pub worker: Arc<Worker>,
    /// Direct store access for read-only queries.
    pub persistence: Arc<dyn Persistence>,
    /// Live subscription registry; present only when the WebSocket channel is
    /// enabled.
    pub registry: Option<Arc<SubscriptionRegistry>>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}
