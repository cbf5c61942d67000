// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server configuration from environment variables.

use std::net::SocketAddr;

use caseflow_core::ConfigError;

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Shared secret for first-party webhook signatures.
    pub webhook_secret: String,
    /// Expected service identity for the internal worker trigger.
    pub service_name: String,
    /// Shared secret paired with the service identity.
    pub service_secret: String,
    /// Bearer credential for the WebSocket channel. When unset the live
    /// channel is disabled and status is durable-storage-only.
    pub ws_token: Option<String>,
    /// Upper bound on jobs processed per internal trigger call.
    pub max_batch_size: u32,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `CASEFLOW_BIND_ADDR`: listen address (default: 0.0.0.0:8080)
    /// - `CASEFLOW_WEBHOOK_SECRET`: required
    /// - `CASEFLOW_SERVICE_NAME`: internal trigger identity (default: caseflow-worker)
    /// - `CASEFLOW_SERVICE_SECRET`: required
    /// - `CASEFLOW_WS_TOKEN`: optional; enables the WebSocket channel
    /// - `CASEFLOW_MAX_BATCH_SIZE`: internal trigger batch ceiling (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = std::env::var("CASEFLOW_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CASEFLOW_BIND_ADDR", "must be a socket address")
            })?;

        let webhook_secret = std::env::var("CASEFLOW_WEBHOOK_SECRET")
            .map_err(|_| ConfigError::Missing("CASEFLOW_WEBHOOK_SECRET"))?;
        let service_secret = std::env::var("CASEFLOW_SERVICE_SECRET")
            .map_err(|_| ConfigError::Missing("CASEFLOW_SERVICE_SECRET"))?;
        let service_name = std::env::var("CASEFLOW_SERVICE_NAME")
            .unwrap_or_else(|_| "caseflow-worker".to_string());

        let max_batch_size: u32 = std::env::var("CASEFLOW_MAX_BATCH_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CASEFLOW_MAX_BATCH_SIZE", "must be a positive integer")
            })?;

        Ok(Self {
            bind_addr,
            webhook_secret,
            service_name,
            service_secret,
            ws_token: std::env::var("CASEFLOW_WS_TOKEN").ok(),
            max_batch_size,
        })
    }
}
