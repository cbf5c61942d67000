// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Deployment environment. Production runs with stricter rate limits to keep
/// headroom against the true provider ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Local development and CI.
    #[default]
    Development,
    /// Production deployment.
    Production,
}

impl Environment {
    /// Parse from the `CASEFLOW_ENV` value. Unknown values default to development.
    pub fn parse(value: &str) -> Self {
        match value {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Exponential backoff parameters for job retries.
///
/// The delay for retry attempt `n` is `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the retry delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// Caseflow core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL.
    pub database_url: String,
    /// Deployment environment (selects rate-limit tier).
    pub environment: Environment,
    /// Job retry backoff parameters.
    pub backoff: BackoffConfig,
    /// Wall-clock ceiling for a single external call.
    pub call_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CASEFLOW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CASEFLOW_ENV`: "development" or "production" (default: development)
    /// - `CASEFLOW_BACKOFF_BASE_SECS`: base job retry delay (default: 30)
    /// - `CASEFLOW_BACKOFF_MAX_SECS`: max job retry delay (default: 3600)
    /// - `CASEFLOW_CALL_TIMEOUT_SECS`: per-external-call timeout (default: 120)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CASEFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CASEFLOW_DATABASE_URL"))?;

        let environment = Environment::parse(
            &std::env::var("CASEFLOW_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let base_secs: u64 = std::env::var("CASEFLOW_BACKOFF_BASE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CASEFLOW_BACKOFF_BASE_SECS", "must be a positive integer")
            })?;

        let max_secs: u64 = std::env::var("CASEFLOW_BACKOFF_MAX_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CASEFLOW_BACKOFF_MAX_SECS", "must be a positive integer")
            })?;

        let call_timeout_secs: u64 = std::env::var("CASEFLOW_CALL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CASEFLOW_CALL_TIMEOUT_SECS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            environment,
            backoff: BackoffConfig {
                base_delay: Duration::from_secs(base_secs),
                max_delay: Duration::from_secs(max_secs),
            },
            call_timeout: Duration::from_secs(call_timeout_secs),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("production"), Environment::Production);
        assert_eq!(Environment::parse("prod"), Environment::Production);
        assert_eq!(Environment::parse("development"), Environment::Development);
        assert_eq!(Environment::parse("staging"), Environment::Development);
    }

    #[test]
    fn test_backoff_defaults() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.base_delay, Duration::from_secs(30));
        assert_eq!(backoff.max_delay, Duration::from_secs(3600));
        assert!(backoff.base_delay < backoff.max_delay);
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("CASEFLOW_DATABASE_URL");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: CASEFLOW_DATABASE_URL"
        );

        let invalid = ConfigError::Invalid("CASEFLOW_BACKOFF_BASE_SECS", "must be a number");
        assert!(invalid.to_string().contains("CASEFLOW_BACKOFF_BASE_SECS"));
    }
}
