// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for caseflow-core.
//!
//! The taxonomy follows how errors propagate through the system: transient
//! external failures are retried, validation failures are rejected at the
//! boundary, stage failures are converted into case-level failure at the
//! worker boundary and never re-thrown past it.

use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during queue, pipeline, and boundary processing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Job was not found in the database.
    #[error("job '{job_id}' not found")]
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// Job is in an invalid state for the requested operation.
    #[error("job '{job_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidJobState {
        /// The job ID.
        job_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Case was not found in the database.
    #[error("case '{case_id}' not found")]
    CaseNotFound {
        /// The case ID that was not found.
        case_id: String,
    },

    /// A case status transition that the state machine does not allow.
    #[error("case '{case_id}' cannot transition from '{from}' to '{to}'")]
    InvalidStatusTransition {
        /// The case ID.
        case_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Input validation failed at a boundary; never enqueued, never retried.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Webhook signature did not verify against the shared secret.
    #[error("signature verification failed")]
    SignatureMismatch,

    /// Transient failure from an external call (timeout, 5xx, network).
    /// Retried with bounded backoff; converts to [`CoreError::StageFailed`]
    /// once retries are exhausted.
    #[error("transient external failure during '{operation}': {details}")]
    TransientExternal {
        /// The external operation that failed.
        operation: String,
        /// Failure details.
        details: String,
    },

    /// Permanent failure from an external call (4xx, malformed response).
    #[error("external call '{operation}' failed permanently: {details}")]
    External {
        /// The external operation that failed.
        operation: String,
        /// Failure details.
        details: String,
    },

    /// A pipeline stage could not produce output.
    #[error("stage '{stage}' failed: {reason}")]
    StageFailed {
        /// Name of the failing stage.
        stage: String,
        /// Why the stage failed.
        reason: String,
    },

    /// Database operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the machine-readable error code for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::InvalidJobState { .. } => "INVALID_JOB_STATE",
            Self::CaseNotFound { .. } => "CASE_NOT_FOUND",
            Self::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::SignatureMismatch => "SIGNATURE_MISMATCH",
            Self::TransientExternal { .. } => "TRANSIENT_EXTERNAL_ERROR",
            Self::External { .. } => "EXTERNAL_ERROR",
            Self::StageFailed { .. } => "STAGE_FAILED",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientExternal { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(CoreError, &str)> = vec![
            (
                CoreError::JobNotFound {
                    job_id: "j-1".to_string(),
                },
                "JOB_NOT_FOUND",
            ),
            (
                CoreError::InvalidJobState {
                    job_id: "j-1".to_string(),
                    expected: "processing".to_string(),
                    actual: "completed".to_string(),
                },
                "INVALID_JOB_STATE",
            ),
            (CoreError::SignatureMismatch, "SIGNATURE_MISMATCH"),
            (
                CoreError::StageFailed {
                    stage: "intake_analysis".to_string(),
                    reason: "no output".to_string(),
                },
                "STAGE_FAILED",
            ),
        ];

        for (error, expected_code) in cases {
            assert_eq!(error.error_code(), expected_code);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_transient_classification() {
        let transient = CoreError::TransientExternal {
            operation: "llm_completion".to_string(),
            details: "timeout".to_string(),
        };
        assert!(transient.is_transient());

        let permanent = CoreError::External {
            operation: "llm_completion".to_string(),
            details: "400 bad request".to_string(),
        };
        assert!(!permanent.is_transient());

        let validation = CoreError::Validation {
            field: "record.id".to_string(),
            message: "missing".to_string(),
        };
        assert!(!validation.is_transient());
    }

    #[test]
    fn test_display_includes_context() {
        let err = CoreError::StageFailed {
            stage: "case_law_search".to_string(),
            reason: "all sources failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("case_law_search"));
        assert!(msg.contains("all sources failed"));
    }
}
