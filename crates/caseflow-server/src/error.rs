// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping from core errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use caseflow_core::CoreError;

/// Wrapper turning a [`CoreError`] into an HTTP response.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::SignatureMismatch => StatusCode::UNAUTHORIZED,
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::CaseNotFound { .. } | CoreError::JobNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            CoreError::InvalidStatusTransition { .. } | CoreError::InvalidJobState { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }

        let body = Json(json!({
            "error": self.0.error_code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
