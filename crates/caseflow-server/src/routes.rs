// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP route handlers.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use caseflow_core::CoreError;
use caseflow_core::pipeline::CaseInput;
use caseflow_core::webhook::{self, ChangeEvent, WebhookAction};
use caseflow_core::worker::{CASE_QUEUE, TickOutcome};

use crate::error::ApiError;
use crate::state::AppState;

/// Build the application router. The WebSocket route is mounted only when
/// the live channel is enabled.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/webhooks/cases", post(receive_webhook))
        .route("/cases/{id}/status", get(case_status))
        .route("/cases/{id}/reprocess", post(reprocess_case))
        .route("/internal/process-job", post(process_job))
        .route("/internal/queue-stats", get(queue_stats));

    if state.registry.is_some() {
        router = router.route("/ws", get(crate::ws::ws_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Fixed-length digest comparison, so the check does not leak length or
/// prefix timing.
fn secrets_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Authorize a machine-to-machine call via the service header pair.
fn authorize_service(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let name = headers
        .get("x-service-name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let secret = headers
        .get("x-service-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if secrets_match(name, &state.config.service_name)
        && secrets_match(secret, &state.config.service_secret)
    {
        Ok(())
    } else {
        Err(CoreError::SignatureMismatch.into())
    }
}

#[instrument(skip_all)]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.persistence.health_check_db().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "reachable" })),
        ),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": "unreachable" })),
        ),
    }
}

/// Change-event intake.
///
/// First-party events carry `x-webhook-signature`; anything without one is
/// treated as third-party and relies on structural validation alone.
#[instrument(skip_all)]
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(signature) = headers.get("x-webhook-signature") {
        let signature = signature.to_str().map_err(|_| CoreError::SignatureMismatch)?;
        webhook::verify_signature(&state.config.webhook_secret, &body, signature)?;
    }

    let event: ChangeEvent =
        serde_json::from_slice(&body).map_err(|e| CoreError::Validation {
            field: "body".to_string(),
            message: e.to_string(),
        })?;

    match webhook::evaluate_event(&event)? {
        WebhookAction::Enqueue(input) => {
            let job_id = state.worker.enqueue_case(&input).await?;
            info!(case_id = %input.case_id, job_id = %job_id, "Webhook enqueued case");
            Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
        }
        WebhookAction::Ignore => Ok((StatusCode::OK, Json(json!({ "status": "ignored" })))),
    }
}

#[instrument(skip(state))]
async fn case_status(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let case = state
        .persistence
        .get_case(&case_id)
        .await?
        .ok_or_else(|| CoreError::CaseNotFound {
            case_id: case_id.clone(),
        })?;

    let mut response = json!({
        "status": case.processing_status,
        "lastUpdate": case.updated_at,
    });
    if let Some(detail) = case.status_detail {
        response["detail"] = json!(detail);
    }

    if case.processing_status == "completed" {
        let stages = state.persistence.list_stages(&case_id).await?;
        let results: serde_json::Map<String, Value> = stages
            .into_iter()
            .filter_map(|s| s.output.map(|output| (s.stage, output)))
            .collect();
        response["results"] = Value::Object(results);
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TriggerRequest {
    batch_size: u32,
}

impl Default for TriggerRequest {
    fn default() -> Self {
        Self { batch_size: 1 }
    }
}

/// Internal worker trigger. "No eligible job" is a distinct non-error
/// response, never a failure status.
#[instrument(skip_all)]
async fn process_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<TriggerRequest>>,
) -> Result<Json<Value>, ApiError> {
    authorize_service(&state, &headers)?;

    let batch_size = body
        .map(|Json(r)| r.batch_size)
        .unwrap_or(1)
        .clamp(1, state.config.max_batch_size);

    if batch_size == 1 {
        match state.worker.tick(CASE_QUEUE).await? {
            TickOutcome::QueueEmpty => Ok(Json(json!({ "status": "no_eligible_job" }))),
            TickOutcome::Processed {
                job_id,
                case_id,
                succeeded,
            } => Ok(Json(json!({
                "jobId": job_id,
                "caseId": case_id,
                "succeeded": succeeded,
            }))),
        }
    } else {
        let summary = state.worker.run_batch(CASE_QUEUE, batch_size).await;
        if summary.processed == 0 {
            Ok(Json(json!({ "status": "no_eligible_job" })))
        } else {
            Ok(Json(json!({ "batch": summary })))
        }
    }
}

#[instrument(skip_all)]
async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_service(&state, &headers)?;
    Ok(Json(state.worker.queue_report(CASE_QUEUE).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReprocessRequest {
    user_id: String,
    narrative: String,
    documents: Vec<String>,
}

/// Manual reprocess: the only resurrection path for a permanently failed
/// case. Current case material may be supplied in the body; the owner falls
/// back to the stored case record.
#[instrument(skip(state, headers, body))]
async fn reprocess_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReprocessRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_service(&state, &headers)?;

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let user_id = if request.user_id.is_empty() {
        state
            .persistence
            .get_case(&case_id)
            .await?
            .ok_or_else(|| CoreError::CaseNotFound {
                case_id: case_id.clone(),
            })?
            .user_id
    } else {
        request.user_id
    };

    let input = CaseInput {
        case_id,
        user_id,
        narrative: request.narrative,
        documents: request.documents,
    };
    let job_id = state.worker.reprocess(&input).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}
