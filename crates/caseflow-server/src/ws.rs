// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket live notification channel.
//!
//! Clients authenticate with a bearer credential at connect time, then
//! subscribe and unsubscribe per case id. Status updates for subscribed cases
//! are pushed as they happen; ping/pong is a keep-alive with no payload
//! semantics.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use caseflow_core::notify::{StatusEvent, SubscriptionToken};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeCase { case_id: String },
    #[serde(rename_all = "camelCase")]
    UnsubscribeCase { case_id: String },
    Ping,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Extract the bearer credential from the Authorization header or, for
/// browser clients that cannot set headers on WebSocket upgrade, the `token`
/// query parameter.
fn presented_token(headers: &HeaderMap, query: &WsQuery) -> Option<String> {
    if let Some(value) = headers.get("authorization")
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.to_string());
    }
    query.token.clone()
}

/// Upgrade handler for `/ws`.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(expected) = state.config.ws_token.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match presented_token(&headers, &query) {
        Some(token) if token == expected => {
            ws.on_upgrade(move |socket| handle_socket(socket, state))
        }
        _ => {
            warn!("WebSocket connection rejected: bad or missing credential");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let Some(registry) = state.registry.clone() else {
        return;
    };

    // One event channel per connection; the registry fans events for every
    // subscribed case into it.
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusEvent>();
    let mut subscriptions: HashMap<String, SubscriptionToken> = HashMap::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => {
                        let parsed: Result<ClientMessage, _> = serde_json::from_str(text.as_str());
                        let reply = match parsed {
                            Ok(ClientMessage::SubscribeCase { case_id }) => {
                                if !subscriptions.contains_key(&case_id) {
                                    let token = registry.subscribe(&case_id, tx.clone());
                                    subscriptions.insert(case_id.clone(), token);
                                }
                                json!({ "type": "subscribed", "caseId": case_id })
                            }
                            Ok(ClientMessage::UnsubscribeCase { case_id }) => {
                                if let Some(token) = subscriptions.remove(&case_id) {
                                    registry.unsubscribe(&case_id, token);
                                }
                                json!({ "type": "unsubscribed", "caseId": case_id })
                            }
                            Ok(ClientMessage::Ping) => json!({ "type": "pong" }),
                            Err(e) => json!({ "type": "error", "message": e.to_string() }),
                        };
                        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Protocol-level pings are answered by axum; ignore the rest.
                    _ => {}
                }
            }
            Some(event) = rx.recv() => {
                let mut payload = serde_json::to_value(&event)
                    .unwrap_or_else(|_| json!({}));
                payload["type"] = json!("status_update");
                if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    for (case_id, token) in subscriptions {
        registry.unsubscribe(&case_id, token);
    }
    debug!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_case","caseId":"c-1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SubscribeCase { case_id } if case_id == "c-1"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"unsubscribe_case","caseId":"c-1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::UnsubscribeCase { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok-1".parse().unwrap());
        assert_eq!(
            presented_token(&headers, &WsQuery::default()),
            Some("tok-1".to_string())
        );

        let query = WsQuery {
            token: Some("tok-2".to_string()),
        };
        assert_eq!(
            presented_token(&HeaderMap::new(), &query),
            Some("tok-2".to_string())
        );
        assert_eq!(presented_token(&HeaderMap::new(), &WsQuery::default()), None);
    }
}
