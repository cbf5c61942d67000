// Copyright (C) 2025 Caseflow Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Change-event webhook boundary: signature verification and structural
//! validation.
//!
//! First-party events carry an HMAC-SHA256 signature over the raw request
//! body, hex-encoded, verified in constant time. Third-party events are
//! validated structurally instead. Either way, validation failures are
//! rejected at this boundary and never enqueued.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::error::{CoreError, Result};
use crate::pipeline::CaseInput;

type HmacSha256 = Hmac<Sha256>;

/// Table whose INSERT/UPDATE events trigger enrichment.
pub const CASE_TABLE: &str = "cases";

/// Inbound change event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    /// Change type: INSERT, UPDATE, or DELETE.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Table the change happened on.
    pub table: Option<String>,
    /// The changed record.
    pub record: Option<Value>,
    /// Schema the table lives in.
    #[serde(default)]
    pub schema: Option<String>,
    /// Previous record state, present on UPDATE/DELETE.
    #[serde(default)]
    pub old_record: Option<Value>,
}

/// What to do with a validated change event.
#[derive(Debug, Clone)]
pub enum WebhookAction {
    /// Enqueue an enrichment job for the case.
    Enqueue(CaseInput),
    /// Accepted, but no pipeline work results (e.g. DELETE).
    Ignore,
}

/// Compute the hex-encoded HMAC-SHA256 signature for a body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded HMAC-SHA256 signature over the raw request body.
///
/// Comparison happens inside `Mac::verify_slice`, which is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> Result<()> {
    let signature = hex::decode(signature_hex).map_err(|_| CoreError::SignatureMismatch)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| CoreError::SignatureMismatch)
}

/// Structurally validate a change event and decide what it triggers.
///
/// `type`, `table`, and `record` must be present; `record.id` and
/// `record.user_id` must be present. Unsupported `table` or `type` values are
/// rejected. Only INSERT/UPDATE on the case table enqueue work; DELETE is
/// accepted but produces none.
pub fn evaluate_event(event: &ChangeEvent) -> Result<WebhookAction> {
    let kind = require_field(event.kind.as_deref(), "type")?;
    if !matches!(kind, "INSERT" | "UPDATE" | "DELETE") {
        return Err(CoreError::Validation {
            field: "type".to_string(),
            message: format!("unsupported change type '{kind}'"),
        });
    }

    let table = require_field(event.table.as_deref(), "table")?;
    if table != CASE_TABLE {
        return Err(CoreError::Validation {
            field: "table".to_string(),
            message: format!("unsupported table '{table}'"),
        });
    }

    let record = event.record.as_ref().ok_or_else(|| CoreError::Validation {
        field: "record".to_string(),
        message: "missing".to_string(),
    })?;

    let case_id = require_record_str(record, "id")?;
    let user_id = require_record_str(record, "user_id")?;

    if kind == "DELETE" {
        return Ok(WebhookAction::Ignore);
    }

    let narrative = record
        .get("narrative")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let documents = record
        .get("documents")
        .and_then(Value::as_array)
        .map(|docs| {
            docs.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(WebhookAction::Enqueue(CaseInput {
        case_id: case_id.to_string(),
        user_id: user_id.to_string(),
        narrative,
        documents,
    }))
}

fn require_field<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CoreError::Validation {
            field: field.to_string(),
            message: "missing".to_string(),
        }),
    }
}

fn require_record_str<'a>(record: &'a Value, field: &str) -> Result<&'a str> {
    record
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CoreError::Validation {
            field: format!("record.{field}"),
            message: "missing".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "wh-secret";

    fn case_event(kind: &str) -> ChangeEvent {
        serde_json::from_value(json!({
            "type": kind,
            "table": "cases",
            "schema": "public",
            "record": {
                "id": "c-1",
                "user_id": "u-1",
                "narrative": "contract dispute",
                "documents": ["doc-1"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"type":"INSERT","table":"cases"}"#;
        let signature = sign(SECRET, body);
        verify_signature(SECRET, body, &signature).unwrap();
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let body = br#"{"type":"INSERT","table":"cases"}"#;
        let mut signature = sign(SECRET, body).into_bytes();
        // Flip one hex digit.
        signature[0] = if signature[0] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(signature).unwrap();

        let err = verify_signature(SECRET, body, &tampered).unwrap_err();
        assert!(matches!(err, CoreError::SignatureMismatch));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign(SECRET, b"original body");
        let err = verify_signature(SECRET, b"tampered body", &signature).unwrap_err();
        assert!(matches!(err, CoreError::SignatureMismatch));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let err = verify_signature(SECRET, b"body", "not hex!").unwrap_err();
        assert!(matches!(err, CoreError::SignatureMismatch));
    }

    #[test]
    fn test_insert_and_update_enqueue() {
        for kind in ["INSERT", "UPDATE"] {
            let action = evaluate_event(&case_event(kind)).unwrap();
            let WebhookAction::Enqueue(input) = action else {
                panic!("expected enqueue for {kind}");
            };
            assert_eq!(input.case_id, "c-1");
            assert_eq!(input.user_id, "u-1");
            assert_eq!(input.narrative, "contract dispute");
            assert_eq!(input.documents, vec!["doc-1".to_string()]);
        }
    }

    #[test]
    fn test_delete_is_accepted_but_ignored() {
        let action = evaluate_event(&case_event("DELETE")).unwrap();
        assert!(matches!(action, WebhookAction::Ignore));
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let mut event = case_event("INSERT");
        event.kind = Some("TRUNCATE".to_string());
        let err = evaluate_event(&event).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "type"));
    }

    #[test]
    fn test_unsupported_table_rejected() {
        let mut event = case_event("INSERT");
        event.table = Some("invoices".to_string());
        let err = evaluate_event(&event).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "table"));
    }

    #[test]
    fn test_missing_record_fields_rejected() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "type": "INSERT",
            "table": "cases",
            "record": { "id": "c-1" }
        }))
        .unwrap();
        let err = evaluate_event(&event).unwrap_err();
        assert!(
            matches!(err, CoreError::Validation { ref field, .. } if field == "record.user_id")
        );
    }

    #[test]
    fn test_missing_type_rejected() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "table": "cases",
            "record": { "id": "c-1", "user_id": "u-1" }
        }))
        .unwrap();
        let err = evaluate_event(&event).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "type"));
    }
}
