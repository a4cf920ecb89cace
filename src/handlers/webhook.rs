use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::errors::{AppError, ErrorKind};
use crate::services::confirmation::{self, WebhookOutcome};
use crate::services::gateway::webhook::{WebhookVerifier, SIGNATURE_HEADER};
use crate::state::AppState;

// POST /webhooks/payment
//
// Authenticated by signature only. Any non-2xx response makes the gateway redeliver, so
// only failures worth retrying (or worth an operator's attention) return one.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let verifier = WebhookVerifier::new(
        state.config.stripe_webhook_secret.clone(),
        state.config.webhook_tolerance_secs,
    );
    let now = chrono::Utc::now();

    let event = match verifier.verify_and_parse(&body, signature, now.timestamp()) {
        Ok(event) => event,
        Err(e) => return failure(e),
    };

    let outcome = match state.db() {
        Ok(mut db) => confirmation::handle_event(&mut db, &event, now.naive_utc()),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(outcome) => {
            match &outcome {
                WebhookOutcome::Confirmed { booking_id } => {
                    tracing::info!(event_id = event.event_id(), booking_id = %booking_id, "webhook confirmed booking");
                }
                WebhookOutcome::AlreadyReconciled { booking_id } => {
                    tracing::info!(event_id = event.event_id(), booking_id = %booking_id, "webhook replay acknowledged");
                }
                WebhookOutcome::FailureRecorded { booking_id } => {
                    tracing::info!(event_id = event.event_id(), booking_id = %booking_id, "webhook payment failure recorded");
                }
                WebhookOutcome::UnknownIntent | WebhookOutcome::Ignored => {}
            }
            Json(serde_json::json!({"success": true})).into_response()
        }
        Err(e) => {
            tracing::warn!(event_id = event.event_id(), error = %e, "webhook processing failed, gateway will retry");
            failure(e)
        }
    }
}

fn failure(err: AppError) -> Response {
    let status = match err.kind() {
        ErrorKind::Signature | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        _ => err.status_code(),
    };

    if matches!(err.kind(), ErrorKind::Configuration | ErrorKind::Internal) {
        tracing::error!(error = %err, "webhook rejected");
    } else {
        tracing::warn!(error = %err, code = err.code(), "webhook rejected");
    }

    (
        status,
        Json(serde_json::json!({"success": false, "error": err.code()})),
    )
        .into_response()
}
