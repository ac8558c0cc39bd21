//! Payment webhook endpoint.
//!
//! Raw body in, signature header checked, then the billing pipeline.
//! Duplicates acknowledge with `skipped: true`; handler failures return
//! 500 so the provider redelivers, with the outcome already recorded for
//! manual replay.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use easel_billing::WebhookOutcome;

use crate::error::ApiError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn receive_payment_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let event = state.billing.webhooks.verify(&body, signature)?;
    let event_id = event.id.clone();

    match state.billing.webhooks.process(event).await? {
        WebhookOutcome::Processed => {
            Ok((StatusCode::OK, Json(json!({ "received": true }))).into_response())
        }
        WebhookOutcome::Skipped => Ok((
            StatusCode::OK,
            Json(json!({ "received": true, "skipped": true })),
        )
            .into_response()),
        WebhookOutcome::Failed(error) => {
            // Recorded for replay; a 500 lets the provider redeliver, and
            // the idempotency gate keeps redelivery harmless.
            tracing::error!(event_id = %event_id, error = %error, "Webhook handler failed");
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "event processing failed", "details": error })),
            )
                .into_response())
        }
    }
}
