//! Webhook receiver: signature verification and the gate/dispatch
//! orchestration.
//!
//! The provider signs `"{t}.{body}"` with HMAC-SHA256 and sends
//! `t=<unix>,v1=<hex>` in the signature header. Verification is a hard
//! rejection, never retried internally. A verified event flows through the
//! idempotency gate, then the dispatcher, and the gate records the outcome
//! for audit and manual replay.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::dispatch::EventDispatcher;
use crate::error::{BillingError, BillingResult};
use crate::events::PaymentEvent;
use crate::idempotency::{Admission, EventOutcome, IdempotencyStore};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a webhook timestamp before it is rejected as a replay.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;
/// Allowed clock skew for timestamps from the future.
const FUTURE_SKEW_TOLERANCE_SECS: i64 = 60;

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// First delivery, dispatched, side effects applied.
    Processed,
    /// Duplicate delivery; acknowledged with no side effects.
    Skipped,
    /// First delivery, but the handler failed. Recorded for replay; the
    /// caller surfaces a 500 so the provider may redeliver.
    Failed(String),
}

/// Webhook receiver and verifier.
#[derive(Clone)]
pub struct WebhookHandler {
    signing_secret: String,
    gate: Arc<dyn IdempotencyStore>,
    dispatcher: EventDispatcher,
}

impl WebhookHandler {
    pub fn new(
        signing_secret: String,
        gate: Arc<dyn IdempotencyStore>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            signing_secret,
            gate,
            dispatcher,
        }
    }

    /// Verify the signature header against the raw body and parse the event.
    ///
    /// `MissingSignature` (no header at all) and `MalformedEvent` map to
    /// 400 at the edge; `SignatureInvalid` maps to 401.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> BillingResult<PaymentEvent> {
        let signature = signature.ok_or(BillingError::MissingSignature)?;
        self.verify_signature(body, signature, OffsetDateTime::now_utc().unix_timestamp())?;
        PaymentEvent::parse(body)
    }

    fn verify_signature(&self, body: &[u8], signature: &str, now: i64) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut v1: Option<&str> = None;

        for part in signature.split(',') {
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = t.trim().parse().ok();
            } else if let Some(s) = part.strip_prefix("v1=") {
                v1 = Some(s.trim());
            }
        }

        let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
        let v1 = v1.ok_or(BillingError::SignatureInvalid)?;

        let age = now - timestamp;
        if age > TIMESTAMP_TOLERANCE_SECS || age < -FUTURE_SKEW_TOLERANCE_SECS {
            tracing::warn!(age, "Webhook timestamp outside tolerance");
            return Err(BillingError::SignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        if expected.as_bytes().ct_eq(v1.as_bytes()).into() {
            Ok(())
        } else {
            tracing::warn!("Webhook signature mismatch");
            Err(BillingError::SignatureInvalid)
        }
    }

    /// Run a verified event through the gate and the dispatcher.
    ///
    /// Exactly-once side effects under at-least-once delivery: only the
    /// delivery that wins the gate's claim reaches the dispatcher.
    pub async fn process(&self, event: PaymentEvent) -> BillingResult<WebhookOutcome> {
        match self.gate.admit(&event).await? {
            Admission::AlreadyProcessed { outcome } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.kind.type_name(),
                    outcome = ?outcome,
                    "Duplicate payment event, acknowledging without dispatch"
                );
                return Ok(WebhookOutcome::Skipped);
            }
            Admission::New => {}
        }

        // Intentionally ignored types still get a success outcome so the
        // provider stops redelivering them.
        if event.kind.is_unknown() {
            self.gate
                .record_outcome(&event.id, &EventOutcome::Success)
                .await?;
            return Ok(WebhookOutcome::Processed);
        }

        self.dispatch_and_record(&event).await
    }

    async fn dispatch_and_record(&self, event: &PaymentEvent) -> BillingResult<WebhookOutcome> {
        let result = self.dispatcher.dispatch(event).await;
        let outcome = match &result {
            Ok(()) => EventOutcome::Success,
            Err(e) => EventOutcome::Failure(e.to_string()),
        };

        // A crash before this point leaves outcome NULL; operators can spot
        // those rows via processed_at IS NULL and replay by hand.
        self.gate.record_outcome(&event.id, &outcome).await?;

        match result {
            Ok(()) => Ok(WebhookOutcome::Processed),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.kind.type_name(),
                    error = %e,
                    "Payment event handler failed; recorded for replay"
                );
                Ok(WebhookOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Re-dispatch a stored event whose recorded outcome is `failure`.
    ///
    /// Successful events are never re-run; that would double their side
    /// effects.
    pub async fn replay(&self, event_id: &str) -> BillingResult<WebhookOutcome> {
        let stored = self
            .gate
            .fetch(event_id)
            .await?
            .ok_or_else(|| BillingError::EventNotFound(event_id.to_string()))?;

        if stored.outcome.as_deref() != Some("failure") {
            return Err(BillingError::EventNotFailed(event_id.to_string()));
        }

        let event = rebuild_event(&stored.payload)?;
        tracing::info!(event_id = %event.id, "Replaying failed payment event");
        self.dispatch_and_record(&event).await
    }
}

fn rebuild_event(payload: &Value) -> BillingResult<PaymentEvent> {
    let body = serde_json::to_vec(payload)?;
    PaymentEvent::parse(&body)
}
