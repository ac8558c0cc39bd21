//! Payment event envelope and the closed event-type union.
//!
//! The provider posts a JSON envelope `{id, type, created, data: {object}}`.
//! Recognized types parse into typed payloads up front, so the dispatcher
//! never digs through untyped JSON; everything else becomes
//! [`EventKind::Unknown`] and is accepted without side effects.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// A verified, parsed payment-provider event. Immutable after receipt.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    /// The provider's event id, our idempotency key.
    pub id: String,
    pub kind: EventKind,
    /// The raw envelope, persisted for audit and manual replay.
    pub raw: Value,
    pub received_at: OffsetDateTime,
}

/// Closed union over the event types this system reacts to.
#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutCompleted),
    PaymentSucceeded(PaymentOutcome),
    PaymentFailed(PaymentOutcome),
    SubscriptionCreated(SubscriptionCreated),
    /// Any type we don't handle. Accepted and acknowledged so the provider
    /// does not retry forever, but never dispatched.
    Unknown(String),
}

impl EventKind {
    /// The provider's wire name for this event type.
    pub fn type_name(&self) -> &str {
        match self {
            EventKind::CheckoutCompleted(_) => "checkout_completed",
            EventKind::PaymentSucceeded(_) => "payment_succeeded",
            EventKind::PaymentFailed(_) => "payment_failed",
            EventKind::SubscriptionCreated(_) => "subscription_created",
            EventKind::Unknown(name) => name,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, EventKind::Unknown(_))
    }
}

/// A completed checkout: the one event that grants credits.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutCompleted {
    /// Provider payment id, recorded as the ledger entry reference.
    #[serde(alias = "payment_intent")]
    pub payment_id: String,
    /// Provider customer reference, resolved to an account.
    #[serde(alias = "customer")]
    pub customer_id: String,
    /// Gross amount paid, in cents.
    pub amount_total: i64,
}

/// Audit payload shared by `payment_succeeded` and `payment_failed`.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentOutcome {
    #[serde(alias = "amount")]
    pub amount_cents: i64,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionCreated {
    #[serde(alias = "id")]
    pub subscription_id: String,
    #[serde(alias = "customer")]
    pub customer_id: String,
    pub status: String,
    /// Unix timestamp of the period end, when the provider sends one.
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

impl PaymentEvent {
    /// Parse a raw (already signature-verified) webhook body.
    ///
    /// A body that is not a well-formed envelope is `MalformedEvent`; so is
    /// a recognized type whose payload is missing required fields. Unknown
    /// types never fail on payload shape.
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| BillingError::MalformedEvent(format!("invalid JSON: {e}")))?;
        let envelope: Envelope = serde_json::from_value(raw.clone())
            .map_err(|e| BillingError::MalformedEvent(format!("invalid envelope: {e}")))?;

        if envelope.id.is_empty() {
            return Err(BillingError::MalformedEvent("empty event id".into()));
        }

        let object = envelope.data.object;
        let kind = match envelope.event_type.as_str() {
            "checkout_completed" => EventKind::CheckoutCompleted(
                serde_json::from_value(object).map_err(|e| {
                    BillingError::MalformedEvent(format!("checkout_completed: {e}"))
                })?,
            ),
            "payment_succeeded" => EventKind::PaymentSucceeded(
                serde_json::from_value(object).map_err(|e| {
                    BillingError::MalformedEvent(format!("payment_succeeded: {e}"))
                })?,
            ),
            "payment_failed" => EventKind::PaymentFailed(
                serde_json::from_value(object)
                    .map_err(|e| BillingError::MalformedEvent(format!("payment_failed: {e}")))?,
            ),
            "subscription_created" => EventKind::SubscriptionCreated(
                serde_json::from_value(object).map_err(|e| {
                    BillingError::MalformedEvent(format!("subscription_created: {e}"))
                })?,
            ),
            other => EventKind::Unknown(other.to_string()),
        };

        Ok(PaymentEvent {
            id: envelope.id,
            kind,
            raw,
            received_at: OffsetDateTime::now_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event_type: &str, object: Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object },
        }))
        .unwrap()
    }

    #[test]
    fn parses_checkout_completed() {
        let body = envelope(
            "checkout_completed",
            serde_json::json!({
                "payment_id": "pay_9",
                "customer_id": "cus_7",
                "amount_total": 999,
            }),
        );
        let event = PaymentEvent::parse(&body).unwrap();
        assert_eq!(event.id, "evt_1");
        match event.kind {
            EventKind::CheckoutCompleted(c) => {
                assert_eq!(c.payment_id, "pay_9");
                assert_eq!(c.customer_id, "cus_7");
                assert_eq!(c.amount_total, 999);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn parses_provider_field_aliases() {
        let body = envelope(
            "checkout_completed",
            serde_json::json!({
                "payment_intent": "pi_1",
                "customer": "cus_2",
                "amount_total": 499,
            }),
        );
        let event = PaymentEvent::parse(&body).unwrap();
        assert!(matches!(event.kind, EventKind::CheckoutCompleted(_)));
    }

    #[test]
    fn unknown_type_is_accepted_without_payload_validation() {
        let body = envelope("invoice.finalized", serde_json::json!({}));
        let event = PaymentEvent::parse(&body).unwrap();
        match event.kind {
            EventKind::Unknown(name) => assert_eq!(name, "invoice.finalized"),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn known_type_with_missing_fields_is_malformed() {
        let body = envelope("checkout_completed", serde_json::json!({ "customer": "c" }));
        let err = PaymentEvent::parse(&body).unwrap_err();
        assert!(matches!(err, BillingError::MalformedEvent(_)));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let err = PaymentEvent::parse(b"not json").unwrap_err();
        assert!(matches!(err, BillingError::MalformedEvent(_)));
    }
}
