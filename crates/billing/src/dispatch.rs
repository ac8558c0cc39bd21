//! Event dispatcher: maps a verified payment event to its handler.
//!
//! Handlers are commutative with respect to event ordering: credits key off
//! distinct event ids, audit rows only append, and subscription state is an
//! upsert, so redelivered or reordered events for the same account converge
//! to the same state.

use std::sync::Arc;
use time::OffsetDateTime;

use crate::accounts::{AccountStore, PaymentAudit, SubscriptionState};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutCompleted, EventKind, PaymentEvent, PaymentOutcome, SubscriptionCreated,
};
use crate::ledger::{EntryKind, Ledger};

/// Paid amount (cents) to credits granted. The 250/500/1250 rows are the
/// half-price promotional amounts for the same pack sizes.
const CREDIT_TABLE: &[(i64, i64)] = &[
    (499, 10),
    (999, 25),
    (2499, 75),
    (250, 10),
    (500, 25),
    (1250, 75),
];

/// Fallback rate for amounts outside the table.
const FALLBACK_CENTS_PER_CREDIT: i64 = 50;

/// Credits granted for a paid amount in cents.
pub fn credits_for_amount(amount_cents: i64) -> i64 {
    CREDIT_TABLE
        .iter()
        .find(|(cents, _)| *cents == amount_cents)
        .map(|(_, credits)| *credits)
        .unwrap_or(amount_cents / FALLBACK_CENTS_PER_CREDIT)
}

/// Routes verified events to their handlers.
#[derive(Clone)]
pub struct EventDispatcher {
    ledger: Ledger,
    accounts: Arc<dyn AccountStore>,
}

impl EventDispatcher {
    pub fn new(ledger: Ledger, accounts: Arc<dyn AccountStore>) -> Self {
        Self { ledger, accounts }
    }

    /// Dispatch one event. Handler failures come back as `Err` for the
    /// gate to record; nothing here retries.
    pub async fn dispatch(&self, event: &PaymentEvent) -> BillingResult<()> {
        match &event.kind {
            EventKind::CheckoutCompleted(checkout) => {
                self.handle_checkout_completed(&event.id, checkout).await
            }
            EventKind::PaymentSucceeded(outcome) => {
                self.handle_payment_outcome(&event.id, "succeeded", outcome)
                    .await
            }
            EventKind::PaymentFailed(outcome) => {
                self.handle_payment_outcome(&event.id, "failed", outcome)
                    .await
            }
            EventKind::SubscriptionCreated(sub) => {
                self.handle_subscription_created(&event.id, sub).await
            }
            EventKind::Unknown(name) => {
                // Tracked so new provider event types surface in logs.
                tracing::info!(
                    event_id = %event.id,
                    event_type = %name,
                    "Ignoring unhandled payment event type"
                );
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event_id: &str,
        checkout: &CheckoutCompleted,
    ) -> BillingResult<()> {
        let account_id = self
            .accounts
            .resolve_customer(&checkout.customer_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(checkout.customer_id.clone()))?;

        let credits = credits_for_amount(checkout.amount_total);
        if credits <= 0 {
            return Err(BillingError::InvalidAmount(checkout.amount_total));
        }

        let description = format!("credit purchase ({} cents)", checkout.amount_total);
        let balance = self
            .ledger
            .credit(
                account_id,
                credits,
                EntryKind::Purchase,
                Some(&checkout.payment_id),
                &description,
            )
            .await?;

        tracing::info!(
            event_id = %event_id,
            account_id = %account_id,
            amount_cents = checkout.amount_total,
            credits,
            new_total = balance.total(),
            "Checkout completed, credits granted"
        );
        Ok(())
    }

    async fn handle_payment_outcome(
        &self,
        event_id: &str,
        status: &str,
        outcome: &PaymentOutcome,
    ) -> BillingResult<()> {
        self.accounts
            .append_payment_audit(&PaymentAudit {
                event_id: event_id.to_string(),
                amount_cents: outcome.amount_cents,
                status: status.to_string(),
                failure_code: outcome.failure_code.clone(),
                failure_message: outcome.failure_message.clone(),
            })
            .await?;

        tracing::debug!(
            event_id = %event_id,
            status = %status,
            amount_cents = outcome.amount_cents,
            "Payment outcome recorded"
        );
        Ok(())
    }

    async fn handle_subscription_created(
        &self,
        event_id: &str,
        sub: &SubscriptionCreated,
    ) -> BillingResult<()> {
        let account_id = self
            .accounts
            .resolve_customer(&sub.customer_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(sub.customer_id.clone()))?;

        let current_period_end = sub
            .current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        self.accounts
            .upsert_subscription(&SubscriptionState {
                account_id,
                provider_subscription_id: sub.subscription_id.clone(),
                status: sub.status.clone(),
                current_period_end,
            })
            .await?;

        tracing::info!(
            event_id = %event_id,
            account_id = %account_id,
            subscription_id = %sub.subscription_id,
            status = %sub.status,
            "Subscription recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::InMemoryAccountStore;
    use crate::ledger::InMemoryLedgerStore;
    use uuid::Uuid;

    fn dispatcher() -> (EventDispatcher, Ledger, InMemoryAccountStore) {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()));
        let accounts = InMemoryAccountStore::new();
        let dispatcher = EventDispatcher::new(ledger.clone(), Arc::new(accounts.clone()));
        (dispatcher, ledger, accounts)
    }

    fn checkout_event(id: &str, customer: &str, amount: i64) -> PaymentEvent {
        PaymentEvent {
            id: id.to_string(),
            kind: EventKind::CheckoutCompleted(CheckoutCompleted {
                payment_id: format!("pay_{id}"),
                customer_id: customer.to_string(),
                amount_total: amount,
            }),
            raw: serde_json::json!({}),
            received_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn credit_mapping_table_and_fallback() {
        for (cents, expected) in [
            (499, 10),
            (999, 25),
            (2499, 75),
            (250, 10),
            (500, 25),
            (1250, 75),
        ] {
            assert_eq!(credits_for_amount(cents), expected, "{cents} cents");
        }
        // floor(1000 / 50)
        assert_eq!(credits_for_amount(1000), 20);
        assert_eq!(credits_for_amount(49), 0);
    }

    #[tokio::test]
    async fn checkout_grants_mapped_credits() {
        let (dispatcher, ledger, accounts) = dispatcher();
        let account = Uuid::new_v4();
        accounts.link_customer("cus_1", account);

        dispatcher
            .dispatch(&checkout_event("evt_1", "cus_1", 999))
            .await
            .unwrap();

        let balance = ledger.balance(account).await.unwrap();
        assert_eq!(balance.paid_credits, 25);

        let entries = ledger.entries(account, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "purchase");
        assert_eq!(entries[0].reference.as_deref(), Some("pay_evt_1"));
    }

    #[tokio::test]
    async fn unknown_customer_fails_without_credit() {
        let (dispatcher, _, _) = dispatcher();
        let err = dispatcher
            .dispatch(&checkout_event("evt_2", "cus_missing", 499))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn payment_failed_appends_audit_only() {
        let (dispatcher, _, accounts) = dispatcher();
        let event = PaymentEvent {
            id: "evt_3".into(),
            kind: EventKind::PaymentFailed(PaymentOutcome {
                amount_cents: 999,
                failure_code: Some("card_declined".into()),
                failure_message: Some("Your card was declined.".into()),
            }),
            raw: serde_json::json!({}),
            received_at: OffsetDateTime::now_utc(),
        };
        dispatcher.dispatch(&event).await.unwrap();

        let audits = accounts.audits();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, "failed");
        assert_eq!(audits[0].failure_code.as_deref(), Some("card_declined"));
    }

    #[tokio::test]
    async fn subscription_created_upserts() {
        let (dispatcher, _, accounts) = dispatcher();
        let account = Uuid::new_v4();
        accounts.link_customer("cus_9", account);

        let event = PaymentEvent {
            id: "evt_4".into(),
            kind: EventKind::SubscriptionCreated(SubscriptionCreated {
                subscription_id: "sub_1".into(),
                customer_id: "cus_9".into(),
                status: "active".into(),
                current_period_end: Some(1_760_000_000),
            }),
            raw: serde_json::json!({}),
            received_at: OffsetDateTime::now_utc(),
        };
        dispatcher.dispatch(&event).await.unwrap();
        // Redelivery converges instead of erroring.
        dispatcher.dispatch(&event).await.unwrap();

        let sub = accounts.subscription("sub_1").unwrap();
        assert_eq!(sub.account_id, account);
        assert_eq!(sub.status, "active");
    }
}
