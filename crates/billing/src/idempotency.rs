//! The idempotency gate: exactly-once side effects under at-least-once
//! delivery.
//!
//! The claim is an atomic `INSERT ... ON CONFLICT DO NOTHING RETURNING`; the
//! conflict on a concurrent duplicate is the dedup signal, never a prior
//! read. Between a successful claim and `record_outcome` the row's outcome
//! is NULL; a crash in that window leaves the event visible to operators as
//! `processed_at IS NULL`.

use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::PaymentEvent;

/// Result of asking the gate whether an event is new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First delivery; the caller holds exclusive dispatch rights.
    New,
    /// Seen before. `outcome` is None when a previous claimant has not
    /// recorded a result yet (in flight, or crashed mid-dispatch).
    AlreadyProcessed { outcome: Option<EventOutcome> },
}

/// Recorded dispatch result for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Success,
    Failure(String),
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Success => "success",
            EventOutcome::Failure(_) => "failure",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            EventOutcome::Success => None,
            EventOutcome::Failure(msg) => Some(msg),
        }
    }
}

/// A stored idempotency record, as needed for audit and replay.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub outcome: Option<String>,
    pub error: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
}

/// Persistence seam for the gate. Object-safe so services can hold
/// `Arc<dyn IdempotencyStore>` and tests can swap in the in-memory fake.
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim the event id. Returns `New` exactly once per id
    /// across all concurrent callers.
    fn admit<'a>(&'a self, event: &'a PaymentEvent) -> BoxFuture<'a, BillingResult<Admission>>;

    /// Record the dispatch outcome after the claim.
    fn record_outcome<'a>(
        &'a self,
        event_id: &'a str,
        outcome: &'a EventOutcome,
    ) -> BoxFuture<'a, BillingResult<()>>;

    /// Fetch the stored record for replay or inspection.
    fn fetch<'a>(&'a self, event_id: &'a str)
        -> BoxFuture<'a, BillingResult<Option<StoredEvent>>>;
}

fn outcome_from_row(outcome: Option<&str>, error: Option<&str>) -> Option<EventOutcome> {
    match outcome {
        Some("success") => Some(EventOutcome::Success),
        Some("failure") => Some(EventOutcome::Failure(
            error.unwrap_or("unrecorded error").to_string(),
        )),
        _ => None,
    }
}

/// Postgres-backed gate; the `payment_idempotency` primary key is the
/// arbiter.
#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl IdempotencyStore for PgIdempotencyStore {
    fn admit<'a>(&'a self, event: &'a PaymentEvent) -> BoxFuture<'a, BillingResult<Admission>> {
        Box::pin(async move {
            let claimed: Option<(String,)> = sqlx::query_as(
                r#"
                INSERT INTO payment_idempotency (event_id, event_type, payload)
                VALUES ($1, $2, $3)
                ON CONFLICT (event_id) DO NOTHING
                RETURNING event_id
                "#,
            )
            .bind(&event.id)
            .bind(event.kind.type_name())
            .bind(&event.raw)
            .fetch_optional(&self.pool)
            .await?;

            if claimed.is_some() {
                return Ok(Admission::New);
            }

            // Lost the claim: report what the winner recorded, if anything.
            let existing: Option<(Option<String>, Option<String>)> = sqlx::query_as(
                "SELECT outcome, error FROM payment_idempotency WHERE event_id = $1",
            )
            .bind(&event.id)
            .fetch_optional(&self.pool)
            .await?;

            let outcome = existing
                .and_then(|(o, e)| outcome_from_row(o.as_deref(), e.as_deref()));
            Ok(Admission::AlreadyProcessed { outcome })
        })
    }

    fn record_outcome<'a>(
        &'a self,
        event_id: &'a str,
        outcome: &'a EventOutcome,
    ) -> BoxFuture<'a, BillingResult<()>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE payment_idempotency
                SET outcome = $2, error = $3, processed_at = NOW()
                WHERE event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(outcome.as_str())
            .bind(outcome.error())
            .execute(&self.pool)
            .await?;
            // An outcome without a prior claim row is a caller bug; do not
            // swallow it as a no-op.
            if result.rows_affected() == 0 {
                return Err(BillingError::EventNotFound(event_id.to_string()));
            }
            Ok(())
        })
    }

    fn fetch<'a>(
        &'a self,
        event_id: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<StoredEvent>>> {
        Box::pin(async move {
            let row: Option<(String, String, Value, Option<String>, Option<String>, Option<OffsetDateTime>)> =
                sqlx::query_as(
                    r#"
                    SELECT event_id, event_type, payload, outcome, error, processed_at
                    FROM payment_idempotency
                    WHERE event_id = $1
                    "#,
                )
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

            Ok(row.map(
                |(event_id, event_type, payload, outcome, error, processed_at)| StoredEvent {
                    event_id,
                    event_type,
                    payload,
                    outcome,
                    error,
                    processed_at,
                },
            ))
        })
    }
}

/// In-memory gate with the same first-writer-wins semantics, for tests and
/// single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, StoredEvent>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredEvent>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn admit<'a>(&'a self, event: &'a PaymentEvent) -> BoxFuture<'a, BillingResult<Admission>> {
        Box::pin(async move {
            let mut records = self.lock();
            if let Some(existing) = records.get(&event.id) {
                let outcome =
                    outcome_from_row(existing.outcome.as_deref(), existing.error.as_deref());
                return Ok(Admission::AlreadyProcessed { outcome });
            }
            records.insert(
                event.id.clone(),
                StoredEvent {
                    event_id: event.id.clone(),
                    event_type: event.kind.type_name().to_string(),
                    payload: event.raw.clone(),
                    outcome: None,
                    error: None,
                    processed_at: None,
                },
            );
            Ok(Admission::New)
        })
    }

    fn record_outcome<'a>(
        &'a self,
        event_id: &'a str,
        outcome: &'a EventOutcome,
    ) -> BoxFuture<'a, BillingResult<()>> {
        Box::pin(async move {
            let mut records = self.lock();
            let record = records
                .get_mut(event_id)
                .ok_or_else(|| BillingError::EventNotFound(event_id.to_string()))?;
            record.outcome = Some(outcome.as_str().to_string());
            record.error = outcome.error().map(str::to_string);
            record.processed_at = Some(OffsetDateTime::now_utc());
            Ok(())
        })
    }

    fn fetch<'a>(
        &'a self,
        event_id: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<StoredEvent>>> {
        Box::pin(async move { Ok(self.lock().get(event_id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn event(id: &str) -> PaymentEvent {
        PaymentEvent {
            id: id.to_string(),
            kind: EventKind::Unknown("test".into()),
            raw: serde_json::json!({"id": id}),
            received_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn first_admit_wins_second_sees_duplicate() {
        let store = InMemoryIdempotencyStore::new();
        let evt = event("evt_a");

        assert_eq!(store.admit(&evt).await.unwrap(), Admission::New);
        assert_eq!(
            store.admit(&evt).await.unwrap(),
            Admission::AlreadyProcessed { outcome: None }
        );
    }

    #[tokio::test]
    async fn duplicate_reports_recorded_outcome() {
        let store = InMemoryIdempotencyStore::new();
        let evt = event("evt_b");
        store.admit(&evt).await.unwrap();
        store
            .record_outcome("evt_b", &EventOutcome::Failure("account missing".into()))
            .await
            .unwrap();

        match store.admit(&evt).await.unwrap() {
            Admission::AlreadyProcessed {
                outcome: Some(EventOutcome::Failure(msg)),
            } => assert_eq!(msg, "account missing"),
            other => panic!("unexpected admission: {other:?}"),
        }
    }

    #[tokio::test]
    async fn outcome_without_claim_is_not_found() {
        let store = InMemoryIdempotencyStore::new();
        assert!(matches!(
            store
                .record_outcome("evt_unclaimed", &EventOutcome::Success)
                .await
                .unwrap_err(),
            BillingError::EventNotFound(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_admits_yield_exactly_one_new() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let store = Arc::new(InMemoryIdempotencyStore::new());
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];

        for _ in 0..8 {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.admit(&event("evt_race")).await.unwrap()
            }));
        }

        let mut new_count = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::New {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1, "exactly one delivery may claim the event");
    }
}
