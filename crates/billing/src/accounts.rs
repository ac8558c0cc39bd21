//! Account directory plus the dispatcher's side tables.
//!
//! Accounts themselves are created by the auth provider, out of scope here.
//! This module only resolves provider customer references and API key
//! hashes back to account ids, appends audit-only payment rows, and upserts
//! subscription state.

use futures::future::BoxFuture;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Audit row for a `payment_succeeded` / `payment_failed` notification.
/// Never touches balances.
#[derive(Debug, Clone)]
pub struct PaymentAudit {
    pub event_id: String,
    pub amount_cents: i64,
    pub status: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

/// Subscription state as reported by the payment provider.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub account_id: Uuid,
    pub provider_subscription_id: String,
    pub status: String,
    pub current_period_end: Option<OffsetDateTime>,
}

pub trait AccountStore: Send + Sync {
    /// Resolve a provider customer reference to an account id.
    fn resolve_customer<'a>(
        &'a self,
        customer_id: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<Uuid>>>;

    /// Resolve a hashed API key to an account id.
    fn resolve_api_key_hash<'a>(
        &'a self,
        key_hash: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<Uuid>>>;

    fn append_payment_audit<'a>(
        &'a self,
        audit: &'a PaymentAudit,
    ) -> BoxFuture<'a, BillingResult<()>>;

    /// Insert or update by provider subscription id. Upserting keeps the
    /// handler idempotent under redelivery and out-of-order arrival.
    fn upsert_subscription<'a>(
        &'a self,
        sub: &'a SubscriptionState,
    ) -> BoxFuture<'a, BillingResult<()>>;
}

#[derive(Debug, Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AccountStore for PgAccountStore {
    fn resolve_customer<'a>(
        &'a self,
        customer_id: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<Uuid>>> {
        Box::pin(async move {
            let row: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM accounts WHERE provider_customer_id = $1")
                    .bind(customer_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(id,)| id))
        })
    }

    fn resolve_api_key_hash<'a>(
        &'a self,
        key_hash: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<Uuid>>> {
        Box::pin(async move {
            let row: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM accounts WHERE api_key_hash = $1")
                    .bind(key_hash)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(id,)| id))
        })
    }

    fn append_payment_audit<'a>(
        &'a self,
        audit: &'a PaymentAudit,
    ) -> BoxFuture<'a, BillingResult<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO payment_audit_log
                    (event_id, amount_cents, status, failure_code, failure_message)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&audit.event_id)
            .bind(audit.amount_cents)
            .bind(&audit.status)
            .bind(&audit.failure_code)
            .bind(&audit.failure_message)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn upsert_subscription<'a>(
        &'a self,
        sub: &'a SubscriptionState,
    ) -> BoxFuture<'a, BillingResult<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (account_id, provider_subscription_id, status, current_period_end)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (provider_subscription_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    current_period_end = EXCLUDED.current_period_end,
                    updated_at = NOW()
                "#,
            )
            .bind(sub.account_id)
            .bind(&sub.provider_subscription_id)
            .bind(&sub.status)
            .bind(sub.current_period_end)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct InMemoryAccounts {
    by_customer: HashMap<String, Uuid>,
    by_key_hash: HashMap<String, Uuid>,
    audits: Vec<PaymentAudit>,
    subscriptions: HashMap<String, SubscriptionState>,
}

/// In-memory directory for tests: seed customer links, inspect audit rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccountStore {
    inner: Arc<Mutex<InMemoryAccounts>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryAccounts> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link_customer(&self, customer_id: &str, account_id: Uuid) {
        self.lock()
            .by_customer
            .insert(customer_id.to_string(), account_id);
    }

    pub fn link_api_key_hash(&self, key_hash: &str, account_id: Uuid) {
        self.lock()
            .by_key_hash
            .insert(key_hash.to_string(), account_id);
    }

    pub fn audits(&self) -> Vec<PaymentAudit> {
        self.lock().audits.clone()
    }

    pub fn subscription(&self, provider_subscription_id: &str) -> Option<SubscriptionState> {
        self.lock()
            .subscriptions
            .get(provider_subscription_id)
            .cloned()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn resolve_customer<'a>(
        &'a self,
        customer_id: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<Uuid>>> {
        Box::pin(async move { Ok(self.lock().by_customer.get(customer_id).copied()) })
    }

    fn resolve_api_key_hash<'a>(
        &'a self,
        key_hash: &'a str,
    ) -> BoxFuture<'a, BillingResult<Option<Uuid>>> {
        Box::pin(async move { Ok(self.lock().by_key_hash.get(key_hash).copied()) })
    }

    fn append_payment_audit<'a>(
        &'a self,
        audit: &'a PaymentAudit,
    ) -> BoxFuture<'a, BillingResult<()>> {
        Box::pin(async move {
            self.lock().audits.push(audit.clone());
            Ok(())
        })
    }

    fn upsert_subscription<'a>(
        &'a self,
        sub: &'a SubscriptionState,
    ) -> BoxFuture<'a, BillingResult<()>> {
        Box::pin(async move {
            self.lock()
                .subscriptions
                .insert(sub.provider_subscription_id.clone(), sub.clone());
            Ok(())
        })
    }
}
