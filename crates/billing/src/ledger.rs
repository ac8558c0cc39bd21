//! The credit ledger: append-only entries plus the materialized balance.
//!
//! Every credit or debit is one atomic unit against the backing store: the
//! balance row is locked, the bucket arithmetic applied, and exactly one
//! ledger entry inserted, all inside a single transaction. Callers never
//! read-then-write, so concurrent webhook credits and usage debits for the
//! same account cannot lose updates.
//!
//! Bucket policy: purchases and admin adjustments land in `paid_credits`,
//! bonuses in `bonus_credits`; debits consume bonus before paid. Neither
//! bucket may go negative, and an insufficient debit fails with nothing
//! written.

use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Signed movement categories. The wire/storage names are lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Purchase,
    Usage,
    Bonus,
    AdminAdjustment,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Purchase => "purchase",
            EntryKind::Usage => "usage",
            EntryKind::Bonus => "bonus",
            EntryKind::AdminAdjustment => "admin_adjustment",
        }
    }

    /// Which bucket a credit of this kind lands in.
    fn credits_bonus_bucket(&self) -> bool {
        matches!(self, EntryKind::Bonus)
    }
}

/// Materialized balance for one account. Both buckets are always >= 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub account_id: Uuid,
    pub paid_credits: i64,
    pub bonus_credits: i64,
}

impl Balance {
    pub fn zero(account_id: Uuid) -> Self {
        Self {
            account_id,
            paid_credits: 0,
            bonus_credits: 0,
        }
    }

    pub fn total(&self) -> i64 {
        self.paid_credits + self.bonus_credits
    }
}

/// One appended ledger row. Never mutated or deleted.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: Uuid,
    /// Positive for credits, negative for debits.
    pub amount: i64,
    pub kind: String,
    pub reference: Option<String>,
    pub description: String,
    pub created_at: OffsetDateTime,
}

/// Persistence seam for the ledger. Implementations own the atomicity of
/// credit/debit; nothing else in the system writes balances or entries.
pub trait LedgerStore: Send + Sync {
    fn credit<'a>(
        &'a self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        reference: Option<&'a str>,
        description: &'a str,
    ) -> BoxFuture<'a, BillingResult<Balance>>;

    fn debit<'a>(
        &'a self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &'a str,
    ) -> BoxFuture<'a, BillingResult<Balance>>;

    fn balance(&self, account_id: Uuid) -> BoxFuture<'_, BillingResult<Balance>>;

    fn entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BoxFuture<'_, BillingResult<Vec<LedgerEntry>>>;
}

/// The ledger facade: validates amounts, then delegates to the store.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Grant `amount` credits. Amount must be strictly positive.
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        reference: Option<&str>,
        description: &str,
    ) -> BillingResult<Balance> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(amount));
        }
        let balance = self
            .store
            .credit(account_id, amount, kind, reference, description)
            .await?;
        tracing::info!(
            account_id = %account_id,
            amount,
            kind = kind.as_str(),
            reference = ?reference,
            new_total = balance.total(),
            "Credits granted"
        );
        Ok(balance)
    }

    /// Consume `amount` credits, bonus bucket first. Fails with
    /// `InsufficientCredits` and no mutation when the total is short.
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &str,
    ) -> BillingResult<Balance> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(amount));
        }
        let balance = self.store.debit(account_id, amount, kind, description).await?;
        tracing::info!(
            account_id = %account_id,
            amount,
            kind = kind.as_str(),
            new_total = balance.total(),
            "Credits consumed"
        );
        Ok(balance)
    }

    pub async fn balance(&self, account_id: Uuid) -> BillingResult<Balance> {
        self.store.balance(account_id).await
    }

    pub async fn entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<LedgerEntry>> {
        self.store.entries(account_id, limit).await
    }
}

/// Splits a debit across the two buckets, bonus first.
///
/// Returns the new (paid, bonus) pair, or the available total on shortfall.
fn apply_debit(paid: i64, bonus: i64, amount: i64) -> Result<(i64, i64), i64> {
    if paid + bonus < amount {
        return Err(paid + bonus);
    }
    let from_bonus = amount.min(bonus);
    Ok((paid - (amount - from_bonus), bonus - from_bonus))
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    paid_credits: i64,
    bonus_credits: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: i64,
    account_id: Uuid,
    amount: i64,
    kind: String,
    reference: Option<String>,
    description: String,
    created_at: OffsetDateTime,
}

impl From<EntryRow> for LedgerEntry {
    fn from(row: EntryRow) -> Self {
        LedgerEntry {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            kind: row.kind,
            reference: row.reference,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

/// Postgres-backed ledger store.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock (creating if absent) the balance row inside `tx`.
    async fn lock_balance(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        account_id: Uuid,
    ) -> BillingResult<BalanceRow> {
        sqlx::query("INSERT INTO account_balances (account_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(account_id)
            .execute(&mut **tx)
            .await?;

        let row: BalanceRow = sqlx::query_as(
            "SELECT paid_credits, bonus_credits FROM account_balances WHERE account_id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn write_and_commit(
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        account_id: Uuid,
        paid: i64,
        bonus: i64,
        amount: i64,
        kind: EntryKind,
        reference: Option<&str>,
        description: &str,
    ) -> BillingResult<Balance> {
        sqlx::query(
            r#"
            UPDATE account_balances
            SET paid_credits = $2, bonus_credits = $3, updated_at = NOW()
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(paid)
        .bind(bonus)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (account_id, amount, kind, reference, description)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .bind(kind.as_str())
        .bind(reference)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Balance {
            account_id,
            paid_credits: paid,
            bonus_credits: bonus,
        })
    }
}

impl LedgerStore for PgLedgerStore {
    fn credit<'a>(
        &'a self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        reference: Option<&'a str>,
        description: &'a str,
    ) -> BoxFuture<'a, BillingResult<Balance>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let row = Self::lock_balance(&mut tx, account_id).await?;
            let (paid, bonus) = if kind.credits_bonus_bucket() {
                (row.paid_credits, row.bonus_credits + amount)
            } else {
                (row.paid_credits + amount, row.bonus_credits)
            };
            Self::write_and_commit(tx, account_id, paid, bonus, amount, kind, reference, description)
                .await
        })
    }

    fn debit<'a>(
        &'a self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &'a str,
    ) -> BoxFuture<'a, BillingResult<Balance>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let row = Self::lock_balance(&mut tx, account_id).await?;
            let (paid, bonus) =
                apply_debit(row.paid_credits, row.bonus_credits, amount).map_err(|available| {
                    BillingError::InsufficientCredits {
                        available,
                        requested: amount,
                    }
                })?;
            // The transaction drops (and rolls back) on the error path above.
            Self::write_and_commit(tx, account_id, paid, bonus, -amount, kind, None, description)
                .await
        })
    }

    fn balance(&self, account_id: Uuid) -> BoxFuture<'_, BillingResult<Balance>> {
        Box::pin(async move {
            let row: Option<BalanceRow> = sqlx::query_as(
                "SELECT paid_credits, bonus_credits FROM account_balances WHERE account_id = $1",
            )
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

            Ok(match row {
                Some(row) => Balance {
                    account_id,
                    paid_credits: row.paid_credits,
                    bonus_credits: row.bonus_credits,
                },
                None => Balance::zero(account_id),
            })
        })
    }

    fn entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BoxFuture<'_, BillingResult<Vec<LedgerEntry>>> {
        Box::pin(async move {
            let rows: Vec<EntryRow> = sqlx::query_as(
                r#"
                SELECT id, account_id, amount, kind, reference, description, created_at
                FROM ledger_entries
                WHERE account_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
                "#,
            )
            .bind(account_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(LedgerEntry::from).collect())
        })
    }
}

#[derive(Debug, Default)]
struct InMemoryAccount {
    paid_credits: i64,
    bonus_credits: i64,
    entries: Vec<LedgerEntry>,
}

/// In-memory ledger store with the same atomicity (one mutex acquisition
/// per operation) for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    accounts: Arc<Mutex<HashMap<Uuid, InMemoryAccount>>>,
    next_id: Arc<Mutex<i64>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, InMemoryAccount>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> i64 {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }

    fn append(
        &self,
        account: &mut InMemoryAccount,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        reference: Option<&str>,
        description: &str,
    ) {
        account.entries.push(LedgerEntry {
            id: self.allocate_id(),
            account_id,
            amount,
            kind: kind.as_str().to_string(),
            reference: reference.map(str::to_string),
            description: description.to_string(),
            created_at: OffsetDateTime::now_utc(),
        });
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn credit<'a>(
        &'a self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        reference: Option<&'a str>,
        description: &'a str,
    ) -> BoxFuture<'a, BillingResult<Balance>> {
        Box::pin(async move {
            let mut accounts = self.lock();
            let account = accounts.entry(account_id).or_default();
            if kind.credits_bonus_bucket() {
                account.bonus_credits += amount;
            } else {
                account.paid_credits += amount;
            }
            let (paid, bonus) = (account.paid_credits, account.bonus_credits);
            self.append(account, account_id, amount, kind, reference, description);
            Ok(Balance {
                account_id,
                paid_credits: paid,
                bonus_credits: bonus,
            })
        })
    }

    fn debit<'a>(
        &'a self,
        account_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &'a str,
    ) -> BoxFuture<'a, BillingResult<Balance>> {
        Box::pin(async move {
            let mut accounts = self.lock();
            let account = accounts.entry(account_id).or_default();
            let (paid, bonus) = apply_debit(account.paid_credits, account.bonus_credits, amount)
                .map_err(|available| BillingError::InsufficientCredits {
                    available,
                    requested: amount,
                })?;
            account.paid_credits = paid;
            account.bonus_credits = bonus;
            self.append(account, account_id, -amount, kind, None, description);
            Ok(Balance {
                account_id,
                paid_credits: paid,
                bonus_credits: bonus,
            })
        })
    }

    fn balance(&self, account_id: Uuid) -> BoxFuture<'_, BillingResult<Balance>> {
        Box::pin(async move {
            let accounts = self.lock();
            Ok(accounts
                .get(&account_id)
                .map(|a| Balance {
                    account_id,
                    paid_credits: a.paid_credits,
                    bonus_credits: a.bonus_credits,
                })
                .unwrap_or_else(|| Balance::zero(account_id)))
        })
    }

    fn entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BoxFuture<'_, BillingResult<Vec<LedgerEntry>>> {
        Box::pin(async move {
            let accounts = self.lock();
            Ok(accounts
                .get(&account_id)
                .map(|a| {
                    a.entries
                        .iter()
                        .rev()
                        .take(limit.max(0) as usize)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(InMemoryLedgerStore::new()))
    }

    #[tokio::test]
    async fn credit_then_balance() {
        let ledger = ledger();
        let account = Uuid::new_v4();

        let balance = ledger
            .credit(account, 25, EntryKind::Purchase, Some("pay_1"), "portrait pack")
            .await
            .unwrap();
        assert_eq!(balance.paid_credits, 25);
        assert_eq!(balance.bonus_credits, 0);
        assert_eq!(ledger.balance(account).await.unwrap().total(), 25);
    }

    #[tokio::test]
    async fn debit_consumes_bonus_before_paid() {
        let ledger = ledger();
        let account = Uuid::new_v4();
        ledger
            .credit(account, 10, EntryKind::Purchase, None, "purchase")
            .await
            .unwrap();
        ledger
            .credit(account, 5, EntryKind::Bonus, None, "signup bonus")
            .await
            .unwrap();

        let balance = ledger
            .debit(account, 7, EntryKind::Usage, "generation")
            .await
            .unwrap();
        assert_eq!(balance.bonus_credits, 0, "bonus drains first");
        assert_eq!(balance.paid_credits, 8);
    }

    #[tokio::test]
    async fn insufficient_debit_leaves_state_untouched() {
        let ledger = ledger();
        let account = Uuid::new_v4();
        ledger
            .credit(account, 3, EntryKind::Purchase, None, "purchase")
            .await
            .unwrap();

        let err = ledger
            .debit(account, 5, EntryKind::Usage, "generation")
            .await
            .unwrap_err();
        match err {
            BillingError::InsufficientCredits { available, requested } => {
                assert_eq!(available, 3);
                assert_eq!(requested, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(ledger.balance(account).await.unwrap().total(), 3);
        assert_eq!(ledger.entries(account, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let ledger = ledger();
        let account = Uuid::new_v4();
        assert!(matches!(
            ledger
                .credit(account, 0, EntryKind::Purchase, None, "")
                .await
                .unwrap_err(),
            BillingError::InvalidAmount(0)
        ));
        assert!(matches!(
            ledger
                .debit(account, -2, EntryKind::Usage, "")
                .await
                .unwrap_err(),
            BillingError::InvalidAmount(-2)
        ));
    }

    #[tokio::test]
    async fn balance_equals_sum_of_entries() {
        let ledger = ledger();
        let account = Uuid::new_v4();
        ledger
            .credit(account, 75, EntryKind::Purchase, Some("pay_2"), "pack")
            .await
            .unwrap();
        ledger
            .credit(account, 10, EntryKind::Bonus, None, "promo")
            .await
            .unwrap();
        ledger
            .debit(account, 30, EntryKind::Usage, "generations")
            .await
            .unwrap();

        let entries = ledger.entries(account, 100).await.unwrap();
        let sum: i64 = entries.iter().map(|e| e.amount).sum();
        assert_eq!(sum, ledger.balance(account).await.unwrap().total());
        assert_eq!(sum, 55);
    }

    #[tokio::test]
    async fn concurrent_credits_all_land() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let ledger = Arc::new(ledger());
        let account = Uuid::new_v4();
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .credit(account, 1, EntryKind::Purchase, None, "unit")
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.balance(account).await.unwrap().total(), 10);
        assert_eq!(ledger.entries(account, 100).await.unwrap().len(), 10);
    }
}
