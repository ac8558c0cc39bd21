//! Ledger invariants.
//!
//! Runnable consistency checks for the credit and admission state. Run
//! after a webhook replay or a manual adjustment to prove the system is
//! still in a valid state.
//!
//! Each invariant is a real SQL query; checks only read, never write, and
//! violations carry enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use easel_shared::TierCaps;

/// Result of running a single invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Account(s) affected, when the invariant is account-scoped.
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - credits may be granted or consumed incorrectly.
    Critical,
    /// High - data inconsistency that needs attention.
    High,
    /// Medium - potential issue, should investigate.
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceMismatchRow {
    account_id: Uuid,
    paid_credits: i64,
    bonus_credits: i64,
    entry_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBucketRow {
    account_id: Uuid,
    paid_credits: i64,
    bonus_credits: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanPurchaseRow {
    account_id: Uuid,
    entry_id: i64,
    reference: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CounterOverCapRow {
    identifier: String,
    window_kind: String,
    count: i64,
}

/// Service for running ledger invariant checks.
pub struct LedgerInvariantChecker {
    pool: PgPool,
    caps: TierCaps,
}

impl LedgerInvariantChecker {
    pub fn new(pool: PgPool, caps: TierCaps) -> Self {
        Self { pool, caps }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_balance_matches_entries().await?);
        violations.extend(self.check_no_negative_buckets().await?);
        violations.extend(self.check_purchases_reference_processed_events().await?);
        violations.extend(self.check_counters_within_cap().await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: every balance equals the signed sum of its entries.
    ///
    /// The ledger commits both writes in one transaction, so a mismatch
    /// means a writer bypassed the ledger.
    async fn check_balance_matches_entries(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                b.account_id,
                b.paid_credits,
                b.bonus_credits,
                COALESCE(SUM(e.amount), 0) AS entry_sum
            FROM account_balances b
            LEFT JOIN ledger_entries e ON e.account_id = b.account_id
            GROUP BY b.account_id, b.paid_credits, b.bonus_credits
            HAVING b.paid_credits + b.bonus_credits != COALESCE(SUM(e.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balance_matches_entries".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Balance total {} does not equal ledger entry sum {}",
                    row.paid_credits + row.bonus_credits,
                    row.entry_sum
                ),
                context: serde_json::json!({
                    "paid_credits": row.paid_credits,
                    "bonus_credits": row.bonus_credits,
                    "entry_sum": row.entry_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: neither balance bucket is negative.
    ///
    /// The CHECK constraints should make this impossible; a hit means the
    /// constraints were dropped or bypassed.
    async fn check_no_negative_buckets(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBucketRow> = sqlx::query_as(
            r#"
            SELECT account_id, paid_credits, bonus_credits
            FROM account_balances
            WHERE paid_credits < 0 OR bonus_credits < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_negative_buckets".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Negative balance bucket: paid={}, bonus={}",
                    row.paid_credits, row.bonus_credits
                ),
                context: serde_json::json!({
                    "paid_credits": row.paid_credits,
                    "bonus_credits": row.bonus_credits,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: every purchase entry's reference maps to a
    /// successfully processed payment event.
    ///
    /// A purchase without a processed event means credits were granted
    /// outside the webhook path.
    async fn check_purchases_reference_processed_events(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanPurchaseRow> = sqlx::query_as(
            r#"
            SELECT e.account_id, e.id AS entry_id, e.reference
            FROM ledger_entries e
            WHERE e.kind = 'purchase'
              AND NOT EXISTS (
                  SELECT 1 FROM payment_idempotency p
                  WHERE p.outcome = 'success'
                    AND p.payload -> 'data' -> 'object' ->> 'payment_id' = e.reference
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "purchases_reference_processed_events".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Purchase entry {} references '{}' with no processed payment event",
                    row.entry_id,
                    row.reference.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "entry_id": row.entry_id,
                    "reference": row.reference,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: no rate-limit counter exceeds the largest configured
    /// cap for its window kind.
    async fn check_counters_within_cap(&self) -> BillingResult<Vec<InvariantViolation>> {
        let max_daily = self.caps.max_daily();
        let rows: Vec<CounterOverCapRow> = sqlx::query_as(
            "SELECT identifier, window_kind, count FROM rate_limit_counters WHERE count > $1",
        )
        .bind(max_daily)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "counters_within_cap".to_string(),
                account_ids: vec![],
                description: format!(
                    "Counter for '{}' ({} window) is {}, above the maximum cap {}",
                    row.identifier, row.window_kind, row.count, max_daily
                ),
                context: serde_json::json!({
                    "identifier": row.identifier,
                    "window_kind": row.window_kind,
                    "count": row.count,
                    "max_cap": max_daily,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "balance_matches_entries" => self.check_balance_matches_entries().await,
            "no_negative_buckets" => self.check_no_negative_buckets().await,
            "purchases_reference_processed_events" => {
                self.check_purchases_reference_processed_events().await
            }
            "counters_within_cap" => self.check_counters_within_cap().await,
            _ => Ok(vec![]),
        }
    }

    /// All available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "balance_matches_entries",
            "no_negative_buckets",
            "purchases_reference_processed_events",
            "counters_within_cap",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn available_checks_listed() {
        let checks = LedgerInvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"balance_matches_entries"));
        assert!(checks.contains(&"counters_within_cap"));
    }
}
