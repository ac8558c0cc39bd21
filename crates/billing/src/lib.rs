// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Easel Billing Module
//!
//! The money-in side of the service: verified payment webhooks, the
//! idempotency gate, the event dispatcher, and the credit ledger.
//!
//! ## Guarantees
//!
//! - **Exactly-once crediting**: a payment event delivered any number of
//!   times grants credits at most once (atomic claim on the event id)
//! - **Atomic balances**: every balance mutation commits together with its
//!   ledger entry; concurrent writers serialize on the balance row
//! - **No auto-retry**: handler failures are recorded for manual replay,
//!   never retried by this crate
//! - **Invariants**: executable read-only checks over the persisted state

pub mod accounts;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod invariants;
pub mod ledger;
pub mod webhooks;


// Accounts
pub use accounts::{
    AccountStore, InMemoryAccountStore, PaymentAudit, PgAccountStore, SubscriptionState,
};

// Dispatch
pub use dispatch::{credits_for_amount, EventDispatcher};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    CheckoutCompleted, EventKind, PaymentEvent, PaymentOutcome, SubscriptionCreated,
};

// Idempotency
pub use idempotency::{
    Admission, EventOutcome, IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore,
    StoredEvent,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantViolation, LedgerInvariantChecker, ViolationSeverity,
};

// Ledger
pub use ledger::{
    Balance, EntryKind, InMemoryLedgerStore, Ledger, LedgerEntry, LedgerStore, PgLedgerStore,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use sqlx::PgPool;
use std::sync::Arc;

use easel_shared::TierCaps;

/// Main billing service that combines the webhook pipeline, the ledger,
/// and the invariant checker.
pub struct BillingService {
    pub ledger: Ledger,
    pub accounts: Arc<dyn AccountStore>,
    pub webhooks: WebhookHandler,
    pub invariants: LedgerInvariantChecker,
}

impl BillingService {
    /// Wire the Postgres-backed stores against `pool`.
    pub fn new(pool: PgPool, signing_secret: String, caps: TierCaps) -> Self {
        let ledger = Ledger::new(Arc::new(PgLedgerStore::new(pool.clone())));
        let accounts: Arc<dyn AccountStore> = Arc::new(PgAccountStore::new(pool.clone()));
        let dispatcher = EventDispatcher::new(ledger.clone(), accounts.clone());
        let gate: Arc<dyn IdempotencyStore> = Arc::new(PgIdempotencyStore::new(pool.clone()));

        Self {
            ledger,
            accounts,
            webhooks: WebhookHandler::new(signing_secret, gate, dispatcher),
            invariants: LedgerInvariantChecker::new(pool, caps),
        }
    }
}
