use thiserror::Error;

/// Billing errors.
///
/// Webhook-facing variants carry enough context to pick an HTTP status
/// without string matching; store-facing variants wrap the underlying
/// driver error.
#[derive(Debug, Error)]
pub enum BillingError {
    /// The webhook request carried no signature header at all.
    #[error("webhook signature header missing")]
    MissingSignature,

    /// The signature header was present but did not verify.
    #[error("webhook signature invalid")]
    SignatureInvalid,

    /// The payload was not a well-formed payment event envelope, or a
    /// recognized event type was missing required fields.
    #[error("malformed payment event: {0}")]
    MalformedEvent(String),

    /// No account maps to the provider customer reference on the event.
    #[error("no account for payment customer {0}")]
    AccountNotFound(String),

    /// A debit was requested for more credits than the account holds.
    /// The ledger rolls back; no balance or entry is written.
    #[error("insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits { available: i64, requested: i64 },

    /// Ledger amounts must be strictly positive.
    #[error("ledger amount must be positive, got {0}")]
    InvalidAmount(i64),

    /// Replay was requested for an event id the gate has never seen.
    #[error("payment event {0} not found")]
    EventNotFound(String),

    /// Replay was requested for an event whose recorded outcome is not
    /// `failure`. Successful events are never re-dispatched.
    #[error("payment event {0} has no failed outcome to replay")]
    EventNotFailed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;
