use thiserror::Error;

use crate::admission::Decision;
use crate::provider::ProviderError;

/// Generation-side errors.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Admission denied. Not an exception in spirit: the decision carries
    /// the remaining-quota metadata the caller must surface.
    #[error("rate limit exceeded")]
    RateLimited(Decision),

    /// The optional per-generation debit found the account short.
    #[error("insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits { available: i64, requested: i64 },

    /// The upstream portrait provider rejected or failed the job. The
    /// request row has already been marked failed.
    #[error("upstream provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A lifecycle transition was attempted from the wrong state.
    /// Terminal states are immutable; this makes illegal updates loud.
    #[error("invalid status transition for request {id}: expected {expected}")]
    InvalidTransition { id: uuid::Uuid, expected: String },

    #[error("generation request {0} not found")]
    NotFound(uuid::Uuid),

    /// Claiming kept losing to other submitters finishing and restarting
    /// the same work; the caller should simply resubmit.
    #[error("request slot for {identity} is contended, retry the submission")]
    SlotContended { identity: String },

    #[error("ledger error: {0}")]
    Ledger(easel_billing::BillingError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type GenerationResult<T> = Result<T, GenerationError>;
