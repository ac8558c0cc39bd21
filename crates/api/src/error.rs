//! HTTP error mapping.
//!
//! Every component returns a structured result; this is where the
//! taxonomy becomes status codes and machine-readable bodies. Rate-limit
//! and insufficient-credit responses always carry the numbers a client
//! needs to back off or prompt for purchase.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use easel_billing::BillingError;
use easel_generation::{Decision, GenerationError, ProviderError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Webhook signature missing")]
    MissingSignature,

    #[error("Webhook signature invalid")]
    SignatureInvalid,

    #[error("Rate limit exceeded")]
    RateLimited(Decision),

    #[error("Insufficient credits")]
    InsufficientCredits { available: i64, requested: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream provider error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credits: Option<CreditsBody>,
}

/// Quota metadata attached to 429s and successful generation responses.
#[derive(Serialize)]
pub struct RateLimitBody {
    pub hourly_remaining: i64,
    pub daily_remaining: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: time::OffsetDateTime,
}

impl From<&Decision> for RateLimitBody {
    fn from(decision: &Decision) -> Self {
        Self {
            hourly_remaining: decision.hourly_remaining,
            daily_remaining: decision.daily_remaining,
            reset_at: decision.reset_at,
        }
    }
}

#[derive(Serialize)]
struct CreditsBody {
    available: i64,
    requested: i64,
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::MissingSignature => ApiError::MissingSignature,
            BillingError::SignatureInvalid => ApiError::SignatureInvalid,
            BillingError::MalformedEvent(msg) => ApiError::Validation(msg),
            BillingError::InsufficientCredits { available, requested } => {
                ApiError::InsufficientCredits { available, requested }
            }
            BillingError::EventNotFound(id) => ApiError::NotFound(format!("event {id}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::RateLimited(decision) => ApiError::RateLimited(decision),
            GenerationError::InsufficientCredits { available, requested } => {
                ApiError::InsufficientCredits { available, requested }
            }
            GenerationError::Provider(provider) => match provider {
                ProviderError::ContentRejected(msg) => {
                    ApiError::Upstream(format!("content rejected: {msg}"))
                }
                other => ApiError::Upstream(other.to_string()),
            },
            GenerationError::NotFound(id) => ApiError::NotFound(format!("request {id}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(format!("database error: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details, rate_limit, credits) = match &self {
            ApiError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "Validation failed",
                Some(msg.clone()),
                None,
                None,
            ),
            ApiError::InvalidApiKey => {
                (StatusCode::UNAUTHORIZED, "Invalid API key", None, None, None)
            }
            ApiError::MissingSignature => (
                StatusCode::BAD_REQUEST,
                "Missing webhook signature",
                None,
                None,
                None,
            ),
            ApiError::SignatureInvalid => (
                StatusCode::UNAUTHORIZED,
                "Invalid webhook signature",
                None,
                None,
                None,
            ),
            ApiError::RateLimited(decision) => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded",
                None,
                Some(RateLimitBody::from(decision)),
                None,
            ),
            ApiError::InsufficientCredits { available, requested } => (
                StatusCode::PAYMENT_REQUIRED,
                "Insufficient credits",
                None,
                None,
                Some(CreditsBody {
                    available: *available,
                    requested: *requested,
                }),
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "Not found",
                Some(msg.clone()),
                None,
                None,
            ),
            ApiError::Upstream(msg) => {
                tracing::error!("Upstream provider error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Generation failed",
                    Some(msg.clone()),
                    None,
                    None,
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    None,
                    None,
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
            rate_limit,
            credits,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
