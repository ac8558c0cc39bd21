//! Generation submission endpoint.

use axum::{
    extract::{ConnectInfo, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use easel_generation::{GenerationRequest, SubmitOutcome, Submission};

use crate::error::{ApiError, ApiResult, RateLimitBody};
use crate::identity::{self, RequestCredentials};
use crate::state::AppState;

/// Keep oversized uploads out of the pipeline before decoding.
const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub image_data: String,
    pub image_type: String,
    pub prompt: String,
    pub style: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub data: serde_json::Value,
    pub request: GenerationRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    /// Present on dedup hits: the returned request is still in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<bool>,
    pub rate_limit: RateLimitBody,
}

pub async fn submit_generation(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    let submission = validate(&state, request, addr).await?;

    match state.generation.submit(submission).await? {
        SubmitOutcome::Completed {
            request,
            output,
            decision,
        } => Ok(Json(GenerateResponse {
            success: true,
            data: output,
            processing_time_ms: request.processing_time_ms,
            in_flight: None,
            rate_limit: RateLimitBody::from(&decision),
            request,
        })),
        SubmitOutcome::InFlight { request, decision } => Ok(Json(GenerateResponse {
            success: true,
            data: serde_json::Value::Null,
            processing_time_ms: None,
            in_flight: Some(true),
            rate_limit: RateLimitBody::from(&decision),
            request,
        })),
    }
}

async fn validate(
    state: &AppState,
    request: GenerateRequest,
    addr: SocketAddr,
) -> ApiResult<Submission> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".into()));
    }
    if request.image_type.is_empty() {
        return Err(ApiError::Validation("imageType must not be empty".into()));
    }

    let image_bytes = BASE64
        .decode(request.image_data.as_bytes())
        .map_err(|_| ApiError::Validation("imageData is not valid base64".into()))?;
    if image_bytes.is_empty() {
        return Err(ApiError::Validation("imageData must not be empty".into()));
    }
    if image_bytes.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::Validation(format!(
            "image exceeds the {MAX_IMAGE_BYTES} byte limit"
        )));
    }

    let credentials = RequestCredentials {
        api_key: request.api_key.filter(|k| !k.is_empty()),
        user_id: request.user_id.filter(|u| !u.is_empty()),
        session_id: request.session_id.filter(|s| !s.is_empty()),
        client_ip: addr.ip().to_string(),
    };
    let (identity, tier) = identity::resolve(
        state.billing.accounts.as_ref(),
        &state.billing.ledger,
        &credentials,
    )
    .await?;

    Ok(Submission {
        identity,
        tier,
        image_bytes,
        image_base64: request.image_data,
        image_type: request.image_type,
        prompt: request.prompt,
        style: request.style.filter(|s| !s.is_empty()),
    })
}
