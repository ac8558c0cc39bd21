//! HTTP routes.

mod credits;
mod generate;
mod webhooks;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payments", post(webhooks::receive_payment_event))
        .route("/api/generate", post(generate::submit_generation))
        .route("/api/credits/{account_id}", get(credits::get_credits))
        .with_state(state)
}

/// Liveness plus a database ping.
async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    sqlx::query("SELECT 1").execute(&state.pool).await?;
    Ok(Json(json!({ "status": "ok" })))
}
