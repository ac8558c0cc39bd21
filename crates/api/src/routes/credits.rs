//! Balance and ledger history endpoint, for the purchase UI.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use easel_billing::{Balance, LedgerEntry};

use crate::error::ApiResult;
use crate::state::AppState;

const HISTORY_LIMIT: i64 = 50;

#[derive(Serialize)]
pub struct CreditsResponse {
    pub balance: Balance,
    pub total: i64,
    pub recent_entries: Vec<LedgerEntry>,
}

pub async fn get_credits(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Json<CreditsResponse>> {
    let balance = state.billing.ledger.balance(account_id).await?;
    let recent_entries = state
        .billing
        .ledger
        .entries(account_id, HISTORY_LIMIT)
        .await?;

    Ok(Json(CreditsResponse {
        total: balance.total(),
        balance,
        recent_entries,
    }))
}
