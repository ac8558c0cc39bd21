//! Shared application state.

use std::sync::Arc;

use sqlx::PgPool;

use easel_billing::BillingService;
use easel_generation::{
    AdmissionController, GenerationService, HttpPortraitProvider, PgQuotaStore, PgRequestStore,
    RequestTracker, UsageDebit,
};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub generation: Arc<GenerationService>,
}

impl AppState {
    /// Wire every component against the shared pool. Components take
    /// their stores by injection, so tests assemble the same services
    /// over in-memory stores instead.
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = Arc::new(BillingService::new(
            pool.clone(),
            config.webhook_signing_secret.clone(),
            config.tier_caps,
        ));

        let admission = AdmissionController::new(
            Arc::new(PgQuotaStore::new(pool.clone())),
            config.tier_caps,
        );
        let tracker = RequestTracker::new(Arc::new(PgRequestStore::new(pool.clone())));
        let provider = Arc::new(HttpPortraitProvider::new(
            config.provider_url.clone(),
            config.provider_api_key.clone(),
            config.provider_timeout,
        ));
        let usage_debit = config.generation_credit_cost.map(|cost| UsageDebit {
            ledger: billing.ledger.clone(),
            cost,
        });

        let generation = Arc::new(GenerationService::new(
            admission,
            tracker,
            provider,
            usage_debit,
        ));

        Self {
            pool,
            config,
            billing,
            generation,
        }
    }
}
