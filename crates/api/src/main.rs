// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Easel API Server
//!
//! HTTP surface for the portrait service: the payment webhook endpoint,
//! the generation endpoint, and credit balance lookups.

mod config;
mod error;
mod identity;
mod routes;
mod state;

use std::net::SocketAddr;

use axum::http::{header, Method};
use tokio::time::interval;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use easel_shared::{create_migration_pool, create_pool, run_migrations};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,easel_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Easel API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations run on a separate pool with longer timeouts.
    tracing::info!("Running database migrations...");
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Database migrations complete");

    let state = AppState::new(pool, config.clone());

    // Background reaper: fail processing rows that outlived every retry
    // the provider client could still be making.
    let generation = state.generation.clone();
    let reaper_interval = config.reaper_interval;
    let max_age = time::Duration::seconds((config.provider_timeout.as_secs() as i64) * 2 + 60);
    tokio::spawn(async move {
        let mut ticker = interval(reaper_interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            match generation.reap_stuck(max_age).await {
                Ok(0) => {}
                Ok(count) => tracing::warn!(count = count, "Reaped stuck generation requests"),
                Err(e) => tracing::error!(error = ?e, "Reaper pass failed"),
            }
        }
    });
    tracing::info!("Stuck-request reaper task started");

    // Restrict CORS to an explicit origin allowlist; default covers local
    // development, production sets ALLOWED_ORIGINS.
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
