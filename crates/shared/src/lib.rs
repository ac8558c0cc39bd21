//! Shared building blocks for the Easel services.
//!
//! Holds the pieces both the billing side and the generation side need:
//! Postgres pool construction, the migrations runner, and the caller
//! identity / tier model that drives admission control.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{CallerIdentity, Tier, TierCaps, WindowCaps};
