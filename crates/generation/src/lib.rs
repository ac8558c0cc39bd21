// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Easel Generation Module
//!
//! The work-out side of the service: tiered admission control, the
//! generation request lifecycle tracker, and the upstream portrait
//! provider client.
//!
//! ## Guarantees
//!
//! - **Bounded bursts**: one atomic increment-and-compare covers both the
//!   hourly and daily windows; a denial consumes nothing
//! - **One upstream call per piece of work**: identical in-flight
//!   submissions collapse onto a single request row
//! - **Bounded upstream calls**: explicit per-attempt timeout and a
//!   bounded transient-only retry policy

pub mod admission;
pub mod error;
pub mod provider;
pub mod service;
pub mod tracker;

// Admission
pub use admission::{
    day_start, hour_start, AdmissionController, Decision, InMemoryQuotaStore, PgQuotaStore,
    QuotaStore, WindowCounts,
};

// Error
pub use error::{GenerationError, GenerationResult};

// Provider
pub use provider::{
    HttpPortraitProvider, PortraitJob, PortraitOutput, PortraitProvider, ProviderError,
    DEFAULT_TIMEOUT,
};

// Service
pub use service::{GenerationService, SubmitOutcome, Submission, UsageDebit};

// Tracker
pub use tracker::{
    content_hash, GenerationRequest, InMemoryRequestStore, PgRequestStore, RequestStatus,
    RequestStore, RequestTracker,
};
