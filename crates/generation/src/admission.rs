//! Tiered admission control.
//!
//! One decision per request: atomically increment-and-compare the caller's
//! hour and day counters against the tier caps, in a single round trip to
//! the store. If either window would overflow, nothing is incremented -
//! two simultaneous requests holding "one slot left" serialize in the
//! store and only one succeeds.

use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use time::{Duration, OffsetDateTime, Time};

use easel_shared::{Tier, TierCaps};

use crate::error::GenerationResult;

/// The admission decision, with the quota metadata clients need to back
/// off sensibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub tier: Tier,
    pub hourly_remaining: i64,
    pub daily_remaining: i64,
    /// When the binding window rolls over: the exhausted window's end on a
    /// denial (hour takes precedence when both are spent), otherwise the
    /// end of the current hour.
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
}

/// Counter values after (or instead of) a consume.
#[derive(Debug, Clone, Copy)]
pub struct WindowCounts {
    pub allowed: bool,
    pub hour_count: i64,
    pub day_count: i64,
}

/// Storage seam for the window counters. `consume` must be atomic across
/// both windows; `peek` is read-only.
pub trait QuotaStore: Send + Sync {
    fn consume<'a>(
        &'a self,
        identifier: &'a str,
        hour_start: OffsetDateTime,
        day_start: OffsetDateTime,
        hourly_cap: i64,
        daily_cap: i64,
    ) -> BoxFuture<'a, GenerationResult<WindowCounts>>;

    fn peek<'a>(
        &'a self,
        identifier: &'a str,
        hour_start: OffsetDateTime,
        day_start: OffsetDateTime,
    ) -> BoxFuture<'a, GenerationResult<(i64, i64)>>;
}

/// UTC hour bucket containing `now`.
pub fn hour_start(now: OffsetDateTime) -> OffsetDateTime {
    now.replace_time(Time::from_hms(now.hour(), 0, 0).unwrap_or(Time::MIDNIGHT))
}

/// UTC day bucket containing `now`.
pub fn day_start(now: OffsetDateTime) -> OffsetDateTime {
    now.replace_time(Time::MIDNIGHT)
}

/// The rate limiter: resolves caps for the caller's tier and asks the
/// store for an atomic consume.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn QuotaStore>,
    caps: TierCaps,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn QuotaStore>, caps: TierCaps) -> Self {
        Self { store, caps }
    }

    /// In-memory counters; used by tests and single-process deployments.
    pub fn new_in_memory(caps: TierCaps) -> Self {
        Self::new(Arc::new(InMemoryQuotaStore::new()), caps)
    }

    pub fn caps(&self) -> TierCaps {
        self.caps
    }

    /// Consume one slot from both windows, or neither.
    pub async fn check_and_consume(
        &self,
        identifier: &str,
        tier: Tier,
        now: OffsetDateTime,
    ) -> GenerationResult<Decision> {
        let caps = self.caps.caps_for(tier);
        let hour = hour_start(now);
        let day = day_start(now);

        let counts = self
            .store
            .consume(identifier, hour, day, caps.hourly, caps.daily)
            .await?;

        let decision = Self::decision(tier, caps.hourly, caps.daily, counts, hour, day);
        if !decision.allowed {
            tracing::info!(
                identifier = %identifier,
                tier = %tier,
                hourly_remaining = decision.hourly_remaining,
                daily_remaining = decision.daily_remaining,
                "Request denied by rate limit"
            );
        }
        Ok(decision)
    }

    /// Read-only view of the caller's quota; consumes nothing. Used when a
    /// dedup hit returns an in-flight request.
    pub async fn peek(
        &self,
        identifier: &str,
        tier: Tier,
        now: OffsetDateTime,
    ) -> GenerationResult<Decision> {
        let caps = self.caps.caps_for(tier);
        let hour = hour_start(now);
        let day = day_start(now);

        let (hour_count, day_count) = self.store.peek(identifier, hour, day).await?;
        let counts = WindowCounts {
            allowed: hour_count < caps.hourly && day_count < caps.daily,
            hour_count,
            day_count,
        };
        Ok(Self::decision(tier, caps.hourly, caps.daily, counts, hour, day))
    }

    fn decision(
        tier: Tier,
        hourly_cap: i64,
        daily_cap: i64,
        counts: WindowCounts,
        hour: OffsetDateTime,
        day: OffsetDateTime,
    ) -> Decision {
        let hourly_remaining = (hourly_cap - counts.hour_count).max(0);
        let daily_remaining = (daily_cap - counts.day_count).max(0);

        let reset_at = if counts.allowed || hourly_remaining == 0 {
            hour + Duration::HOUR
        } else {
            day + Duration::DAY
        };

        Decision {
            allowed: counts.allowed,
            tier,
            hourly_remaining,
            daily_remaining,
            reset_at,
        }
    }
}

/// Postgres-backed counters. The whole increment-and-compare runs inside
/// the `admission_consume` SQL function, one round trip per request.
#[derive(Debug, Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl QuotaStore for PgQuotaStore {
    fn consume<'a>(
        &'a self,
        identifier: &'a str,
        hour_start: OffsetDateTime,
        day_start: OffsetDateTime,
        hourly_cap: i64,
        daily_cap: i64,
    ) -> BoxFuture<'a, GenerationResult<WindowCounts>> {
        Box::pin(async move {
            let (allowed, hour_count, day_count): (bool, i64, i64) = sqlx::query_as(
                "SELECT allowed, hour_count, day_count FROM admission_consume($1, $2, $3, $4, $5)",
            )
            .bind(identifier)
            .bind(hour_start)
            .bind(day_start)
            .bind(hourly_cap)
            .bind(daily_cap)
            .fetch_one(&self.pool)
            .await?;

            Ok(WindowCounts {
                allowed,
                hour_count,
                day_count,
            })
        })
    }

    fn peek<'a>(
        &'a self,
        identifier: &'a str,
        hour_start: OffsetDateTime,
        day_start: OffsetDateTime,
    ) -> BoxFuture<'a, GenerationResult<(i64, i64)>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT window_kind, count FROM rate_limit_counters
                WHERE identifier = $1
                  AND ((window_kind = 'hour' AND window_start = $2)
                    OR (window_kind = 'day' AND window_start = $3))
                "#,
            )
            .bind(identifier)
            .bind(hour_start)
            .bind(day_start)
            .fetch_all(&self.pool)
            .await?;

            let mut hour_count = 0;
            let mut day_count = 0;
            for (kind, count) in rows {
                match kind.as_str() {
                    "hour" => hour_count = count,
                    "day" => day_count = count,
                    _ => {}
                }
            }
            Ok((hour_count, day_count))
        })
    }
}

type WindowKey = (String, &'static str, OffsetDateTime);

/// In-memory counters with the same both-or-neither semantics: one mutex
/// acquisition covers the compare and both increments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQuotaStore {
    counters: Arc<Mutex<HashMap<WindowKey, i64>>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WindowKey, i64>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn consume<'a>(
        &'a self,
        identifier: &'a str,
        hour_start: OffsetDateTime,
        day_start: OffsetDateTime,
        hourly_cap: i64,
        daily_cap: i64,
    ) -> BoxFuture<'a, GenerationResult<WindowCounts>> {
        Box::pin(async move {
            let mut counters = self.lock();
            let hour_key = (identifier.to_string(), "hour", hour_start);
            let day_key = (identifier.to_string(), "day", day_start);

            let hour_count = counters.get(&hour_key).copied().unwrap_or(0);
            let day_count = counters.get(&day_key).copied().unwrap_or(0);

            if hour_count >= hourly_cap || day_count >= daily_cap {
                return Ok(WindowCounts {
                    allowed: false,
                    hour_count,
                    day_count,
                });
            }

            counters.insert(hour_key, hour_count + 1);
            counters.insert(day_key, day_count + 1);
            Ok(WindowCounts {
                allowed: true,
                hour_count: hour_count + 1,
                day_count: day_count + 1,
            })
        })
    }

    fn peek<'a>(
        &'a self,
        identifier: &'a str,
        hour_start: OffsetDateTime,
        day_start: OffsetDateTime,
    ) -> BoxFuture<'a, GenerationResult<(i64, i64)>> {
        Box::pin(async move {
            let counters = self.lock();
            let hour = counters
                .get(&(identifier.to_string(), "hour", hour_start))
                .copied()
                .unwrap_or(0);
            let day = counters
                .get(&(identifier.to_string(), "day", day_start))
                .copied()
                .unwrap_or(0);
            Ok((hour, day))
        })
    }
}
