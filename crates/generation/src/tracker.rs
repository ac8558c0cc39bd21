//! Generation request lifecycle tracker.
//!
//! State machine: `pending -> processing -> {completed, failed}`; terminal
//! states are final. Dedup rides on the store's partial unique index over
//! in-flight rows: claiming a pending row for a hash that is already in
//! flight loses the conflict and returns the winner instead.
//!
//! All transitions are guarded on the current status, so a stale writer
//! (crashed worker, racing duplicate) turns into a no-op surfaced as
//! `InvalidTransition` rather than a corrupting update.

use futures::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::{Arc, Mutex, PoisonError};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{GenerationError, GenerationResult};

/// Request lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "processing" => RequestStatus::Processing,
            "completed" => RequestStatus::Completed,
            "failed" => RequestStatus::Failed,
            _ => RequestStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked generation request. Terminal rows are kept for audit.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub identity: String,
    pub content_hash: String,
    pub status: RequestStatus,
    pub error: Option<String>,
    pub processing_time_ms: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// SHA-256 fingerprint of the work: image bytes plus the effective prompt
/// as sent upstream. Identical submissions collapse to one in-flight row.
pub fn content_hash(image_bytes: &[u8], prompt: &str, style: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_bytes);
    hasher.update(prompt.as_bytes());
    if let Some(style) = style {
        hasher.update(style.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Persistence seam for request rows.
pub trait RequestStore: Send + Sync {
    /// Insert a `pending` row, unless the same (identity, hash) is already
    /// in flight. Returns `None` when the claim loses that race.
    fn claim<'a>(
        &'a self,
        identity: &'a str,
        content_hash: &'a str,
    ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>>;

    /// The in-flight (pending or processing) row for this work, if any.
    fn find_in_flight<'a>(
        &'a self,
        identity: &'a str,
        content_hash: &'a str,
    ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>>;

    fn get(&self, id: Uuid) -> BoxFuture<'_, GenerationResult<Option<GenerationRequest>>>;

    /// Guarded transition: succeeds only when the row currently holds
    /// `from`. Returns whether a row changed.
    fn transition<'a>(
        &'a self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        error: Option<&'a str>,
        processing_time_ms: Option<i64>,
    ) -> BoxFuture<'a, GenerationResult<bool>>;

    /// Fail `processing` rows that have not progressed since `cutoff`.
    /// Returns the number of rows reaped.
    fn reap_stuck(&self, cutoff: OffsetDateTime) -> BoxFuture<'_, GenerationResult<u64>>;
}

/// Claim/find rounds per submit before giving up on a churning slot.
const SUBMIT_ATTEMPTS: usize = 3;

/// The lifecycle tracker: wraps the store with the legal transitions.
#[derive(Clone)]
pub struct RequestTracker {
    store: Arc<dyn RequestStore>,
}

impl RequestTracker {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// Claim a new pending request, or surface the in-flight winner.
    ///
    /// A claim can lose to a racing duplicate whose winner then finishes
    /// before the follow-up read; the claim/find pair is retried until one
    /// side lands. One extra round settles it in practice, the bound only
    /// guards against a slot that churns on every attempt.
    pub async fn submit(
        &self,
        identity: &str,
        content_hash: &str,
    ) -> GenerationResult<(GenerationRequest, bool)> {
        for _ in 0..SUBMIT_ATTEMPTS {
            if let Some(request) = self.store.claim(identity, content_hash).await? {
                return Ok((request, true));
            }
            // Lost the insert race: return the winner so the caller gets
            // its outcome. A miss here means the winner already finished;
            // loop back and claim the freed slot.
            if let Some(existing) = self.store.find_in_flight(identity, content_hash).await? {
                return Ok((existing, false));
            }
        }
        Err(GenerationError::SlotContended {
            identity: identity.to_string(),
        })
    }

    pub async fn find_in_flight(
        &self,
        identity: &str,
        content_hash: &str,
    ) -> GenerationResult<Option<GenerationRequest>> {
        self.store.find_in_flight(identity, content_hash).await
    }

    pub async fn get(&self, id: Uuid) -> GenerationResult<GenerationRequest> {
        self.store
            .get(id)
            .await?
            .ok_or(GenerationError::NotFound(id))
    }

    pub async fn mark_processing(&self, id: Uuid) -> GenerationResult<()> {
        self.guarded(id, RequestStatus::Pending, RequestStatus::Processing, None, None)
            .await
    }

    pub async fn mark_completed(&self, id: Uuid, processing_time_ms: i64) -> GenerationResult<()> {
        self.guarded(
            id,
            RequestStatus::Processing,
            RequestStatus::Completed,
            None,
            Some(processing_time_ms),
        )
        .await
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        processing_time_ms: i64,
    ) -> GenerationResult<()> {
        self.guarded(
            id,
            RequestStatus::Processing,
            RequestStatus::Failed,
            Some(error),
            Some(processing_time_ms),
        )
        .await
    }

    async fn guarded(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        error: Option<&str>,
        processing_time_ms: Option<i64>,
    ) -> GenerationResult<()> {
        let changed = self
            .store
            .transition(id, from, to, error, processing_time_ms)
            .await?;
        if changed {
            tracing::debug!(request_id = %id, from = %from, to = %to, "Request transition");
            Ok(())
        } else {
            Err(GenerationError::InvalidTransition {
                id,
                expected: from.as_str().into(),
            })
        }
    }

    /// Fail `processing` rows older than `max_age` so a crashed worker
    /// cannot wedge the dedup index forever.
    pub async fn reap_stuck(&self, max_age: Duration) -> GenerationResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let reaped = self.store.reap_stuck(cutoff).await?;
        if reaped > 0 {
            tracing::warn!(reaped, "Reaped abandoned generation requests");
        }
        Ok(reaped)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    identity: String,
    content_hash: String,
    status: String,
    error: Option<String>,
    processing_time_ms: Option<i64>,
    created_at: OffsetDateTime,
}

impl From<RequestRow> for GenerationRequest {
    fn from(row: RequestRow) -> Self {
        GenerationRequest {
            id: row.id,
            identity: row.identity,
            content_hash: row.content_hash,
            status: RequestStatus::from_str(&row.status),
            error: row.error,
            processing_time_ms: row.processing_time_ms,
            created_at: row.created_at,
        }
    }
}

const REQUEST_COLUMNS: &str =
    "id, identity, content_hash, status, error, processing_time_ms, created_at";

/// Postgres-backed request store. The partial unique index on in-flight
/// (identity, content_hash) pairs is the dedup arbiter.
#[derive(Debug, Clone)]
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl RequestStore for PgRequestStore {
    fn claim<'a>(
        &'a self,
        identity: &'a str,
        content_hash: &'a str,
    ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>> {
        Box::pin(async move {
            let row: Option<RequestRow> = sqlx::query_as(&format!(
                r#"
                INSERT INTO generation_requests (identity, content_hash)
                VALUES ($1, $2)
                ON CONFLICT (identity, content_hash)
                    WHERE status IN ('pending', 'processing')
                    DO NOTHING
                RETURNING {REQUEST_COLUMNS}
                "#
            ))
            .bind(identity)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(GenerationRequest::from))
        })
    }

    fn find_in_flight<'a>(
        &'a self,
        identity: &'a str,
        content_hash: &'a str,
    ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>> {
        Box::pin(async move {
            let row: Option<RequestRow> = sqlx::query_as(&format!(
                r#"
                SELECT {REQUEST_COLUMNS}
                FROM generation_requests
                WHERE identity = $1
                  AND content_hash = $2
                  AND status IN ('pending', 'processing')
                "#
            ))
            .bind(identity)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(GenerationRequest::from))
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, GenerationResult<Option<GenerationRequest>>> {
        Box::pin(async move {
            let row: Option<RequestRow> = sqlx::query_as(&format!(
                "SELECT {REQUEST_COLUMNS} FROM generation_requests WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(GenerationRequest::from))
        })
    }

    fn transition<'a>(
        &'a self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        error: Option<&'a str>,
        processing_time_ms: Option<i64>,
    ) -> BoxFuture<'a, GenerationResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE generation_requests
                SET status = $3,
                    error = COALESCE($4, error),
                    processing_time_ms = COALESCE($5, processing_time_ms),
                    updated_at = NOW()
                WHERE id = $1 AND status = $2
                "#,
            )
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(error)
            .bind(processing_time_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn reap_stuck(&self, cutoff: OffsetDateTime) -> BoxFuture<'_, GenerationResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE generation_requests
                SET status = 'failed', error = 'abandoned', updated_at = NOW()
                WHERE status = 'processing' AND updated_at < $1
                "#,
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
    }
}

#[derive(Debug, Default)]
struct InMemoryRequests {
    rows: Vec<StoredRequest>,
}

#[derive(Debug, Clone)]
struct StoredRequest {
    request: GenerationRequest,
    updated_at: OffsetDateTime,
}

/// In-memory request store for tests and single-process deployments; the
/// single mutex gives the claim the same atomicity as the unique index.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRequestStore {
    inner: Arc<Mutex<InMemoryRequests>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryRequests> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RequestStore for InMemoryRequestStore {
    fn claim<'a>(
        &'a self,
        identity: &'a str,
        content_hash: &'a str,
    ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let in_flight = inner.rows.iter().any(|r| {
                r.request.identity == identity
                    && r.request.content_hash == content_hash
                    && !r.request.status.is_terminal()
            });
            if in_flight {
                return Ok(None);
            }
            let request = GenerationRequest {
                id: Uuid::new_v4(),
                identity: identity.to_string(),
                content_hash: content_hash.to_string(),
                status: RequestStatus::Pending,
                error: None,
                processing_time_ms: None,
                created_at: OffsetDateTime::now_utc(),
            };
            inner.rows.push(StoredRequest {
                request: request.clone(),
                updated_at: OffsetDateTime::now_utc(),
            });
            Ok(Some(request))
        })
    }

    fn find_in_flight<'a>(
        &'a self,
        identity: &'a str,
        content_hash: &'a str,
    ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>> {
        Box::pin(async move {
            let inner = self.lock();
            Ok(inner
                .rows
                .iter()
                .find(|r| {
                    r.request.identity == identity
                        && r.request.content_hash == content_hash
                        && !r.request.status.is_terminal()
                })
                .map(|r| r.request.clone()))
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, GenerationResult<Option<GenerationRequest>>> {
        Box::pin(async move {
            let inner = self.lock();
            Ok(inner
                .rows
                .iter()
                .find(|r| r.request.id == id)
                .map(|r| r.request.clone()))
        })
    }

    fn transition<'a>(
        &'a self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        error: Option<&'a str>,
        processing_time_ms: Option<i64>,
    ) -> BoxFuture<'a, GenerationResult<bool>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let Some(row) = inner
                .rows
                .iter_mut()
                .find(|r| r.request.id == id && r.request.status == from)
            else {
                return Ok(false);
            };
            row.request.status = to;
            if error.is_some() {
                row.request.error = error.map(str::to_string);
            }
            if processing_time_ms.is_some() {
                row.request.processing_time_ms = processing_time_ms;
            }
            row.updated_at = OffsetDateTime::now_utc();
            Ok(true)
        })
    }

    fn reap_stuck(&self, cutoff: OffsetDateTime) -> BoxFuture<'_, GenerationResult<u64>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let mut reaped = 0;
            for row in inner.rows.iter_mut() {
                if row.request.status == RequestStatus::Processing && row.updated_at < cutoff {
                    row.request.status = RequestStatus::Failed;
                    row.request.error = Some("abandoned".to_string());
                    row.updated_at = OffsetDateTime::now_utc();
                    reaped += 1;
                }
            }
            Ok(reaped)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RequestTracker {
        RequestTracker::new(Arc::new(InMemoryRequestStore::new()))
    }

    #[test]
    fn content_hash_distinguishes_prompt_and_style() {
        let image = b"png bytes";
        let a = content_hash(image, "a portrait", None);
        let b = content_hash(image, "a portrait", Some("baroque"));
        let c = content_hash(image, "another portrait", None);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, content_hash(image, "a portrait", None));
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let tracker = tracker();
        let (request, fresh) = tracker.submit("user:u1", "hash1").await.unwrap();
        assert!(fresh);
        assert_eq!(request.status, RequestStatus::Pending);

        tracker.mark_processing(request.id).await.unwrap();
        tracker.mark_completed(request.id, 1234).await.unwrap();

        let done = tracker.get(request.id).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.processing_time_ms, Some(1234));
    }

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let tracker = tracker();
        let (request, _) = tracker.submit("user:u1", "hash2").await.unwrap();
        tracker.mark_processing(request.id).await.unwrap();
        tracker.mark_failed(request.id, "unsafe content", 500).await.unwrap();

        assert!(matches!(
            tracker.mark_completed(request.id, 1).await.unwrap_err(),
            GenerationError::InvalidTransition { .. }
        ));
        assert!(matches!(
            tracker.mark_processing(request.id).await.unwrap_err(),
            GenerationError::InvalidTransition { .. }
        ));

        let still_failed = tracker.get(request.id).await.unwrap();
        assert_eq!(still_failed.status, RequestStatus::Failed);
        assert_eq!(still_failed.error.as_deref(), Some("unsafe content"));
    }

    #[tokio::test]
    async fn in_flight_duplicate_returns_existing() {
        let tracker = tracker();
        let (first, fresh) = tracker.submit("user:u1", "hash3").await.unwrap();
        assert!(fresh);

        let (second, fresh) = tracker.submit("user:u1", "hash3").await.unwrap();
        assert!(!fresh);
        assert_eq!(second.id, first.id);

        // A different identity with the same hash is its own request.
        let (other, fresh) = tracker.submit("user:u2", "hash3").await.unwrap();
        assert!(fresh);
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn finished_request_frees_the_dedup_slot() {
        let tracker = tracker();
        let (first, _) = tracker.submit("user:u1", "hash4").await.unwrap();
        tracker.mark_processing(first.id).await.unwrap();
        tracker.mark_completed(first.id, 10).await.unwrap();

        let (second, fresh) = tracker.submit("user:u1", "hash4").await.unwrap();
        assert!(fresh, "terminal rows do not block resubmission");
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn concurrent_duplicate_submissions_produce_one_request() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let tracker = Arc::new(tracker());
        let barrier = Arc::new(Barrier::new(6));
        let mut handles = vec![];

        for _ in 0..6 {
            let tracker = Arc::clone(&tracker);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                tracker.submit("user:race", "hash5").await.unwrap()
            }));
        }

        let mut ids = std::collections::HashSet::new();
        let mut fresh_count = 0;
        for handle in handles {
            let (request, fresh) = handle.await.unwrap();
            ids.insert(request.id);
            if fresh {
                fresh_count += 1;
            }
        }
        assert_eq!(ids.len(), 1, "every caller sees the same request");
        assert_eq!(fresh_count, 1, "only one claim wins");
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store where the first `lost_rounds` claims lose to a winner that
    /// has already finished by the time we look for it.
    struct ChurningStore {
        inner: InMemoryRequestStore,
        lost_rounds: AtomicUsize,
    }

    impl ChurningStore {
        fn new(lost_rounds: usize) -> Self {
            Self {
                inner: InMemoryRequestStore::new(),
                lost_rounds: AtomicUsize::new(lost_rounds),
            }
        }
    }

    impl RequestStore for ChurningStore {
        fn claim<'a>(
            &'a self,
            identity: &'a str,
            content_hash: &'a str,
        ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>> {
            Box::pin(async move {
                if self.lost_rounds.load(Ordering::SeqCst) > 0 {
                    self.lost_rounds.fetch_sub(1, Ordering::SeqCst);
                    return Ok(None);
                }
                self.inner.claim(identity, content_hash).await
            })
        }

        fn find_in_flight<'a>(
            &'a self,
            _identity: &'a str,
            _content_hash: &'a str,
        ) -> BoxFuture<'a, GenerationResult<Option<GenerationRequest>>> {
            // The race winner is always terminal by the time we look.
            Box::pin(async move { Ok(None) })
        }

        fn get(&self, id: Uuid) -> BoxFuture<'_, GenerationResult<Option<GenerationRequest>>> {
            self.inner.get(id)
        }

        fn transition<'a>(
            &'a self,
            id: Uuid,
            from: RequestStatus,
            to: RequestStatus,
            error: Option<&'a str>,
            processing_time_ms: Option<i64>,
        ) -> BoxFuture<'a, GenerationResult<bool>> {
            self.inner.transition(id, from, to, error, processing_time_ms)
        }

        fn reap_stuck(&self, cutoff: OffsetDateTime) -> BoxFuture<'_, GenerationResult<u64>> {
            self.inner.reap_stuck(cutoff)
        }
    }

    #[tokio::test]
    async fn lost_race_against_finished_winner_reclaims_the_slot() {
        let tracker = RequestTracker::new(Arc::new(ChurningStore::new(1)));
        let (request, fresh) = tracker.submit("user:u1", "hash8").await.unwrap();
        assert!(fresh, "the freed slot is claimed on the next round");
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn persistently_churning_slot_reports_contention() {
        let tracker = RequestTracker::new(Arc::new(ChurningStore::new(usize::MAX)));
        match tracker.submit("user:u1", "hash9").await.unwrap_err() {
            GenerationError::SlotContended { identity } => assert_eq!(identity, "user:u1"),
            other => panic!("expected contention, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reaper_fails_stuck_processing_rows() {
        let store = InMemoryRequestStore::new();
        let tracker = RequestTracker::new(Arc::new(store.clone()));

        let (stuck, _) = tracker.submit("user:u1", "hash6").await.unwrap();
        tracker.mark_processing(stuck.id).await.unwrap();
        let (pending, _) = tracker.submit("user:u1", "hash7").await.unwrap();

        // Everything is newer than the cutoff; nothing reaped.
        assert_eq!(tracker.reap_stuck(Duration::minutes(10)).await.unwrap(), 0);

        // A zero max-age makes the processing row stale immediately.
        let reaped = tracker.reap_stuck(Duration::seconds(-1)).await.unwrap();
        assert_eq!(reaped, 1, "only processing rows are reaped");

        assert_eq!(
            tracker.get(stuck.id).await.unwrap().status,
            RequestStatus::Failed
        );
        assert_eq!(
            tracker.get(pending.id).await.unwrap().status,
            RequestStatus::Pending
        );
    }
}
