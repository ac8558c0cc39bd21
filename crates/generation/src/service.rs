//! The generation submission pipeline.
//!
//! Order matters and is fixed:
//!
//! 1. dedup probe - an in-flight request with the same identity and
//!    content hash short-circuits with the existing request and a
//!    read-only quota view (nothing consumed, nothing persisted)
//! 2. admission - a denial produces `RateLimited` and creates no work
//! 3. optional usage debit - when a per-generation cost is configured,
//!    credits are consumed before any upstream call; a shortfall stops
//!    here, and credits are never silently re-granted on failure
//! 4. claim the pending row (the losing side of a simultaneous duplicate
//!    gets the winner's row back)
//! 5. provider call under timeout and bounded retry
//! 6. finalize: completed or failed, with processing time on both paths
//!
//! No cancellation propagates upstream on client disconnect; the request
//! row is finalized whenever the provider call returns.

use std::sync::Arc;
use std::time::Instant;
use time::{Duration, OffsetDateTime};

use easel_billing::{BillingError, EntryKind, Ledger};
use easel_shared::{CallerIdentity, Tier};

use crate::admission::{AdmissionController, Decision};
use crate::error::{GenerationError, GenerationResult};
use crate::provider::{PortraitJob, PortraitProvider};
use crate::tracker::{content_hash, GenerationRequest, RequestTracker};

/// Optional per-generation credit cost, wired in from configuration.
#[derive(Clone)]
pub struct UsageDebit {
    pub ledger: Ledger,
    pub cost: i64,
}

/// A parsed, validated submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub identity: CallerIdentity,
    pub tier: Tier,
    pub image_bytes: Vec<u8>,
    pub image_base64: String,
    pub image_type: String,
    pub prompt: String,
    pub style: Option<String>,
}

/// What the caller gets back from a successful (or deduplicated) submit.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The work ran to completion upstream.
    Completed {
        request: GenerationRequest,
        output: serde_json::Value,
        decision: Decision,
    },
    /// Duplicate of an in-flight request: the existing request is
    /// returned, no quota consumed, no upstream call made.
    InFlight {
        request: GenerationRequest,
        decision: Decision,
    },
}

/// Orchestrates admission, the request tracker, the optional debit, and
/// the provider call.
#[derive(Clone)]
pub struct GenerationService {
    admission: AdmissionController,
    tracker: RequestTracker,
    provider: Arc<dyn PortraitProvider>,
    usage_debit: Option<UsageDebit>,
}

impl GenerationService {
    pub fn new(
        admission: AdmissionController,
        tracker: RequestTracker,
        provider: Arc<dyn PortraitProvider>,
        usage_debit: Option<UsageDebit>,
    ) -> Self {
        Self {
            admission,
            tracker,
            provider,
            usage_debit,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Run one submission through the pipeline.
    pub async fn submit(&self, submission: Submission) -> GenerationResult<SubmitOutcome> {
        let identity = submission.identity.key();
        let hash = content_hash(
            &submission.image_bytes,
            &submission.prompt,
            submission.style.as_deref(),
        );
        let now = OffsetDateTime::now_utc();

        // Dedup probe before admission: a double-click should not burn a
        // quota slot.
        if let Some(existing) = self.tracker.find_in_flight(&identity, &hash).await? {
            let decision = self.admission.peek(&identity, submission.tier, now).await?;
            tracing::info!(
                identity = %identity,
                request_id = %existing.id,
                "Duplicate submission, returning in-flight request"
            );
            return Ok(SubmitOutcome::InFlight {
                request: existing,
                decision,
            });
        }

        let decision = self
            .admission
            .check_and_consume(&identity, submission.tier, now)
            .await?;
        if !decision.allowed {
            return Err(GenerationError::RateLimited(decision));
        }

        if let Some(debit) = &self.usage_debit {
            self.apply_usage_debit(debit, &submission).await?;
        }

        let (request, fresh) = self.tracker.submit(&identity, &hash).await?;
        if !fresh {
            // Lost a simultaneous-duplicate race after admission; the slot
            // is spent but exactly one request exists, and the loser gets
            // the winner's row.
            return Ok(SubmitOutcome::InFlight { request, decision });
        }

        self.run_upstream(request, submission, decision).await
    }

    async fn apply_usage_debit(
        &self,
        debit: &UsageDebit,
        submission: &Submission,
    ) -> GenerationResult<()> {
        let Some(account_id) = submission.identity.account_id() else {
            // Anonymous callers have no balance to debit; the tier caps
            // are their only budget.
            return Ok(());
        };
        debit
            .ledger
            .debit(account_id, debit.cost, EntryKind::Usage, "portrait generation")
            .await
            .map(|_| ())
            .map_err(|e| match e {
                BillingError::InsufficientCredits { available, requested } => {
                    GenerationError::InsufficientCredits { available, requested }
                }
                other => GenerationError::Ledger(other),
            })
    }

    async fn run_upstream(
        &self,
        request: GenerationRequest,
        submission: Submission,
        decision: Decision,
    ) -> GenerationResult<SubmitOutcome> {
        self.tracker.mark_processing(request.id).await?;

        let job = PortraitJob {
            prompt: submission.prompt,
            style: submission.style,
            image_base64: submission.image_base64,
            image_type: submission.image_type,
        };

        let started = Instant::now();
        let result = self.provider.generate(&job).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(output) => {
                self.tracker.mark_completed(request.id, elapsed_ms).await?;
                let request = self.tracker.get(request.id).await?;
                tracing::info!(
                    request_id = %request.id,
                    processing_time_ms = elapsed_ms,
                    "Generation completed"
                );
                Ok(SubmitOutcome::Completed {
                    request,
                    output: output.data,
                    decision,
                })
            }
            Err(e) => {
                self.tracker
                    .mark_failed(request.id, &e.to_string(), elapsed_ms)
                    .await?;
                tracing::error!(
                    request_id = %request.id,
                    processing_time_ms = elapsed_ms,
                    error = %e,
                    "Generation failed"
                );
                Err(GenerationError::Provider(e))
            }
        }
    }

    /// Fail abandoned `processing` rows. Called from the background
    /// reaper task.
    pub async fn reap_stuck(&self, max_age: Duration) -> GenerationResult<u64> {
        self.tracker.reap_stuck(max_age).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::provider::{PortraitOutput, ProviderError};
    use crate::tracker::{InMemoryRequestStore, RequestStatus, RequestTracker};
    use easel_billing::InMemoryLedgerStore;
    use easel_shared::TierCaps;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Scriptable provider fake; counts upstream calls.
    struct FakeProvider {
        calls: AtomicUsize,
        response: Box<dyn Fn() -> Result<PortraitOutput, ProviderError> + Send + Sync>,
    }

    impl FakeProvider {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Box::new(|| {
                    Ok(PortraitOutput {
                        data: serde_json::json!({"image_url": "https://cdn/p.png"}),
                    })
                }),
            }
        }

        fn rejecting(message: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Box::new(move || Err(ProviderError::ContentRejected(message.into()))),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PortraitProvider for FakeProvider {
        fn generate<'a>(
            &'a self,
            _job: &'a PortraitJob,
        ) -> BoxFuture<'a, Result<PortraitOutput, ProviderError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                // Simulate upstream latency so concurrent submissions
                // genuinely overlap with an in-flight request.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                (self.response)()
            })
        }
    }

    fn service(provider: Arc<FakeProvider>, usage_debit: Option<UsageDebit>) -> GenerationService {
        GenerationService::new(
            AdmissionController::new_in_memory(TierCaps::default()),
            RequestTracker::new(Arc::new(InMemoryRequestStore::new())),
            provider,
            usage_debit,
        )
    }

    fn submission(identity: CallerIdentity, tier: Tier, prompt: &str) -> Submission {
        Submission {
            identity,
            tier,
            image_bytes: b"fake png".to_vec(),
            image_base64: "ZmFrZSBwbmc=".into(),
            image_type: "image/png".into(),
            prompt: prompt.into(),
            style: None,
        }
    }

    #[tokio::test]
    async fn successful_submit_completes_with_quota_metadata() {
        let provider = Arc::new(FakeProvider::ok());
        let service = service(Arc::clone(&provider), None);

        let outcome = service
            .submit(submission(
                CallerIdentity::Session("s1".into()),
                Tier::Anonymous,
                "portrait",
            ))
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Completed { request, output, decision } => {
                assert_eq!(request.status, RequestStatus::Completed);
                assert!(request.processing_time_ms.is_some());
                assert_eq!(output["image_url"], "https://cdn/p.png");
                assert_eq!(decision.hourly_remaining, 2);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn denial_creates_no_work() {
        let provider = Arc::new(FakeProvider::ok());
        let service = service(Arc::clone(&provider), None);
        let identity = CallerIdentity::Ip("9.9.9.9".into());

        for i in 0..3 {
            service
                .submit(submission(identity.clone(), Tier::Anonymous, &format!("p{i}")))
                .await
                .unwrap();
        }

        let err = service
            .submit(submission(identity, Tier::Anonymous, "p3"))
            .await
            .unwrap_err();
        match err {
            GenerationError::RateLimited(decision) => {
                assert_eq!(decision.hourly_remaining, 0);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(provider.calls(), 3, "denied request never reached upstream");
    }

    #[tokio::test]
    async fn provider_failure_marks_request_failed() {
        let provider = Arc::new(FakeProvider::rejecting("unsafe content"));
        let service = service(provider, None);

        let err = service
            .submit(submission(
                CallerIdentity::Session("s2".into()),
                Tier::Anonymous,
                "portrait",
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Provider(ProviderError::ContentRejected(_))
        ));

        let request = service
            .tracker()
            .find_in_flight("session:s2", &content_hash(b"fake png", "portrait", None))
            .await
            .unwrap();
        assert!(request.is_none(), "the failed request is finalized");
    }

    #[tokio::test]
    async fn configured_debit_consumes_credits_before_upstream() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()));
        let account = Uuid::new_v4();
        ledger
            .credit(account, 2, EntryKind::Purchase, None, "seed")
            .await
            .unwrap();

        let provider = Arc::new(FakeProvider::ok());
        let service = service(
            Arc::clone(&provider),
            Some(UsageDebit {
                ledger: ledger.clone(),
                cost: 1,
            }),
        );

        for i in 0..2 {
            service
                .submit(submission(
                    CallerIdentity::Account(account),
                    Tier::Premium,
                    &format!("p{i}"),
                ))
                .await
                .unwrap();
        }
        assert_eq!(ledger.balance(account).await.unwrap().total(), 0);

        let err = service
            .submit(submission(CallerIdentity::Account(account), Tier::Premium, "p2"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::InsufficientCredits { .. }));
        assert_eq!(provider.calls(), 2, "shortfall stops before upstream");
    }

    #[tokio::test]
    async fn concurrent_identical_submissions_call_upstream_once() {
        use tokio::sync::Barrier;

        let provider = Arc::new(FakeProvider::ok());
        let service = Arc::new(service(Arc::clone(&provider), None));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];

        for _ in 0..4 {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .submit(submission(
                        CallerIdentity::Session("dup".into()),
                        Tier::Authenticated,
                        "same portrait",
                    ))
                    .await
                    .unwrap()
            }));
        }

        let mut completed_ids = std::collections::HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                SubmitOutcome::Completed { request, .. }
                | SubmitOutcome::InFlight { request, .. } => {
                    completed_ids.insert(request.id);
                }
            }
        }
        assert_eq!(completed_ids.len(), 1, "one request for all callers");
        assert_eq!(provider.calls(), 1, "one upstream call");
    }
}
