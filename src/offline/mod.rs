//! Client-resident offline verification queue.
//!
//! Runs on the delivery device, not in the server process. Verification
//! attempts made without connectivity land in a durable redb backlog and are
//! reconciled against the backend on reconnect. Flush is single-flight and
//! resumable after restart: the backlog is read back from disk, so a captured
//! confirmation is only ever delayed, never lost.

pub mod flow;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::proof::VerifyOutcome;
use crate::state::AppState;
use store::{OfflineQueueItem, OfflineStore, StoreError};

const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 300;

/// Where queued verifications are submitted on flush. The device uses the
/// HTTP implementation; tests drive the core directly.
pub trait ProofVerifier {
    async fn verify(
        &self,
        token_value: &str,
        sub_order_id: Uuid,
    ) -> Result<VerifyOutcome, AppError>;
}

/// In-process verifier for embedding and tests.
#[derive(Clone)]
pub struct LocalVerifier {
    pub state: Arc<AppState>,
}

impl ProofVerifier for LocalVerifier {
    async fn verify(
        &self,
        token_value: &str,
        sub_order_id: Uuid,
    ) -> Result<VerifyOutcome, AppError> {
        crate::proof::verify(&self.state, token_value, sub_order_id)
    }
}

/// Talks to the backend's `POST /proof/verify` with a bounded timeout; I/O
/// failures surface as `TransientNetwork` so the caller re-queues.
pub struct HttpVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVerifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Internal(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl ProofVerifier for HttpVerifier {
    async fn verify(
        &self,
        token_value: &str,
        sub_order_id: Uuid,
    ) -> Result<VerifyOutcome, AppError> {
        let response = self
            .client
            .post(format!("{}/proof/verify", self.base_url))
            .json(&serde_json::json!({
                "token_value": token_value,
                "sub_order_id": sub_order_id,
            }))
            .send()
            .await
            .map_err(|err| AppError::TransientNetwork(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(VerifyOutcome { accepted: true });
        }
        if status.is_client_error() {
            // 410 and friends: the token is gone for good.
            return Err(AppError::TokenInvalid(format!("server said {status}")));
        }
        Err(AppError::TransientNetwork(format!("server said {status}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Completed {
        accepted: usize,
        rejected: usize,
        deferred: usize,
    },
    /// Another flush is in progress; this invocation did nothing.
    AlreadyRunning,
}

pub struct OfflineQueue {
    store: OfflineStore,
    flushing: AtomicBool,
}

impl OfflineQueue {
    pub fn new(store: OfflineStore) -> Self {
        Self {
            store,
            flushing: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    /// Captures a verification attempt made without connectivity.
    /// Returns false when the same `(token, sub_order)` is already queued.
    pub fn capture(&self, token_value: &str, sub_order_id: Uuid) -> Result<bool, StoreError> {
        let now = Utc::now();
        self.store.enqueue(&OfflineQueueItem {
            token_value: token_value.to_string(),
            sub_order_id,
            captured_at: now,
            retry_count: 0,
            next_attempt_at: now,
        })
    }

    /// Submits every due item to the verifier. Accepted and terminally
    /// rejected items leave the queue; transient failures stay with a bumped
    /// retry count and a backoff-delayed next attempt. Single-flight: a
    /// concurrent second call is a no-op.
    pub async fn flush<V: ProofVerifier>(
        &self,
        verifier: &V,
    ) -> Result<FlushOutcome, StoreError> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(FlushOutcome::AlreadyRunning);
        }

        let result = self.flush_inner(verifier).await;
        self.flushing.store(false, Ordering::Release);
        result
    }

    async fn flush_inner<V: ProofVerifier>(
        &self,
        verifier: &V,
    ) -> Result<FlushOutcome, StoreError> {
        let now = Utc::now();
        let mut accepted = 0;
        let mut rejected = 0;
        let mut deferred = 0;

        for item in self.store.list()? {
            if !is_due(&item, now) {
                deferred += 1;
                continue;
            }

            match verifier.verify(&item.token_value, item.sub_order_id).await {
                Ok(outcome) => {
                    self.store.remove(&item.token_value, item.sub_order_id)?;
                    accepted += 1;
                    info!(
                        sub_order_id = %item.sub_order_id,
                        accepted = outcome.accepted,
                        "queued verification reconciled"
                    );
                }
                Err(err) if err.is_retryable() => {
                    let delay = backoff_delay(item.retry_count);
                    self.store
                        .reschedule(&item.token_value, item.sub_order_id, now + delay)?;
                    deferred += 1;
                    warn!(
                        sub_order_id = %item.sub_order_id,
                        retry_count = item.retry_count + 1,
                        error = %err,
                        "verification deferred"
                    );
                }
                // Terminal: expired, consumed elsewhere, or otherwise rejected.
                Err(err) => {
                    self.store.remove(&item.token_value, item.sub_order_id)?;
                    rejected += 1;
                    warn!(
                        sub_order_id = %item.sub_order_id,
                        error = %err,
                        "queued verification permanently rejected"
                    );
                }
            }
        }

        Ok(FlushOutcome::Completed {
            accepted,
            rejected,
            deferred,
        })
    }
}

fn backoff_delay(retry_count: u32) -> ChronoDuration {
    let exp = retry_count.min(16);
    let secs = BACKOFF_BASE_SECS
        .saturating_mul(1u64 << exp)
        .min(BACKOFF_CAP_SECS);
    ChronoDuration::seconds(secs as i64)
}

/// True when the item is eligible for submission at `now`.
pub fn is_due(item: &OfflineQueueItem, now: DateTime<Utc>) -> bool {
    item.next_attempt_at <= now
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use chrono::Utc;
    use uuid::Uuid;

    use super::store::OfflineStore;
    use super::{backoff_delay, FlushOutcome, HttpVerifier, OfflineQueue, ProofVerifier};
    use crate::error::AppError;
    use crate::proof::VerifyOutcome;

    /// Scripted verifier: answers per call, counting submissions.
    struct ScriptedVerifier {
        responses: Vec<Result<VerifyOutcome, AppError>>,
        calls: AtomicUsize,
    }

    impl ScriptedVerifier {
        fn new(responses: Vec<Result<VerifyOutcome, AppError>>) -> Self {
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ProofVerifier for ScriptedVerifier {
        async fn verify(
            &self,
            _token_value: &str,
            _sub_order_id: Uuid,
        ) -> Result<VerifyOutcome, AppError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(index) {
                Some(Ok(outcome)) => Ok(*outcome),
                Some(Err(AppError::TokenInvalid(msg))) => {
                    Err(AppError::TokenInvalid(msg.clone()))
                }
                Some(Err(_)) | None => {
                    Err(AppError::TransientNetwork("scripted outage".to_string()))
                }
            }
        }
    }

    fn queue() -> OfflineQueue {
        OfflineQueue::new(OfflineStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn accepted_items_leave_the_queue() {
        let queue = queue();
        let sub_order_id = Uuid::new_v4();
        queue.capture("t1", sub_order_id).unwrap();

        let verifier = ScriptedVerifier::new(vec![Ok(VerifyOutcome { accepted: true })]);
        let outcome = queue.flush(&verifier).await.unwrap();

        assert_eq!(
            outcome,
            FlushOutcome::Completed {
                accepted: 1,
                rejected: 0,
                deferred: 0
            }
        );
        assert!(queue.store().is_empty().unwrap());
    }

    #[tokio::test]
    async fn terminal_rejection_also_drains_the_item() {
        let queue = queue();
        let sub_order_id = Uuid::new_v4();
        queue.capture("t1", sub_order_id).unwrap();

        let verifier =
            ScriptedVerifier::new(vec![Err(AppError::TokenInvalid("expired".to_string()))]);
        let outcome = queue.flush(&verifier).await.unwrap();

        assert_eq!(
            outcome,
            FlushOutcome::Completed {
                accepted: 0,
                rejected: 1,
                deferred: 0
            }
        );
        assert!(queue.store().is_empty().unwrap());
    }

    #[tokio::test]
    async fn transient_failure_keeps_the_item_with_backoff() {
        let queue = queue();
        let sub_order_id = Uuid::new_v4();
        queue.capture("t1", sub_order_id).unwrap();

        let verifier = ScriptedVerifier::new(vec![Err(AppError::TransientNetwork(
            "offline".to_string(),
        ))]);
        let outcome = queue.flush(&verifier).await.unwrap();

        assert_eq!(
            outcome,
            FlushOutcome::Completed {
                accepted: 0,
                rejected: 0,
                deferred: 1
            }
        );
        let items = queue.store().list().unwrap();
        assert_eq!(items[0].retry_count, 1);
        assert!(items[0].next_attempt_at > Utc::now());

        // Not yet due, so a second flush submits nothing.
        let verifier = ScriptedVerifier::new(vec![]);
        queue.flush(&verifier).await.unwrap();
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flush_is_single_flight() {
        let queue = Arc::new(queue());
        queue.capture("t1", Uuid::new_v4()).unwrap();

        // Simulate an in-progress flush and check the second call backs off.
        queue
            .flushing
            .store(true, std::sync::atomic::Ordering::Release);
        let verifier = ScriptedVerifier::new(vec![Ok(VerifyOutcome { accepted: true })]);
        let outcome = queue.flush(&verifier).await.unwrap();
        assert_eq!(outcome, FlushOutcome::AlreadyRunning);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
        queue
            .flushing
            .store(false, std::sync::atomic::Ordering::Release);

        let outcome = queue.flush(&verifier).await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Completed {
                accepted: 1,
                rejected: 0,
                deferred: 0
            }
        );
    }

    /// Binds an ephemeral-port endpoint that answers every verification with
    /// the given status.
    async fn scripted_endpoint(status: StatusCode) -> String {
        let app = axum::Router::new().route(
            "/proof/verify",
            axum::routing::post(move || async move { status }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_verifier_accepts_success_responses() {
        let base_url = scripted_endpoint(StatusCode::OK).await;
        let verifier = HttpVerifier::new(base_url, Duration::from_secs(2)).unwrap();

        let outcome = verifier.verify("t1", Uuid::new_v4()).await.unwrap();
        assert!(outcome.accepted);
    }

    #[tokio::test]
    async fn http_verifier_maps_client_errors_to_token_invalid() {
        let base_url = scripted_endpoint(StatusCode::GONE).await;
        let verifier = HttpVerifier::new(base_url, Duration::from_secs(2)).unwrap();

        let err = verifier.verify("t1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::TokenInvalid(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn http_verifier_maps_server_errors_to_transient() {
        let base_url = scripted_endpoint(StatusCode::SERVICE_UNAVAILABLE).await;
        let verifier = HttpVerifier::new(base_url, Duration::from_secs(2)).unwrap();

        let err = verifier.verify("t1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::TransientNetwork(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn http_verifier_maps_unreachable_server_to_transient() {
        // Grab a port and close it again so the connect is refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let verifier =
            HttpVerifier::new(format!("http://{addr}"), Duration::from_millis(500)).unwrap();
        let err = verifier.verify("t1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::TransientNetwork(_)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0).num_seconds(), 5);
        assert_eq!(backoff_delay(1).num_seconds(), 10);
        assert_eq!(backoff_delay(2).num_seconds(), 20);
        assert_eq!(backoff_delay(10).num_seconds(), 300);
        assert_eq!(backoff_delay(u32::MAX).num_seconds(), 300);
    }
}
