//! Usage: Single-flight access-token refresh shared by every request of one session.
//!
//! The first caller that needs a refresh while the coordinator is `Idle` flips it
//! to `Refreshing` under the state mutex and spawns the driver task; everyone
//! arriving before the driver finishes subscribes to the same outcome. The driver
//! updates the session, returns the coordinator to `Idle`, and only then
//! publishes the outcome, so no waiter can see a token older than the session.
//!
//! The driver runs detached from every caller: a caller that gives up (timeout,
//! dropped future) only drops its own receiver.

use super::refresher::{RefreshError, RefreshRequest, TokenRefresher};
use crate::session::{InvalidationReason, Session, TokenSet};
use crate::shared::error::{ApiError, ApiResult, AuthFailureReason};
use crate::shared::lock_ext::MutexExt;
use crate::shared::security::mask_optional_token;
use crate::shared::time::duration_millis;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_REFRESH_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

type RefreshOutcome = Result<String, AuthFailureReason>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub timeout: Duration,
    /// Attempts on transport failure; rejections are never retried.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REFRESH_TIMEOUT,
            max_attempts: DEFAULT_REFRESH_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_REFRESH_RETRY_BASE_DELAY,
        }
    }
}

enum FlightState {
    Idle,
    Refreshing {
        outcome: watch::Receiver<Option<RefreshOutcome>>,
        joins: usize,
        /// One clone per caller still awaiting the outcome.
        live: Arc<()>,
        started_at: Instant,
    },
}

enum Join {
    Ready(String),
    Wait {
        outcome: watch::Receiver<Option<RefreshOutcome>>,
        ticket: Arc<()>,
    },
}

struct CoordinatorInner {
    session: Arc<Session>,
    refresher: Arc<dyn TokenRefresher>,
    policy: RefreshPolicy,
    state: Mutex<FlightState>,
    refresh_runs: AtomicU64,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("policy", &self.inner.policy)
            .field("refreshing", &self.is_refreshing())
            .field("refresh_runs", &self.refresh_runs())
            .finish()
    }
}

impl RefreshCoordinator {
    pub fn new(
        session: Arc<Session>,
        refresher: Arc<dyn TokenRefresher>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                session,
                refresher,
                policy,
                state: Mutex::new(FlightState::Idle),
                refresh_runs: AtomicU64::new(0),
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.inner.policy
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(
            *self.inner.state.lock_or_recover(),
            FlightState::Refreshing { .. }
        )
    }

    /// Callers still awaiting the in-flight refresh; cancelled callers drop out (0 when idle).
    pub fn pending_waiters(&self) -> usize {
        match &*self.inner.state.lock_or_recover() {
            FlightState::Idle => 0,
            FlightState::Refreshing { live, .. } => Arc::strong_count(live).saturating_sub(1),
        }
    }

    pub fn refresh_runs(&self) -> u64 {
        self.inner.refresh_runs.load(Ordering::SeqCst)
    }

    /// Obtain an access token newer than `observed_access_token`.
    ///
    /// `observed_access_token` is the token the caller's rejected request carried.
    /// If the session already holds a different token (a refresh or login landed
    /// after that request was sent) it is returned without a network call.
    /// Otherwise the caller joins the in-flight refresh or starts one.
    pub async fn ensure_refreshed(&self, observed_access_token: Option<&str>) -> ApiResult<String> {
        let (mut outcome_rx, _ticket) = match self.join_or_start(observed_access_token)? {
            Join::Ready(token) => return Ok(token),
            Join::Wait { outcome, ticket } => (outcome, ticket),
        };

        let outcome = match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(token)) => Ok(token),
            Some(Err(reason)) => Err(ApiError::auth_required(reason)),
            None => Err(ApiError::auth_required(AuthFailureReason::RefreshAborted)),
        }
    }

    fn join_or_start(&self, observed_access_token: Option<&str>) -> ApiResult<Join> {
        let mut state = self.inner.state.lock_or_recover();

        if let FlightState::Refreshing {
            outcome,
            joins,
            live,
            ..
        } = &mut *state
        {
            *joins += 1;
            tracing::debug!(joins = *joins, "joined in-flight token refresh");
            return Ok(Join::Wait {
                outcome: outcome.clone(),
                ticket: Arc::clone(live),
            });
        }

        let snapshot = self.inner.session.snapshot();
        if let Some(current) = snapshot.access_token.as_deref() {
            if observed_access_token.map(str::trim) != Some(current) {
                tracing::debug!(
                    observed = %mask_optional_token(observed_access_token),
                    current = %mask_optional_token(Some(current)),
                    "session token already replaced; skipping refresh"
                );
                return Ok(Join::Ready(current.to_string()));
            }
        }

        let Some(refresh_token) = snapshot.refresh_token else {
            tracing::debug!(
                generation = snapshot.generation,
                "no refresh token in session; refresh not attempted"
            );
            return Err(ApiError::auth_required(AuthFailureReason::NoRefreshToken));
        };

        let (tx, rx) = watch::channel(None);
        let live = Arc::new(());
        *state = FlightState::Refreshing {
            outcome: rx.clone(),
            joins: 1,
            live: Arc::clone(&live),
            started_at: Instant::now(),
        };
        drop(state);

        let request = RefreshRequest {
            access_token: snapshot.access_token,
            refresh_token,
        };
        let run = self.inner.refresh_runs.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            run,
            generation = snapshot.generation,
            "access token rejected; starting token refresh"
        );

        let driver = DriverGuard {
            inner: Arc::clone(&self.inner),
            tx: Some(tx),
        };
        tokio::spawn(drive_refresh(driver, request, snapshot.generation));

        Ok(Join::Wait {
            outcome: rx,
            ticket: live,
        })
    }
}

/// Publishes the outcome exactly once; a driver dropped mid-flight reports `RefreshAborted`.
struct DriverGuard {
    inner: Arc<CoordinatorInner>,
    tx: Option<watch::Sender<Option<RefreshOutcome>>>,
}

impl DriverGuard {
    fn finish(&mut self, outcome: RefreshOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let (joins, elapsed_ms) = {
            let mut state = self.inner.state.lock_or_recover();
            let stats = match &*state {
                FlightState::Refreshing {
                    joins,
                    started_at,
                    ..
                } => (
                    *joins,
                    duration_millis(started_at.elapsed()),
                ),
                FlightState::Idle => (0, 0),
            };
            *state = FlightState::Idle;
            stats
        };

        match &outcome {
            Ok(_) => tracing::info!(joins, elapsed_ms, "token refresh succeeded"),
            Err(reason) => tracing::warn!(
                joins,
                elapsed_ms,
                reason = %reason,
                "token refresh failed; waiters resolved with authentication required"
            ),
        }

        // Receivers may all be gone (callers cancelled); the outcome is simply dropped.
        tx.send_replace(Some(outcome));
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::error!("token refresh driver stopped before completing");
            self.finish(Err(AuthFailureReason::RefreshAborted));
        }
    }
}

async fn drive_refresh(mut driver: DriverGuard, request: RefreshRequest, generation: u64) {
    let inner = Arc::clone(&driver.inner);
    let policy = inner.policy;

    let result = match tokio::time::timeout(
        policy.timeout,
        refresh_with_linear_retry(inner.refresher.as_ref(), &request, policy),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(RefreshError::Timeout(policy.timeout)),
    };

    let outcome = match result {
        Ok(tokens) => apply_refreshed_tokens(&inner.session, generation, &request, tokens),
        Err(err) => {
            let reason = err.auth_reason();
            tracing::warn!(reason = %reason, "token refresh failed: {}", err);
            let cleared = inner.session.invalidate_if_generation(
                generation,
                InvalidationReason::AuthenticationFailed(reason),
            );
            if cleared.is_none() {
                tracing::info!("session re-seeded during failed refresh; keeping new tokens");
            }
            Err(reason)
        }
    };

    driver.finish(outcome);
}

fn apply_refreshed_tokens(
    session: &Session,
    generation: u64,
    request: &RefreshRequest,
    tokens: TokenSet,
) -> RefreshOutcome {
    // A response without a rotated refresh token keeps the one we sent.
    let merged = TokenSet {
        refresh_token: tokens
            .refresh_token
            .or_else(|| Some(request.refresh_token.clone())),
        ..tokens
    };

    match session.replace_if_generation(generation, &merged) {
        Ok(_) => session
            .access_token()
            .ok_or(AuthFailureReason::RefreshInvalidResponse),
        // Login or logout raced the refresh: the session's own state wins.
        Err(current) => {
            tracing::info!(
                generation,
                current_generation = current.generation,
                "session changed during refresh; discarding refreshed tokens"
            );
            current.access_token.ok_or(AuthFailureReason::RefreshAborted)
        }
    }
}

async fn refresh_with_linear_retry(
    refresher: &dyn TokenRefresher,
    request: &RefreshRequest,
    policy: RefreshPolicy,
) -> Result<TokenSet, RefreshError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match refresher.refresh(request).await {
            Ok(tokens) => return Ok(tokens),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.retry_base_delay.saturating_mul(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = duration_millis(delay),
                    "token refresh failed; retrying: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::refresher::RefreshFuture;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Refresher that blocks until released, counting calls.
    struct GatedRefresher {
        calls: AtomicUsize,
        release: Notify,
        result: Result<TokenSet, RefreshError>,
    }

    impl GatedRefresher {
        fn new(result: Result<TokenSet, RefreshError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                release: Notify::new(),
                result,
            })
        }
    }

    impl TokenRefresher for GatedRefresher {
        fn refresh<'a>(&'a self, _request: &'a RefreshRequest) -> RefreshFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.release.notified().await;
                self.result.clone()
            })
        }
    }

    fn seeded_session() -> Arc<Session> {
        let session = Arc::new(Session::new());
        session.set_tokens("expired", Some("refresh-1"));
        session
    }

    async fn wait_until_refreshing(coordinator: &RefreshCoordinator, waiters: usize) {
        for _ in 0..200 {
            if coordinator.pending_waiters() >= waiters {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("coordinator never reached {waiters} waiters");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let session = seeded_session();
        let refresher = GatedRefresher::new(Ok(TokenSet::new("fresh", None)));
        let coordinator =
            RefreshCoordinator::new(session.clone(), refresher.clone(), RefreshPolicy::default());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.ensure_refreshed(Some("expired")).await
            }));
        }
        wait_until_refreshing(&coordinator, 5).await;
        refresher.release.notify_one();

        for handle in handles {
            assert_eq!(handle.await.expect("join").expect("refreshed"), "fresh");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_runs(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(session.access_token().as_deref(), Some("fresh"));
        // Refresh token was not rotated, so the original one is kept.
        assert_eq!(session.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn failed_refresh_clears_session_and_fails_fast_afterwards() {
        let session = seeded_session();
        let mut invalidations = session.subscribe_invalidation();
        let refresher = GatedRefresher::new(Err(RefreshError::Rejected {
            status: 401,
            code: Some("invalid_grant".to_string()),
            message: None,
        }));
        let coordinator =
            RefreshCoordinator::new(session.clone(), refresher.clone(), RefreshPolicy::default());

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_refreshed(Some("expired")).await })
        };
        wait_until_refreshing(&coordinator, 1).await;
        refresher.release.notify_one();

        let err = first.await.expect("join").expect_err("refresh failed");
        assert_eq!(
            err.auth_failure_reason(),
            Some(AuthFailureReason::RefreshRejected { status: 401 })
        );
        assert!(!session.is_authenticated());
        assert!(!session.has_refresh_token());
        assert!(matches!(
            invalidations.try_recv().expect("one invalidation").reason,
            InvalidationReason::AuthenticationFailed(AuthFailureReason::RefreshRejected {
                status: 401
            })
        ));

        let err = coordinator
            .ensure_refreshed(Some("expired"))
            .await
            .expect_err("no refresh token left");
        assert_eq!(err.auth_failure_reason(), Some(AuthFailureReason::NoRefreshToken));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(invalidations.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_observation_returns_current_token_without_refresh() {
        let session = seeded_session();
        session.set_tokens("already-fresh", Some("refresh-2"));
        let refresher = GatedRefresher::new(Ok(TokenSet::new("unused", None)));
        let coordinator =
            RefreshCoordinator::new(session, refresher.clone(), RefreshPolicy::default());

        let token = coordinator
            .ensure_refreshed(Some("expired"))
            .await
            .expect("current token");
        assert_eq!(token, "already-fresh");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_cancel_driver() {
        let session = seeded_session();
        let refresher = GatedRefresher::new(Ok(TokenSet::new("fresh", Some("rotated".to_string()))));
        let coordinator =
            RefreshCoordinator::new(session.clone(), refresher.clone(), RefreshPolicy::default());

        let impatient = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.ensure_refreshed(Some("expired")),
        )
        .await;
        assert!(impatient.is_err(), "caller should time out");
        assert!(coordinator.is_refreshing());
        assert_eq!(coordinator.pending_waiters(), 0);

        let patient = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_refreshed(Some("expired")).await })
        };
        wait_until_refreshing(&coordinator, 1).await;
        assert_eq!(coordinator.pending_waiters(), 1);
        refresher.release.notify_one();

        assert_eq!(patient.await.expect("join").expect("refreshed"), "fresh");
        assert_eq!(session.refresh_token().as_deref(), Some("rotated"));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_timeout_is_a_refresh_failure() {
        let session = seeded_session();
        // Never released: only the policy deadline ends the call.
        let refresher = GatedRefresher::new(Ok(TokenSet::new("never", None)));
        let policy = RefreshPolicy {
            timeout: Duration::from_millis(30),
            ..RefreshPolicy::default()
        };
        let coordinator = RefreshCoordinator::new(session.clone(), refresher, policy);

        let err = coordinator
            .ensure_refreshed(Some("expired"))
            .await
            .expect_err("timed out");
        assert_eq!(err.auth_failure_reason(), Some(AuthFailureReason::RefreshTimeout));
        assert!(!session.is_authenticated());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn login_during_failed_refresh_is_preserved() {
        let session = seeded_session();
        let refresher = GatedRefresher::new(Err(RefreshError::Transport("reset".to_string())));
        let coordinator =
            RefreshCoordinator::new(session.clone(), refresher.clone(), RefreshPolicy::default());

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_refreshed(Some("expired")).await })
        };
        wait_until_refreshing(&coordinator, 1).await;
        session.set_tokens("relogged", Some("refresh-new"));
        refresher.release.notify_one();

        let err = pending.await.expect("join").expect_err("refresh failed");
        assert_eq!(err.auth_failure_reason(), Some(AuthFailureReason::RefreshTransport));
        assert_eq!(session.access_token().as_deref(), Some("relogged"));
    }

    struct FlakyRefresher {
        calls: AtomicUsize,
        failures_before_success: usize,
    }

    impl TokenRefresher for FlakyRefresher {
        fn refresh<'a>(&'a self, _request: &'a RefreshRequest) -> RefreshFuture<'a> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures_before_success {
                    Err(RefreshError::Transport("connection reset".to_string()))
                } else {
                    Ok(TokenSet::new("fresh", None))
                }
            })
        }
    }

    #[tokio::test]
    async fn driver_retries_transport_failures_when_configured() {
        let session = seeded_session();
        let refresher = Arc::new(FlakyRefresher {
            calls: AtomicUsize::new(0),
            failures_before_success: 2,
        });
        let policy = RefreshPolicy {
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            ..RefreshPolicy::default()
        };
        let coordinator = RefreshCoordinator::new(session, refresher.clone(), policy);

        let token = coordinator
            .ensure_refreshed(Some("expired"))
            .await
            .expect("third attempt succeeds");
        assert_eq!(token, "fresh");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.refresh_runs(), 1);
    }

    #[tokio::test]
    async fn default_policy_does_not_retry() {
        let session = seeded_session();
        let refresher = Arc::new(FlakyRefresher {
            calls: AtomicUsize::new(0),
            failures_before_success: 1,
        });
        let coordinator =
            RefreshCoordinator::new(session, refresher.clone(), RefreshPolicy::default());

        let err = coordinator
            .ensure_refreshed(Some("expired"))
            .await
            .expect_err("fail fast");
        assert_eq!(err.auth_failure_reason(), Some(AuthFailureReason::RefreshTransport));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }
}
