//! Command layer: outbound operations with deadline, bounded retry, and a
//! debounce guard.
//!
//! Query fetches are debounced and latch after exhausting their retries
//! until the next forced call; mutating actions always run and layer the
//! optimistic pattern from [`crate::optimistic`] on top. Retries back off
//! linearly (`retry_delay × attempt`), unlike the channel's exponential
//! reconnect backoff; the two shapes are intentionally different.

mod chat;
mod devices;
mod session;
mod timeline;
mod transport;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use jamroom_shared::ApiError;

use crate::api_client::ApiClient;
use crate::scope::Scope;
use crate::store::{StatePatch, Store};

/// Timing and bounds for every command issued through this layer.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    /// Minimum interval between two effective invocations of the same
    /// fetch operation; redundant calls inside it are suppressed.
    pub debounce: Duration,
    /// Per-attempt deadline. A timed-out attempt fails like a network
    /// error and is retried the same way.
    pub timeout: Duration,
    /// Attempts before the operation stops retrying and surfaces a
    /// terminal, domain-scoped error.
    pub max_retries: u32,
    /// Linear backoff unit between attempts.
    pub retry_delay: Duration,
    /// Interval for the transport poll loop while playback is active.
    pub poll_interval: Duration,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(750),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Terminal failure of a command. Recoverable failures are retried
/// internally and never reach the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The owning scope closed while the operation was in flight.
    Cancelled,
    /// Every attempt failed; a domain-scoped error has been recorded.
    Exhausted {
        op: &'static str,
        attempts: u32,
        source: ApiError,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Cancelled => write!(f, "operation cancelled"),
            CommandError::Exhausted {
                op,
                attempts,
                source,
            } => write!(f, "{op} failed after {attempts} attempts: {source}"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Exhausted { source, .. } => Some(source),
            CommandError::Cancelled => None,
        }
    }
}

/// Result of a debounced fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Fetched(T),
    /// Suppressed without any network I/O: either inside the debounce
    /// window, or latched terminal until the next forced call.
    Skipped,
}

#[derive(Debug, Default)]
struct OpState {
    retry_count: u32,
    last_attempt: Option<Instant>,
}

/// Per-operation retry/debounce bookkeeping.
pub(crate) struct Retrier {
    pub(crate) policy: CommandPolicy,
    states: Mutex<HashMap<&'static str, OpState>>,
}

impl Retrier {
    fn new(policy: CommandPolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, OpState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Debounced, latching query. `force` bypasses the debounce window and
    /// resets a terminal retry counter.
    pub(crate) async fn fetch<T, F, Fut>(
        &self,
        scope: &Scope,
        op: &'static str,
        force: bool,
        f: F,
    ) -> Result<FetchOutcome<T>, CommandError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        {
            let mut states = self.lock_states();
            let state = states.entry(op).or_default();
            if force {
                state.retry_count = 0;
            } else if state.retry_count >= self.policy.max_retries {
                debug!(op, "skipping: terminal until a forced call");
                return Ok(FetchOutcome::Skipped);
            } else if let Some(at) = state.last_attempt {
                if at.elapsed() < self.policy.debounce {
                    debug!(op, "skipping: inside the debounce window");
                    return Ok(FetchOutcome::Skipped);
                }
            }
            state.last_attempt = Some(Instant::now());
        }
        self.attempt_loop(scope, op, f).await.map(FetchOutcome::Fetched)
    }

    /// One-shot mutating command: no debounce, counter reset at entry.
    pub(crate) async fn action<T, F, Fut>(
        &self,
        scope: &Scope,
        op: &'static str,
        f: F,
    ) -> Result<T, CommandError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        {
            let mut states = self.lock_states();
            let state = states.entry(op).or_default();
            state.retry_count = 0;
            state.last_attempt = Some(Instant::now());
        }
        self.attempt_loop(scope, op, f).await
    }

    async fn attempt_loop<T, F, Fut>(
        &self,
        scope: &Scope,
        op: &'static str,
        mut f: F,
    ) -> Result<T, CommandError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        loop {
            if scope.is_closed() {
                return Err(CommandError::Cancelled);
            }
            let result = tokio::select! {
                _ = scope.cancelled() => return Err(CommandError::Cancelled),
                attempt = tokio::time::timeout(self.policy.timeout, f()) => match attempt {
                    Ok(inner) => inner,
                    Err(_) => Err(ApiError::Network("request deadline exceeded".to_string())),
                },
            };
            match result {
                Ok(value) => {
                    self.lock_states().entry(op).or_default().retry_count = 0;
                    return Ok(value);
                }
                Err(err) => {
                    let attempts = {
                        let mut states = self.lock_states();
                        let state = states.entry(op).or_default();
                        state.retry_count += 1;
                        state.retry_count
                    };
                    if attempts >= self.policy.max_retries {
                        warn!(op, attempts, error = %err, "command exhausted its retries");
                        return Err(CommandError::Exhausted {
                            op,
                            attempts,
                            source: err,
                        });
                    }
                    // Linear backoff, unlike the channel's exponential one.
                    let delay = self.policy.retry_delay * attempts;
                    debug!(op, attempts, delay_ms = delay.as_millis() as u64, "retrying command");
                    tokio::select! {
                        _ = scope.cancelled() => return Err(CommandError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// The command surface: every outbound operation against the server goes
/// through this. Cheap to clone; clones share retry state and the store.
#[derive(Clone)]
pub struct Commands {
    api: ApiClient,
    store: Store,
    retrier: Arc<Retrier>,
}

impl Commands {
    pub fn new(api: ApiClient, store: Store, policy: CommandPolicy) -> Self {
        Self {
            api,
            store,
            retrier: Arc::new(Retrier::new(policy)),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn api(&self) -> &ApiClient {
        &self.api
    }

    pub(crate) fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    /// Shared shape of every debounced query: run the fetch, write the
    /// result (or the terminal error) into the owning domain, and never
    /// touch the store after the scope has closed.
    pub(crate) async fn fetch_into<T, F, Fut>(
        &self,
        scope: &Scope,
        op: &'static str,
        force: bool,
        f: F,
        on_success: impl FnOnce(&T) -> StatePatch,
        on_error: impl FnOnce(String) -> StatePatch,
    ) -> Result<Option<T>, CommandError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match self.retrier.fetch(scope, op, force, f).await {
            Ok(FetchOutcome::Fetched(value)) => {
                if scope.is_closed() {
                    return Err(CommandError::Cancelled);
                }
                self.store.apply(on_success(&value));
                Ok(Some(value))
            }
            Ok(FetchOutcome::Skipped) => Ok(None),
            Err(err) => {
                if let CommandError::Exhausted { source, .. } = &err {
                    if !scope.is_closed() {
                        self.store.apply(on_error(source.user_message()));
                    }
                }
                Err(err)
            }
        }
    }

    /// Record a terminal error into a domain unless the scope closed.
    pub(crate) fn record_error(
        &self,
        scope: &Scope,
        err: &CommandError,
        patch: impl FnOnce(String) -> StatePatch,
    ) {
        if let CommandError::Exhausted { source, .. } = err {
            if !scope.is_closed() {
                self.store.apply(patch(source.user_message()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn retrier(policy: CommandPolicy) -> Retrier {
        Retrier::new(policy)
    }

    fn quick_policy() -> CommandPolicy {
        CommandPolicy {
            debounce: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            poll_interval: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_suppresses_calls_inside_the_window() {
        let retrier = retrier(quick_policy());
        let scope = Scope::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |force: bool| {
            let calls = calls.clone();
            let retrier = &retrier;
            let scope = &scope;
            async move {
                retrier
                    .fetch(scope, "test.fetch", force, move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ApiError>(42)
                        }
                    })
                    .await
            }
        };

        assert_eq!(run(false).await.unwrap(), FetchOutcome::Fetched(42));
        assert_eq!(run(false).await.unwrap(), FetchOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Forced calls bypass the window.
        assert_eq!(run(true).await.unwrap(), FetchOutcome::Fetched(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // After the window a plain call goes through again.
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(run(false).await.unwrap(), FetchOutcome::Fetched(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_with_linear_backoff_then_latch() {
        let retrier = retrier(quick_policy());
        let scope = Scope::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();
        let stamps: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));

        let err = {
            let calls = calls.clone();
            let stamps = stamps.clone();
            retrier
                .fetch(&scope, "test.failing", true, move || {
                    let calls = calls.clone();
                    let stamps = stamps.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        stamps.lock().unwrap().push(started.elapsed());
                        Err::<(), _>(ApiError::Network("refused".to_string()))
                    }
                })
                .await
                .expect_err("must exhaust")
        };
        assert_eq!(
            err,
            CommandError::Exhausted {
                op: "test.failing",
                attempts: 3,
                source: ApiError::Network("refused".to_string()),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Attempt spacing is retry_delay × attempt number.
        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps[0], Duration::ZERO);
        assert_eq!(stamps[1], Duration::from_millis(100));
        assert_eq!(stamps[2], Duration::from_millis(300));

        // Terminal: plain calls are suppressed without network I/O...
        tokio::time::advance(Duration::from_secs(60)).await;
        let outcome: FetchOutcome<()> = retrier
            .fetch(&scope, "test.failing", false, || async {
                panic!("must not be called")
            })
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped);

        // ...until a forced call resets the counter.
        let outcome = retrier
            .fetch(&scope, "test.failing", true, || async { Ok::<_, ApiError>(7) })
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched(7));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempts_fail_like_network_errors() {
        let mut policy = quick_policy();
        policy.timeout = Duration::from_millis(50);
        policy.max_retries = 2;
        let retrier = retrier(policy);
        let scope = Scope::new();

        let err = retrier
            .fetch(&scope, "test.slow", true, || async {
                std::future::pending::<()>().await;
                Ok::<_, ApiError>(())
            })
            .await
            .expect_err("must exhaust");
        match err {
            CommandError::Exhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(
                    source,
                    ApiError::Network("request deadline exceeded".to_string())
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_scope_cancels_a_pending_retry() {
        let retrier = retrier(quick_policy());
        let scope = Scope::new();

        let err = {
            let scope_inner = scope.clone();
            retrier
                .fetch(&scope, "test.cancelled", true, move || {
                    let scope_inner = scope_inner.clone();
                    async move {
                        // Tear the owner down while the retry is pending.
                        scope_inner.close();
                        Err::<(), _>(ApiError::Network("refused".to_string()))
                    }
                })
                .await
                .expect_err("must cancel")
        };
        assert_eq!(err, CommandError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_retry_counter() {
        let retrier = retrier(quick_policy());
        let scope = Scope::new();
        let calls = Arc::new(AtomicUsize::new(0));

        // Fail twice, then succeed on the final allowed attempt.
        let outcome = {
            let calls = calls.clone();
            retrier
                .fetch(&scope, "test.flaky", true, move || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ApiError::Network("refused".to_string()))
                        } else {
                            Ok(1)
                        }
                    }
                })
                .await
                .unwrap()
        };
        assert_eq!(outcome, FetchOutcome::Fetched(1));

        // The counter is back at zero: a fresh failing run gets the full
        // retry budget again.
        tokio::time::advance(Duration::from_secs(1)).await;
        let calls2 = Arc::new(AtomicUsize::new(0));
        let err = {
            let calls2 = calls2.clone();
            retrier
                .fetch(&scope, "test.flaky", false, move || {
                    let calls2 = calls2.clone();
                    async move {
                        calls2.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ApiError::Network("refused".to_string()))
                    }
                })
                .await
                .expect_err("must exhaust")
        };
        assert!(matches!(err, CommandError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls2.load(Ordering::SeqCst), 3);
    }
}
