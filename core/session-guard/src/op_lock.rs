//! Per-key mutual exclusion for mutating API calls.
//!
//! Every create/update/delete call site wraps its request in
//! [`OperationLockRegistry::execute`]. For a given key at most one execution is
//! in flight; any caller arriving while it runs (or within the grace window
//! after it settles) joins it and receives the same result.
//!
//! ```text
//! caller A ──acquire──► [entry: in flight] ──run + retry──► settled ──grace──► removed
//! caller B ──acquire──────────┘ join                            │
//! caller C ──acquire────────────────────────────────────────────┘ join (cached)
//! ```
//!
//! The operation runs on its own task, so it completes even if every caller
//! stops waiting. Authentication failures are never retried: a retry cannot
//! change the outcome and would skew the gate's failure counters.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{OperationError, TransportError};
use crate::lock_state;

type SharedValue = Arc<dyn Any + Send + Sync>;
type SharedOutcome = Result<SharedValue, OperationError>;
type InFlight = Shared<BoxFuture<'static, SharedOutcome>>;

struct LockEntry {
    acquired_at: Instant,
    generation: u64,
    in_flight: InFlight,
    settled_at: Option<Instant>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, LockEntry>,
    last_used: HashMap<String, Instant>,
    next_generation: u64,
}

impl Registry {
    fn prune(&mut self, now: Instant, config: &LockConfig) {
        let grace = config.grace();
        self.entries.retain(|_, entry| match entry.settled_at {
            Some(settled_at) => now.duration_since(settled_at) < grace,
            None => true,
        });

        let window = config.recent_use_window();
        self.last_used
            .retain(|_, used_at| now.duration_since(*used_at) < window);
    }

    fn settle(&mut self, key: &str, generation: u64, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.generation == generation {
                entry.settled_at = Some(now);
            }
        }
        self.last_used.insert(key.to_string(), now);
    }
}

enum Acquire {
    Join(InFlight),
    Wait,
    Reserved {
        in_flight: InFlight,
        generation: u64,
        sender: oneshot::Sender<SharedOutcome>,
    },
}

/// Read-only view of the registry for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LockSnapshot {
    pub in_flight: Vec<LockEntrySnapshot>,
    pub settled: Vec<String>,
    pub recently_used: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LockEntrySnapshot {
    pub key: String,
    pub held_ms: u64,
}

pub struct OperationLockRegistry {
    config: LockConfig,
    registry: Arc<Mutex<Registry>>,
}

impl OperationLockRegistry {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Runs `operation` under `key` with the configured attempt budget.
    pub async fn execute<T, F, Fut>(&self, key: &str, operation: F) -> Result<T, OperationError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        self.execute_with_attempts(key, self.config.max_attempts, operation)
            .await
    }

    /// Runs `operation` under `key`, joining an existing execution when one is
    /// in flight or settled within the grace window.
    pub async fn execute_with_attempts<T, F, Fut>(
        &self,
        key: &str,
        max_attempts: u32,
        operation: F,
    ) -> Result<T, OperationError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let mut waited = false;
        let in_flight = loop {
            match self.try_acquire(key, waited) {
                Acquire::Join(in_flight) => {
                    debug!(key, "Joining in-flight operation");
                    break in_flight;
                }
                Acquire::Wait => {
                    debug!(key, "Key used recently; delaying resubmission");
                    waited = true;
                    sleep(self.config.resubmit_delay()).await;
                }
                Acquire::Reserved {
                    in_flight,
                    generation,
                    sender,
                } => {
                    self.spawn_operation(key, generation, max_attempts, operation, sender);
                    break in_flight;
                }
            }
        };

        let value = in_flight.await?;
        value
            .downcast::<T>()
            .map(|value| (*value).clone())
            .map_err(|_| OperationError::KeyTypeMismatch {
                key: key.to_string(),
            })
    }

    /// Whether `key` currently has an entry (in flight or in its grace window).
    pub fn is_held(&self, key: &str) -> bool {
        let mut registry = lock_state(&self.registry);
        registry.prune(Instant::now(), &self.config);
        registry.entries.contains_key(key)
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let now = Instant::now();
        let mut registry = lock_state(&self.registry);
        registry.prune(now, &self.config);

        let mut in_flight: Vec<LockEntrySnapshot> = registry
            .entries
            .iter()
            .filter(|(_, entry)| entry.settled_at.is_none())
            .map(|(key, entry)| LockEntrySnapshot {
                key: key.clone(),
                held_ms: now.duration_since(entry.acquired_at).as_millis() as u64,
            })
            .collect();
        in_flight.sort_by(|a, b| a.key.cmp(&b.key));

        let mut settled: Vec<String> = registry
            .entries
            .iter()
            .filter(|(_, entry)| entry.settled_at.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        settled.sort();

        let mut recently_used: Vec<String> = registry.last_used.keys().cloned().collect();
        recently_used.sort();

        LockSnapshot {
            in_flight,
            settled,
            recently_used,
        }
    }

    fn try_acquire(&self, key: &str, waited: bool) -> Acquire {
        let now = Instant::now();
        let mut registry = lock_state(&self.registry);
        registry.prune(now, &self.config);

        if let Some(entry) = registry.entries.get(key) {
            return Acquire::Join(entry.in_flight.clone());
        }

        if !waited && registry.last_used.contains_key(key) {
            return Acquire::Wait;
        }

        let (sender, receiver) = oneshot::channel::<SharedOutcome>();
        let aborted_key = key.to_string();
        let in_flight = async move {
            match receiver.await {
                Ok(outcome) => outcome,
                Err(_) => Err(OperationError::Aborted {
                    key: aborted_key,
                    reason: "operation task ended without a result".to_string(),
                }),
            }
        }
        .boxed()
        .shared();

        registry.next_generation += 1;
        let generation = registry.next_generation;
        registry.entries.insert(
            key.to_string(),
            LockEntry {
                acquired_at: now,
                generation,
                in_flight: in_flight.clone(),
                settled_at: None,
            },
        );
        registry.last_used.insert(key.to_string(), now);

        Acquire::Reserved {
            in_flight,
            generation,
            sender,
        }
    }

    fn spawn_operation<T, F, Fut>(
        &self,
        key: &str,
        generation: u64,
        max_attempts: u32,
        operation: F,
        sender: oneshot::Sender<SharedOutcome>,
    ) where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let key = key.to_string();
        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let attempt = run_with_retry(&key, max_attempts, &config, operation);
            let outcome = match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(result) => result
                    .map(|value| Arc::new(value) as SharedValue)
                    .map_err(OperationError::from),
                Err(_) => {
                    warn!(key = %key, "Operation panicked; releasing key");
                    Err(OperationError::Aborted {
                        key: key.clone(),
                        reason: "operation panicked".to_string(),
                    })
                }
            };

            lock_state(&registry).settle(&key, generation, Instant::now());
            let _ = sender.send(outcome);
        });
    }
}

/// Attempts `operation` up to `max_attempts` times with capped exponential
/// backoff. Only network and 5xx failures are retried; authentication and
/// other client rejections return after the first attempt.
pub async fn run_with_retry<T, F, Fut>(
    key: &str,
    max_attempts: u32,
    config: &LockConfig,
    mut operation: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_auth() => {
                debug!(key, attempt, "Authentication failure; not retrying");
                return Err(err);
            }
            Err(err) if !err.is_retryable() => {
                debug!(key, attempt, error = %err, "Request rejected; not retrying");
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                warn!(key, attempts = attempt, error = %err, "Operation failed after retries");
                return Err(err);
            }
            Err(err) => {
                let delay = config.backoff(attempt);
                debug!(
                    key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed; retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn registry() -> OperationLockRegistry {
        OperationLockRegistry::new(LockConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let registry = registry();
        let calls = Arc::new(AtomicU32::new(0));

        let make_op = || {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, TransportError>(calls.fetch_add(1, Ordering::SeqCst) + 1)
                }
            }
        };

        let (a, b, c) = tokio::join!(
            registry.execute("update-1", make_op()),
            registry.execute("update-1", make_op()),
            registry.execute("update-1", make_op()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(1));
        assert_eq!(c, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_independently() {
        let registry = registry();
        let calls = Arc::new(AtomicU32::new(0));

        for key in ["update-1", "update-2"] {
            let calls = Arc::clone(&calls);
            let result = registry
                .execute(key, move || {
                    let calls = Arc::clone(&calls);
                    async move { Ok::<_, TransportError>(calls.fetch_add(1, Ordering::SeqCst)) }
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_result_is_reused_within_grace() {
        let registry = registry();
        let calls = Arc::new(AtomicU32::new(0));
        let op = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move { Ok::<_, TransportError>(calls.fetch_add(1, Ordering::SeqCst)) }
            }
        };

        assert_eq!(registry.execute("save", op.clone()).await, Ok(0));
        sleep(Duration::from_millis(500)).await;
        assert!(registry.is_held("save"));
        assert_eq!(registry.execute("save", op).await, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_key_is_delayed_after_grace() {
        let registry = registry();
        let calls = Arc::new(AtomicU32::new(0));
        let op = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move { Ok::<_, TransportError>(calls.fetch_add(1, Ordering::SeqCst)) }
            }
        };

        registry.execute("save", op.clone()).await.expect("first run");
        sleep(Duration::from_millis(2_500)).await;
        assert!(!registry.is_held("save"));

        let started = Instant::now();
        assert_eq!(registry.execute("save", op).await, Ok(1));
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn unused_key_starts_without_delay() {
        let registry = registry();
        let started = Instant::now();
        let result = registry
            .execute("fresh", || async { Ok::<_, TransportError>("done") })
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_backoff_schedule() {
        let registry = registry();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();

        let result = registry
            .execute("flaky", {
                let attempts = Arc::clone(&attempts);
                move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.lock().unwrap().push(origin.elapsed());
                        Err::<(), _>(TransportError::Network("connection reset".into()))
                    }
                }
            })
            .await;

        assert_eq!(
            result,
            Err(OperationError::Transport(TransportError::Network(
                "connection reset".into()
            )))
        );
        assert_eq!(
            *attempts.lock().unwrap(),
            vec![
                Duration::ZERO,
                Duration::from_millis(1_000),
                Duration::from_millis(3_000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let registry = registry();
        let calls = Arc::new(AtomicU32::new(0));

        let result = registry
            .execute("recover", {
                let calls = Arc::clone(&calls);
                move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(TransportError::from_status(502, "bad gateway"))
                        } else {
                            Ok(42)
                        }
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_attempted_once() {
        let registry = registry();
        let calls = Arc::new(AtomicU32::new(0));

        let result = registry
            .execute("auth", {
                let calls = Arc::clone(&calls);
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(TransportError::unauthorized("token expired")) }
                }
            })
            .await;

        assert!(result.expect_err("auth error").is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_rejection_is_attempted_once() {
        let registry = registry();
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = registry
            .execute("create-staff", {
                let calls = Arc::clone(&calls);
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(TransportError::from_status(422, "email taken")) }
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(OperationError::Transport(TransportError::Client { status: 422, .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn joined_callers_all_see_final_error() {
        let registry = registry();
        let op = || {
            move || async {
                sleep(Duration::from_millis(10)).await;
                Err::<u8, _>(TransportError::from_status(500, "boom"))
            }
        };

        let (a, b) = tokio::join!(
            registry.execute_with_attempts("delete-3", 2, op()),
            registry.execute_with_attempts("delete-3", 2, op()),
        );
        assert_eq!(a, b);
        assert!(matches!(
            a,
            Err(OperationError::Transport(TransportError::Server { status: 500, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_result_type_is_reported() {
        let registry = registry();
        let first = registry.execute("shared", || async {
            sleep(Duration::from_millis(10)).await;
            Ok::<_, TransportError>(7u32)
        });
        let second = registry.execute("shared", || async { Ok::<_, TransportError>("text") });

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Ok(7));
        assert_eq!(
            second,
            Err(OperationError::KeyTypeMismatch {
                key: "shared".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_operation_releases_key_after_grace() {
        let registry = registry();

        let panicked = registry
            .execute("update-9", || async {
                if true {
                    panic!("serializer blew up");
                }
                Ok::<u8, TransportError>(0)
            })
            .await;
        assert!(matches!(
            panicked,
            Err(OperationError::Aborted { ref key, .. }) if key == "update-9"
        ));
        assert!(registry.snapshot().in_flight.is_empty());

        sleep(Duration::from_millis(2_500)).await;
        assert!(!registry.is_held("update-9"));
        let result = registry
            .execute("update-9", || async { Ok::<u8, TransportError>(9) })
            .await;
        assert_eq!(result, Ok(9));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_in_flight_keys() {
        let registry = Arc::new(registry());
        let handle = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                registry
                    .execute("slow", || async {
                        sleep(Duration::from_secs(1)).await;
                        Ok::<_, TransportError>(())
                    })
                    .await
            }
        });

        sleep(Duration::from_millis(100)).await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.in_flight.len(), 1);
        assert_eq!(snapshot.in_flight[0].key, "slow");
        assert_eq!(snapshot.in_flight[0].held_ms, 100);

        handle.await.expect("join").expect("operation");
        let snapshot = registry.snapshot();
        assert!(snapshot.in_flight.is_empty());
        assert_eq!(snapshot.settled, vec!["slow".to_string()]);
    }
}
