//! Session continuity gate: decides whether an authentication failure really
//! means the session is over.
//!
//! A reload replays page initialization, which races many authenticated
//! requests against a credential store that has not been rehydrated yet. Each
//! of those requests can fail with 401. The gate separates that noise from one
//! isolated, sustained authentication failure.
//!
//! # Guard order
//!
//! Guards are AND-composed and evaluated in a fixed order; the first one that
//! rejects wins and is reported in the snapshot.
//!
//! 1. [`Guard::Initialization`]: still inside the startup grace period
//! 2. [`Guard::NavigationShield`]: a page transition is in progress
//! 3. [`Guard::RateLimiter`]: refresh lockout active
//! 4. [`Guard::RecentRefresh`]: a refresh happened recently
//! 5. [`Guard::CriticalSection`]: an operation marked itself critical
//! 6. [`Guard::AlreadyTerminating`]: teardown under way
//! 7. [`Guard::Burst`]: many failures at once (one expiry, many requests)
//! 8. [`Guard::Debounce`]: a termination attempt happened moments ago
//!
//! Guards 3–5 read other components. The coordinator samples them into
//! [`GuardInputs`] so the gate never reaches into another component's state.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::storage::CredentialStore;
use crate::terminator::{SessionTerminator, TerminatorKind};
use crate::lock_state;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    Initialization,
    NavigationShield,
    RateLimiter,
    RecentRefresh,
    CriticalSection,
    AlreadyTerminating,
    Burst,
    Debounce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "guard", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Reject(Guard),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn rejected_by(&self) -> Option<Guard> {
        match self {
            Decision::Allow => None,
            Decision::Reject(guard) => Some(*guard),
        }
    }
}

/// Readings from the other components, sampled once per evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardInputs {
    pub refresh_locked_out: bool,
    pub refreshed_recently: bool,
    pub critical_section_active: bool,
}

#[derive(Debug)]
struct GateState {
    initialization_deadline: Instant,
    navigation_shield_until: Option<Instant>,
    last_attempt_at: Option<Instant>,
    consecutive_failures: u32,
    recent_failures: VecDeque<Instant>,
    terminating: bool,
    teardowns: u64,
    last_rejection: Option<Guard>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    pub initialization_remaining_ms: u64,
    pub navigation_shield_remaining_ms: u64,
    pub consecutive_failures: u32,
    pub recent_failures: usize,
    pub terminating: bool,
    pub teardowns: u64,
    pub last_rejection: Option<Guard>,
    pub last_attempt_ago_ms: Option<u64>,
    pub terminator: TerminatorKind,
}

pub struct SessionGate {
    config: GateConfig,
    state: Arc<Mutex<GateState>>,
    credentials: Arc<dyn CredentialStore>,
    terminator: RwLock<Arc<dyn SessionTerminator>>,
}

impl SessionGate {
    pub fn new(
        config: GateConfig,
        credentials: Arc<dyn CredentialStore>,
        terminator: Arc<dyn SessionTerminator>,
    ) -> Self {
        let now = Instant::now();
        let state = GateState {
            initialization_deadline: now + config.initialization_grace(),
            navigation_shield_until: None,
            last_attempt_at: None,
            consecutive_failures: 0,
            recent_failures: VecDeque::new(),
            terminating: false,
            teardowns: 0,
            last_rejection: None,
        };

        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            credentials,
            terminator: RwLock::new(terminator),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn set_terminator(&self, terminator: Arc<dyn SessionTerminator>) {
        let kind = terminator.kind();
        *self
            .terminator
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = terminator;
        debug!(?kind, "Session terminator replaced");
    }

    pub fn terminator_kind(&self) -> TerminatorKind {
        self.current_terminator().kind()
    }

    /// Moves the initialization deadline later. Earlier deadlines are ignored.
    pub fn extend_initialization(&self, until: Instant) {
        let mut state = lock_state(&self.state);
        if until > state.initialization_deadline {
            state.initialization_deadline = until;
        }
    }

    /// Shields logout decisions until `now + duration` (never shortens).
    pub fn raise_navigation_shield(&self, duration: std::time::Duration) {
        let until = Instant::now() + duration;
        let mut state = lock_state(&self.state);
        if state.navigation_shield_until.map_or(true, |current| until > current) {
            state.navigation_shield_until = Some(until);
        }
    }

    /// Evaluates the guard chain without counting as a termination attempt.
    pub fn evaluate(&self, inputs: GuardInputs) -> Decision {
        let mut state = lock_state(&self.state);
        self.decide(&mut state, inputs, Instant::now(), false)
    }

    /// Like [`evaluate`](Self::evaluate) but leaves `last_rejection` untouched.
    pub fn preview(&self, inputs: GuardInputs) -> Decision {
        let now = Instant::now();
        let mut state = lock_state(&self.state);
        self.prune_failures(&mut state, now);
        match self.first_rejection(&mut state, inputs, now, false) {
            Some(guard) => Decision::Reject(guard),
            None => Decision::Allow,
        }
    }

    /// Records an authentication failure and, if every guard passes, tears the
    /// session down. Returns the decision that was taken.
    pub async fn on_auth_failure(&self, inputs: GuardInputs) -> Decision {
        let decision = {
            let now = Instant::now();
            let mut state = lock_state(&self.state);
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.recent_failures.push_back(now);

            let decision = self.decide(&mut state, inputs, now, true);
            if decision.is_allowed() {
                state.terminating = true;
            }
            decision
        };

        match decision {
            Decision::Allow => self.teardown().await,
            Decision::Reject(guard) => {
                debug!(?guard, "Session termination suppressed");
            }
        }

        decision
    }

    pub fn on_success(&self) {
        let mut state = lock_state(&self.state);
        if state.consecutive_failures > 0 {
            debug!(
                failures = state.consecutive_failures,
                "Authenticated request succeeded; failure count reset"
            );
        }
        state.consecutive_failures = 0;
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let now = Instant::now();
        let terminator = self.terminator_kind();
        let mut state = lock_state(&self.state);
        self.prune_failures(&mut state, now);

        GateSnapshot {
            initialization_remaining_ms: state
                .initialization_deadline
                .saturating_duration_since(now)
                .as_millis() as u64,
            navigation_shield_remaining_ms: state
                .navigation_shield_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
            consecutive_failures: state.consecutive_failures,
            recent_failures: state.recent_failures.len(),
            terminating: state.terminating,
            teardowns: state.teardowns,
            last_rejection: state.last_rejection,
            last_attempt_ago_ms: state
                .last_attempt_at
                .map(|at| now.duration_since(at).as_millis() as u64),
            terminator,
        }
    }

    fn decide(
        &self,
        state: &mut GateState,
        inputs: GuardInputs,
        now: Instant,
        attempt: bool,
    ) -> Decision {
        self.prune_failures(state, now);
        let decision = match self.first_rejection(state, inputs, now, attempt) {
            Some(guard) => Decision::Reject(guard),
            None => Decision::Allow,
        };
        state.last_rejection = decision.rejected_by();
        decision
    }

    fn first_rejection(
        &self,
        state: &mut GateState,
        inputs: GuardInputs,
        now: Instant,
        attempt: bool,
    ) -> Option<Guard> {
        if now < state.initialization_deadline {
            return Some(Guard::Initialization);
        }
        if state.navigation_shield_until.is_some_and(|until| now < until) {
            return Some(Guard::NavigationShield);
        }
        if inputs.refresh_locked_out {
            return Some(Guard::RateLimiter);
        }
        if inputs.refreshed_recently {
            return Some(Guard::RecentRefresh);
        }
        if inputs.critical_section_active {
            return Some(Guard::CriticalSection);
        }
        if state.terminating {
            return Some(Guard::AlreadyTerminating);
        }
        if state.recent_failures.len() > self.config.burst_max_failures {
            return Some(Guard::Burst);
        }

        let debounced = state
            .last_attempt_at
            .is_some_and(|at| now.duration_since(at) < self.config.debounce());
        if attempt {
            state.last_attempt_at = Some(now);
        }
        if debounced {
            return Some(Guard::Debounce);
        }

        None
    }

    fn prune_failures(&self, state: &mut GateState, now: Instant) {
        let window = self.config.burst_window();
        while let Some(oldest) = state.recent_failures.front() {
            if now.duration_since(*oldest) >= window {
                state.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Runs teardown on its own task so a caller that stops waiting (a
    /// request timeout, a dropped interceptor future) cannot strand the gate
    /// in the terminating state.
    async fn teardown(&self) {
        let terminator = self.current_terminator();
        let credentials = Arc::clone(&self.credentials);
        let state = Arc::clone(&self.state);
        warn!(kind = ?terminator.kind(), "Session termination approved; tearing down");

        let task = tokio::spawn(async move {
            let _reset = TerminatingReset(Arc::clone(&state));

            credentials.clear();
            terminator.terminate().await;

            let mut state = lock_state(&state);
            state.terminating = false;
            state.consecutive_failures = 0;
            state.recent_failures.clear();
            state.teardowns += 1;
            info!(teardowns = state.teardowns, "Session teardown complete");
        });

        if let Err(err) = task.await {
            warn!(error = %err, "Session teardown task failed");
        }
    }

    fn current_terminator(&self) -> Arc<dyn SessionTerminator> {
        Arc::clone(
            &self
                .terminator
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

/// Clears the terminating flag if the teardown task unwinds before finishing.
struct TerminatingReset(Arc<Mutex<GateState>>);

impl Drop for TerminatingReset {
    fn drop(&mut self) {
        let mut state = lock_state(&self.0);
        if state.terminating {
            warn!("Session teardown interrupted; terminating flag cleared");
            state.terminating = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCredentialStore;
    use crate::terminator::{HardRedirectFallback, InjectedNavigator};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn open_config() -> GateConfig {
        GateConfig {
            initialization_grace_ms: 0,
            ..GateConfig::default()
        }
    }

    fn gate_with(config: GateConfig) -> (SessionGate, Arc<MemoryCredentialStore>, Arc<AtomicUsize>) {
        let credentials = Arc::new(MemoryCredentialStore::with_token("token"));
        let navigations = Arc::new(AtomicUsize::new(0));
        let navigator = InjectedNavigator::new({
            let navigations = Arc::clone(&navigations);
            move || {
                navigations.fetch_add(1, Ordering::SeqCst);
            }
        });
        let gate = SessionGate::new(config, credentials.clone(), Arc::new(navigator));
        (gate, credentials, navigations)
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_guard_rejects_during_grace() {
        let (gate, _, _) = gate_with(GateConfig::default());
        assert_eq!(
            gate.evaluate(GuardInputs::default()),
            Decision::Reject(Guard::Initialization)
        );

        sleep(Duration::from_secs(60)).await;
        assert_eq!(gate.evaluate(GuardInputs::default()), Decision::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_deadline_only_extends() {
        let (gate, _, _) = gate_with(GateConfig::default());
        gate.extend_initialization(Instant::now() + Duration::from_secs(90));
        gate.extend_initialization(Instant::now() + Duration::from_secs(5));

        sleep(Duration::from_secs(89)).await;
        assert_eq!(
            gate.evaluate(GuardInputs::default()),
            Decision::Reject(Guard::Initialization)
        );
        sleep(Duration::from_secs(1)).await;
        assert!(gate.evaluate(GuardInputs::default()).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn first_failing_guard_is_reported() {
        let (gate, _, _) = gate_with(GateConfig::default());
        let inputs = GuardInputs {
            critical_section_active: true,
            ..GuardInputs::default()
        };

        assert_eq!(gate.evaluate(inputs), Decision::Reject(Guard::Initialization));
        assert_eq!(gate.snapshot().last_rejection, Some(Guard::Initialization));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(gate.evaluate(inputs), Decision::Reject(Guard::CriticalSection));
        assert_eq!(gate.snapshot().last_rejection, Some(Guard::CriticalSection));
    }

    #[tokio::test(start_paused = true)]
    async fn component_guards_follow_documented_order() {
        let (gate, _, _) = gate_with(open_config());
        let all = GuardInputs {
            refresh_locked_out: true,
            refreshed_recently: true,
            critical_section_active: true,
        };
        assert_eq!(gate.evaluate(all), Decision::Reject(Guard::RateLimiter));

        let no_lockout = GuardInputs {
            refresh_locked_out: false,
            ..all
        };
        assert_eq!(gate.evaluate(no_lockout), Decision::Reject(Guard::RecentRefresh));

        gate.raise_navigation_shield(Duration::from_secs(3));
        assert_eq!(gate.evaluate(all), Decision::Reject(Guard::NavigationShield));
        sleep(Duration::from_secs(3)).await;
        assert_eq!(gate.evaluate(all), Decision::Reject(Guard::RateLimiter));
    }

    #[tokio::test(start_paused = true)]
    async fn shield_is_never_shortened() {
        let (gate, _, _) = gate_with(open_config());
        gate.raise_navigation_shield(Duration::from_secs(10));
        gate.raise_navigation_shield(Duration::from_secs(1));
        sleep(Duration::from_secs(5)).await;
        assert_eq!(
            gate.evaluate(GuardInputs::default()),
            Decision::Reject(Guard::NavigationShield)
        );
        assert_eq!(gate.snapshot().navigation_shield_remaining_ms, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn approved_failure_tears_down_once() {
        let (gate, credentials, navigations) = gate_with(open_config());

        let decision = gate.on_auth_failure(GuardInputs::default()).await;
        assert_eq!(decision, Decision::Allow);
        assert!(!credentials.has_credentials());
        assert_eq!(navigations.load(Ordering::SeqCst), 1);

        let snapshot = gate.snapshot();
        assert_eq!(snapshot.teardowns, 1);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.recent_failures, 0);
        assert!(!snapshot.terminating);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_blocks_repeat_attempts() {
        let (gate, _, navigations) = gate_with(open_config());
        gate.on_auth_failure(GuardInputs::default()).await;

        sleep(Duration::from_secs(1)).await;
        assert_eq!(
            gate.on_auth_failure(GuardInputs::default()).await,
            Decision::Reject(Guard::Debounce)
        );

        sleep(Duration::from_secs(5)).await;
        assert_eq!(
            gate.on_auth_failure(GuardInputs::default()).await,
            Decision::Allow
        );
        assert_eq!(navigations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_failures_is_suppressed() {
        let (gate, credentials, _) = gate_with(open_config());
        let shielded = GuardInputs {
            critical_section_active: true,
            ..GuardInputs::default()
        };
        for _ in 0..4 {
            gate.on_auth_failure(shielded).await;
        }
        assert_eq!(gate.snapshot().recent_failures, 4);

        assert_eq!(
            gate.on_auth_failure(GuardInputs::default()).await,
            Decision::Reject(Guard::Burst)
        );
        assert!(credentials.has_credentials());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(
            gate.on_auth_failure(GuardInputs::default()).await,
            Decision::Allow
        );
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate_does_not_count_as_attempt() {
        let (gate, _, _) = gate_with(open_config());
        assert!(gate.evaluate(GuardInputs::default()).is_allowed());
        assert!(gate.evaluate(GuardInputs::default()).is_allowed());
        assert_eq!(gate.snapshot().last_attempt_ago_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let (gate, _, _) = gate_with(GateConfig::default());
        gate.on_auth_failure(GuardInputs::default()).await;
        gate.on_auth_failure(GuardInputs::default()).await;
        assert_eq!(gate.snapshot().consecutive_failures, 2);

        gate.on_success();
        assert_eq!(gate.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_during_slow_teardown_hit_terminating_guard() {
        let credentials = Arc::new(MemoryCredentialStore::with_token("token"));
        let redirects = Arc::new(AtomicUsize::new(0));
        let fallback = HardRedirectFallback::new(
            "/login",
            Duration::from_millis(100),
            Arc::new({
                let redirects = Arc::clone(&redirects);
                move |_: &str| {
                    redirects.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let gate = SessionGate::new(open_config(), credentials, Arc::new(fallback));

        let (first, second, third) = tokio::join!(
            gate.on_auth_failure(GuardInputs::default()),
            gate.on_auth_failure(GuardInputs::default()),
            gate.on_auth_failure(GuardInputs::default()),
        );

        assert_eq!(first, Decision::Allow);
        assert_eq!(second, Decision::Reject(Guard::AlreadyTerminating));
        assert_eq!(third, Decision::Reject(Guard::AlreadyTerminating));
        assert_eq!(redirects.load(Ordering::SeqCst), 1);
        assert_eq!(gate.snapshot().teardowns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_completes_when_caller_stops_waiting() {
        let credentials = Arc::new(MemoryCredentialStore::with_token("token"));
        let redirects = Arc::new(AtomicUsize::new(0));
        let fallback = HardRedirectFallback::new(
            "/login",
            Duration::from_millis(100),
            Arc::new({
                let redirects = Arc::clone(&redirects);
                move |_: &str| {
                    redirects.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let gate = SessionGate::new(open_config(), credentials.clone(), Arc::new(fallback));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            gate.on_auth_failure(GuardInputs::default()),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(gate.snapshot().terminating);

        sleep(Duration::from_millis(200)).await;
        let snapshot = gate.snapshot();
        assert!(!snapshot.terminating);
        assert_eq!(snapshot.teardowns, 1);
        assert_eq!(redirects.load(Ordering::SeqCst), 1);
        assert!(!credentials.has_credentials());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(
            gate.on_auth_failure(GuardInputs::default()).await,
            Decision::Allow
        );
        assert_eq!(redirects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_terminator_does_not_leave_gate_terminating() {
        struct Exploding;

        #[async_trait::async_trait]
        impl SessionTerminator for Exploding {
            fn kind(&self) -> TerminatorKind {
                TerminatorKind::InjectedNavigator
            }

            async fn terminate(&self) {
                panic!("navigation failed");
            }
        }

        let credentials = Arc::new(MemoryCredentialStore::with_token("token"));
        let gate = SessionGate::new(open_config(), credentials, Arc::new(Exploding));

        assert_eq!(
            gate.on_auth_failure(GuardInputs::default()).await,
            Decision::Allow
        );
        let snapshot = gate.snapshot();
        assert!(!snapshot.terminating);
        assert_eq!(snapshot.teardowns, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_terminator_replaces_fallback() {
        let credentials = Arc::new(MemoryCredentialStore::with_token("token"));
        let gate = SessionGate::new(
            open_config(),
            credentials,
            Arc::new(HardRedirectFallback::logging(Duration::from_millis(100))),
        );
        assert_eq!(gate.terminator_kind(), TerminatorKind::HardRedirectFallback);

        gate.set_terminator(Arc::new(InjectedNavigator::new(|| {})));
        assert_eq!(gate.terminator_kind(), TerminatorKind::InjectedNavigator);
    }
}
