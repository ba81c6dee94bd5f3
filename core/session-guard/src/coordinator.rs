//! Composition of the lock registry, refresh limiter, critical-section tracker
//! and session gate into the single handle the application talks to.
//!
//! The coordinator is constructed once by the composition root and cloned into
//! the transport interceptor and the UI layer. Clones share state; a fresh
//! instance has fresh state, which is what tests rely on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::config::GuardConfig;
use crate::critical_section::{
    CriticalSectionGuard, CriticalSectionSnapshot, CriticalSectionTracker, SectionId,
};
use crate::error::{OperationError, TransportError};
use crate::gate::{Decision, GateSnapshot, Guard, GuardInputs, SessionGate};
use crate::lock_state;
use crate::op_lock::{LockSnapshot, OperationLockRegistry};
use crate::refresh_limiter::{LockoutReason, RefreshRateLimiter, RefreshSnapshot};
use crate::signals::{LifecycleEvent, ReloadSignals, SignalInputs};
use crate::storage::{CredentialStore, MemoryCredentialStore, MemorySessionStorage, SessionStorage};
use crate::terminator::{HardRedirectFallback, InjectedNavigator, SessionTerminator};

/// What a lifecycle event did to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub event: LifecycleEvent,
    pub signals: ReloadSignals,
    pub suspected_reload: bool,
    /// `Some` when the event was counted as a refresh.
    pub refresh_allowed: Option<bool>,
    pub shield_raised_ms: Option<u64>,
}

/// Read-only view of every counter and timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugSnapshot {
    pub locks: LockSnapshot,
    pub refresh: RefreshSnapshot,
    pub critical_sections: CriticalSectionSnapshot,
    pub gate: GateSnapshot,
    pub last_page_load_ago_ms: Option<u64>,
    pub last_lifecycle: Option<LifecycleReport>,
    /// Guard that would reject a termination right now, if any.
    pub blocking_guard: Option<Guard>,
}

struct CoordinatorInner {
    config: GuardConfig,
    locks: OperationLockRegistry,
    limiter: RefreshRateLimiter,
    sections: CriticalSectionTracker,
    gate: SessionGate,
    session_storage: Arc<dyn SessionStorage>,
    hidden_at: Mutex<Option<Instant>>,
    last_lifecycle: Mutex<Option<LifecycleReport>>,
    wall_anchor: DateTime<Utc>,
    instant_anchor: Instant,
}

impl CoordinatorInner {
    /// Wall-clock time advanced by the tokio clock, so the persisted marker
    /// and the in-memory timers agree (including under a paused test clock).
    fn wall_now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.instant_anchor);
        chrono::Duration::from_std(elapsed)
            .map(|elapsed| self.wall_anchor + elapsed)
            .unwrap_or_else(|_| Utc::now())
    }

    fn page_load_age(&self) -> Option<std::time::Duration> {
        let marker = self.session_storage.page_load_marker()?;
        (self.wall_now() - marker).to_std().ok()
    }
}

#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[derive(Default)]
pub struct CoordinatorBuilder {
    config: Option<GuardConfig>,
    credentials: Option<Arc<dyn CredentialStore>>,
    session_storage: Option<Arc<dyn SessionStorage>>,
    terminator: Option<Arc<dyn SessionTerminator>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn session_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.session_storage = Some(storage);
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn SessionTerminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn build(self) -> SessionCoordinator {
        let config = self.config.unwrap_or_default();
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::default()));
        let session_storage = self
            .session_storage
            .unwrap_or_else(|| Arc::new(MemorySessionStorage::default()));
        let terminator = self.terminator.unwrap_or_else(|| {
            Arc::new(HardRedirectFallback::logging(
                config.gate.redirect_delay(),
            ))
        });

        let inner = CoordinatorInner {
            locks: OperationLockRegistry::new(config.lock.clone()),
            limiter: RefreshRateLimiter::new(config.refresh.clone()),
            sections: CriticalSectionTracker::new(config.critical_section.timeout()),
            gate: SessionGate::new(config.gate.clone(), credentials, terminator),
            session_storage,
            hidden_at: Mutex::new(None),
            last_lifecycle: Mutex::new(None),
            wall_anchor: Utc::now(),
            instant_anchor: Instant::now(),
            config,
        };

        SessionCoordinator {
            inner: Arc::new(inner),
        }
    }
}

impl SessionCoordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    pub fn new(config: GuardConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    pub async fn execute_exclusive<T, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<T, OperationError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        self.inner.locks.execute(key, operation).await
    }

    pub async fn execute_exclusive_with_attempts<T, F, Fut>(
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
        self.inner
            .locks
            .execute_with_attempts(key, max_attempts, operation)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Page lifecycle
    // ─────────────────────────────────────────────────────────────────────

    pub fn record_page_lifecycle_event(&self, event: LifecycleEvent) -> LifecycleReport {
        let inner = &self.inner;
        let now = Instant::now();
        let wall_now = inner.wall_now();

        let hidden_at = {
            let mut hidden = lock_state(&inner.hidden_at);
            match event {
                LifecycleEvent::VisibilityChange { visible: false } => {
                    *hidden = Some(now);
                    None
                }
                LifecycleEvent::VisibilityChange { visible: true } => hidden.take(),
                _ => *hidden,
            }
        };

        let previous_load = match event {
            LifecycleEvent::Load { .. } => {
                let previous = inner.session_storage.page_load_marker();
                inner.session_storage.set_page_load_marker(wall_now);
                previous
            }
            _ => None,
        };

        let signals = ReloadSignals::evaluate(
            &SignalInputs {
                event,
                now,
                wall_now,
                previous_load,
                hidden_at,
            },
            &inner.config.signals,
        );
        let suspected_reload = signals.suspected_reload();

        let counts_as_refresh = match event {
            LifecycleEvent::Load { .. } | LifecycleEvent::RefreshShortcut => true,
            LifecycleEvent::VisibilityChange { visible: true } => signals.fast_visibility_return,
            LifecycleEvent::VisibilityChange { visible: false } | LifecycleEvent::Unload => false,
        };
        let refresh_allowed = counts_as_refresh.then(|| inner.limiter.record_refresh());

        if suspected_reload {
            inner.limiter.force_lockout(LockoutReason::ReloadSignal);
        }

        if matches!(event, LifecycleEvent::VisibilityChange { visible: true }) {
            inner
                .gate
                .extend_initialization(now + inner.config.gate.focus_grace());
        }

        let raises_shield = match event {
            LifecycleEvent::VisibilityChange { visible: false } => false,
            LifecycleEvent::VisibilityChange { visible: true } => suspected_reload,
            _ => true,
        };
        let shield_raised_ms = raises_shield.then(|| {
            let rapid = suspected_reload || refresh_allowed == Some(false);
            let delay = if rapid {
                inner.config.gate.rapid_shield_delay()
            } else {
                inner.config.gate.shield_delay()
            };
            inner.gate.raise_navigation_shield(delay);
            delay.as_millis() as u64
        });

        let report = LifecycleReport {
            event,
            signals,
            suspected_reload,
            refresh_allowed,
            shield_raised_ms,
        };
        debug!(
            event = event.name(),
            suspected_reload,
            refresh_allowed = ?refresh_allowed,
            shield_ms = ?shield_raised_ms,
            "Page lifecycle event recorded"
        );
        *lock_state(&inner.last_lifecycle) = Some(report.clone());
        report
    }

    // ─────────────────────────────────────────────────────────────────────
    // Critical sections
    // ─────────────────────────────────────────────────────────────────────

    pub fn start_critical_section(&self, label: &str) -> CriticalSectionGuard {
        self.inner.sections.start(label)
    }

    pub fn begin_critical_section(&self, label: &str) -> SectionId {
        self.inner.sections.begin(label)
    }

    pub fn end_critical_section(&self) {
        self.inner.sections.end();
    }

    pub fn is_critical_section_active(&self) -> bool {
        self.inner.sections.is_active()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session continuity
    // ─────────────────────────────────────────────────────────────────────

    pub fn may_terminate_session(&self) -> bool {
        self.inner.gate.evaluate(self.guard_inputs()).is_allowed()
    }

    /// Feeds a 401-class failure to the gate; tears the session down at most
    /// once if every guard passes.
    pub async fn on_auth_failure(&self) -> Decision {
        let inputs = self.guard_inputs();
        self.inner.gate.on_auth_failure(inputs).await
    }

    pub fn on_success(&self) {
        self.inner.gate.on_success();
    }

    pub fn register_logout_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.set_terminator(Arc::new(InjectedNavigator::new(callback)));
    }

    pub fn set_terminator(&self, terminator: Arc<dyn SessionTerminator>) {
        self.inner.gate.set_terminator(terminator);
    }

    pub fn is_refresh_locked_out(&self) -> bool {
        self.inner.limiter.is_locked_out()
    }

    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let inner = &self.inner;
        let inputs = self.guard_inputs();
        DebugSnapshot {
            locks: inner.locks.snapshot(),
            refresh: inner.limiter.snapshot(),
            critical_sections: inner.sections.snapshot(),
            gate: inner.gate.snapshot(),
            last_page_load_ago_ms: inner.page_load_age().map(|ago| ago.as_millis() as u64),
            last_lifecycle: lock_state(&inner.last_lifecycle).clone(),
            blocking_guard: inner.gate.preview(inputs).rejected_by(),
        }
    }

    fn guard_inputs(&self) -> GuardInputs {
        let inner = &self.inner;
        let recency = inner.config.gate.refresh_recency();
        let marker_recent = inner.page_load_age().is_some_and(|ago| ago < recency);

        GuardInputs {
            refresh_locked_out: inner.limiter.is_locked_out(),
            refreshed_recently: inner.limiter.refreshed_within(recency) || marker_recent,
            critical_section_active: inner.sections.is_active(),
        }
    }
}
