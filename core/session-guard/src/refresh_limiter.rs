//! Sliding-window detector for rapid page reloads.
//!
//! Each refresh-like lifecycle signal is timestamped. More than
//! `max_refreshes` inside `time_window` puts the limiter into a lockout for
//! `lockout_duration`, during which logout decisions are suppressed.
//!
//! Expiry is evaluated against the clock on every observation, so a lockout
//! ends on time whether or not anyone records another refresh. Ending a
//! lockout also empties the window.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::RefreshConfig;
use crate::lock_state;

/// Why a lockout was activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockoutReason {
    /// The counted window exceeded its threshold.
    Threshold,
    /// An independent reload signal fired.
    ReloadSignal,
}

#[derive(Debug, Clone, Copy)]
struct LockoutState {
    activated_at: Instant,
    reason: LockoutReason,
}

#[derive(Debug, Default)]
struct LimiterState {
    events: VecDeque<Instant>,
    lockout: Option<LockoutState>,
    last_refresh_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSnapshot {
    pub window_len: usize,
    pub locked_out: bool,
    pub lockout_reason: Option<LockoutReason>,
    pub lockout_remaining_ms: Option<u64>,
    pub last_refresh_ago_ms: Option<u64>,
}

#[derive(Debug)]
pub struct RefreshRateLimiter {
    config: RefreshConfig,
    state: Mutex<LimiterState>,
}

impl RefreshRateLimiter {
    pub fn new(config: RefreshConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Records a refresh at the current instant.
    ///
    /// Returns `false` when the limiter is (or just became) locked out.
    pub fn record_refresh(&self) -> bool {
        let now = Instant::now();
        let mut state = lock_state(&self.state);
        self.expire_lockout(&mut state, now);
        state.last_refresh_at = Some(now);

        if state.lockout.is_some() {
            return false;
        }

        let window = self.config.time_window();
        while let Some(oldest) = state.events.front() {
            if now.duration_since(*oldest) >= window {
                state.events.pop_front();
            } else {
                break;
            }
        }
        state.events.push_back(now);

        if state.events.len() > self.config.max_refreshes {
            warn!(
                count = state.events.len(),
                max_refreshes = self.config.max_refreshes,
                lockout_ms = self.config.lockout_ms,
                "Refresh rate exceeded; lockout engaged"
            );
            state.lockout = Some(LockoutState {
                activated_at: now,
                reason: LockoutReason::Threshold,
            });
            return false;
        }

        true
    }

    /// Activates (or restarts) the lockout regardless of the counted window.
    pub fn force_lockout(&self, reason: LockoutReason) {
        let now = Instant::now();
        let mut state = lock_state(&self.state);
        self.expire_lockout(&mut state, now);
        if state.lockout.is_none() {
            warn!(?reason, lockout_ms = self.config.lockout_ms, "Lockout forced");
        }
        state.lockout = Some(LockoutState {
            activated_at: now,
            reason,
        });
    }

    pub fn is_locked_out(&self) -> bool {
        let mut state = lock_state(&self.state);
        self.expire_lockout(&mut state, Instant::now());
        state.lockout.is_some()
    }

    /// Most recent refresh, including ones recorded during a lockout.
    pub fn last_refresh_at(&self) -> Option<Instant> {
        lock_state(&self.state).last_refresh_at
    }

    /// Whether a refresh was recorded within `within` of now.
    pub fn refreshed_within(&self, within: Duration) -> bool {
        self.last_refresh_at()
            .map(|at| Instant::now().duration_since(at) < within)
            .unwrap_or(false)
    }

    pub fn window_len(&self) -> usize {
        let mut state = lock_state(&self.state);
        self.expire_lockout(&mut state, Instant::now());
        state.events.len()
    }

    pub fn reset(&self) {
        let mut state = lock_state(&self.state);
        state.events.clear();
        state.lockout = None;
    }

    pub fn snapshot(&self) -> RefreshSnapshot {
        let now = Instant::now();
        let mut state = lock_state(&self.state);
        self.expire_lockout(&mut state, now);

        let lockout_remaining_ms = state.lockout.map(|lockout| {
            (lockout.activated_at + self.config.lockout())
                .saturating_duration_since(now)
                .as_millis() as u64
        });

        RefreshSnapshot {
            window_len: state.events.len(),
            locked_out: state.lockout.is_some(),
            lockout_reason: state.lockout.map(|lockout| lockout.reason),
            lockout_remaining_ms,
            last_refresh_ago_ms: state
                .last_refresh_at
                .map(|at| now.duration_since(at).as_millis() as u64),
        }
    }

    fn expire_lockout(&self, state: &mut LimiterState, now: Instant) {
        let Some(lockout) = state.lockout else {
            return;
        };

        if now.duration_since(lockout.activated_at) >= self.config.lockout() {
            info!(reason = ?lockout.reason, "Refresh lockout expired");
            state.lockout = None;
            state.events.clear();
        }
    }
}
