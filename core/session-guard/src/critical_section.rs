//! Application-level "operation in flight" markers.
//!
//! While any section is open, authentication failures are not trusted as
//! evidence of an expired session. Sections may overlap; the tracker is active
//! while at least one is open. A section that is never closed expires after the
//! configured timeout so a forgotten `end()` cannot pin the gate shut.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::lock_state;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SectionId(u64);

#[derive(Debug)]
struct OpenSection {
    label: String,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct TrackerState {
    open: BTreeMap<SectionId, OpenSection>,
    next_id: u64,
    expired_total: u64,
}

impl TrackerState {
    fn expire(&mut self, now: Instant, timeout: Duration) {
        let mut expired = 0;
        self.open.retain(|id, section| {
            let alive = now.duration_since(section.started_at) < timeout;
            if !alive {
                warn!(
                    section = id.0,
                    label = %section.label,
                    timeout_ms = timeout.as_millis() as u64,
                    "Critical section never ended; force-closing"
                );
                expired += 1;
            }
            alive
        });
        self.expired_total += expired;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalSectionSnapshot {
    pub active_count: usize,
    pub labels: Vec<String>,
    pub expired_total: u64,
}

#[derive(Debug, Clone)]
pub struct CriticalSectionTracker {
    timeout: Duration,
    state: Arc<Mutex<TrackerState>>,
}

impl CriticalSectionTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    /// Opens a section that stays open until [`end`](Self::end),
    /// [`end_section`](Self::end_section), or the timeout.
    pub fn begin(&self, label: &str) -> SectionId {
        let mut state = lock_state(&self.state);
        state.expire(Instant::now(), self.timeout);
        state.next_id += 1;
        let id = SectionId(state.next_id);
        state.open.insert(
            id,
            OpenSection {
                label: label.to_string(),
                started_at: Instant::now(),
            },
        );
        debug!(section = id.0, label, active = state.open.len(), "Critical section started");
        id
    }

    /// Opens a section that closes when the returned guard is dropped.
    pub fn start(&self, label: &str) -> CriticalSectionGuard {
        CriticalSectionGuard {
            id: self.begin(label),
            tracker: self.clone(),
        }
    }

    /// Closes the oldest open section. A stray call with nothing open is a no-op.
    pub fn end(&self) {
        let mut state = lock_state(&self.state);
        state.expire(Instant::now(), self.timeout);
        match state.open.pop_first() {
            Some((id, section)) => {
                debug!(section = id.0, label = %section.label, "Critical section ended");
            }
            None => debug!("Critical section end with none open; ignoring"),
        }
    }

    pub fn end_section(&self, id: SectionId) {
        let mut state = lock_state(&self.state);
        if let Some(section) = state.open.remove(&id) {
            debug!(section = id.0, label = %section.label, "Critical section ended");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_count() > 0
    }

    pub fn active_count(&self) -> usize {
        let mut state = lock_state(&self.state);
        state.expire(Instant::now(), self.timeout);
        state.open.len()
    }

    pub fn snapshot(&self) -> CriticalSectionSnapshot {
        let mut state = lock_state(&self.state);
        state.expire(Instant::now(), self.timeout);
        CriticalSectionSnapshot {
            active_count: state.open.len(),
            labels: state.open.values().map(|s| s.label.clone()).collect(),
            expired_total: state.expired_total,
        }
    }
}

/// Scoped critical section; ends on drop.
#[must_use = "dropping the guard ends the critical section immediately"]
#[derive(Debug)]
pub struct CriticalSectionGuard {
    id: SectionId,
    tracker: CriticalSectionTracker,
}

impl CriticalSectionGuard {
    pub fn id(&self) -> SectionId {
        self.id
    }
}

impl Drop for CriticalSectionGuard {
    fn drop(&mut self) {
        self.tracker.end_section(self.id);
    }
}
