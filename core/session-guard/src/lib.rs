//! # session-guard
//!
//! Mutation coordination and session continuity for single-page API clients.
//!
//! Three kinds of non-determinism make naive request/response code misbehave
//! in a browser-hosted app: UI events racing to mutate the same resource,
//! transient failures that must be retried without duplicating side effects,
//! and page reloads that replay initialization against a credential store that
//! has not caught up yet. This crate coordinates all three.
//!
//! ## Components
//!
//! - [`op_lock`]: per-key join-or-execute with capped exponential retry
//! - [`refresh_limiter`]: sliding-window reload detector with timed lockout
//! - [`critical_section`]: overlapping "operation in flight" markers
//! - [`gate`]: eight-guard decision on whether a 401 really ends the session
//! - [`coordinator`]: the handle that composes the above
//! - [`transport`]: interceptor that feeds transport outcomes to the gate
//!
//! ## Design Principles
//!
//! - **Explicit instance**: no globals; the composition root owns one
//!   [`SessionCoordinator`] and clones it where needed.
//! - **Time-driven, not caller-driven**: lockouts, grace windows and leaked
//!   critical sections expire on the clock, checked whenever they are observed.
//! - **Tokio clock**: all in-memory timing uses `tokio::time::Instant`, so
//!   tests run on a paused clock.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use session_guard::{GuardConfig, SessionCoordinator, TransportError};
//!
//! let coordinator = SessionCoordinator::new(GuardConfig::default());
//! coordinator.register_logout_callback(|| router.go("/login"));
//!
//! let saved = coordinator
//!     .execute_exclusive("equipment:update:7", move || api.update(7, form.clone()))
//!     .await?;
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod coordinator;
pub mod critical_section;
pub mod error;
pub mod gate;
pub mod op_lock;
pub mod refresh_limiter;
pub mod signals;
pub mod storage;
pub mod terminator;
pub mod transport;

pub use config::{load_config, GuardConfig};
pub use coordinator::{CoordinatorBuilder, DebugSnapshot, LifecycleReport, SessionCoordinator};
pub use critical_section::{CriticalSectionGuard, SectionId};
pub use error::{GuardError, OperationError, Result, TransportError};
pub use gate::{Decision, Guard};
pub use refresh_limiter::LockoutReason;
pub use signals::{LifecycleEvent, NavigationType, ReloadSignals};
pub use storage::{
    CredentialStore, FileSessionStorage, MemoryCredentialStore, MemorySessionStorage,
    SessionStorage,
};
pub use terminator::{HardRedirectFallback, InjectedNavigator, SessionTerminator, TerminatorKind};
pub use transport::{ApiRequest, ApiResponse, GuardedTransport, Method, Transport};

/// Locks coordination state, recovering from poisoning. Every mutation made
/// under these locks is a single assignment or collection operation.
pub(crate) fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
