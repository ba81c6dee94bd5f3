//! How a session actually ends once the gate approves termination.
//!
//! The gate only sees [`SessionTerminator`]. Hosts that own their routing
//! register an [`InjectedNavigator`]; everything else gets the
//! [`HardRedirectFallback`], which waits briefly and then hands a login URL to
//! a redirect sink.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

pub type LogoutCallback = Arc<dyn Fn() + Send + Sync>;
pub type RedirectSink = Arc<dyn Fn(&str) + Send + Sync>;

pub const DEFAULT_LOGIN_LOCATION: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatorKind {
    InjectedNavigator,
    HardRedirectFallback,
}

#[async_trait]
pub trait SessionTerminator: Send + Sync {
    fn kind(&self) -> TerminatorKind;

    async fn terminate(&self);
}

pub struct InjectedNavigator {
    callback: LogoutCallback,
}

impl InjectedNavigator {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for InjectedNavigator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedNavigator").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionTerminator for InjectedNavigator {
    fn kind(&self) -> TerminatorKind {
        TerminatorKind::InjectedNavigator
    }

    async fn terminate(&self) {
        (self.callback)();
    }
}

pub struct HardRedirectFallback {
    location: String,
    delay: Duration,
    sink: RedirectSink,
}

impl HardRedirectFallback {
    pub fn new(location: impl Into<String>, delay: Duration, sink: RedirectSink) -> Self {
        Self {
            location: location.into(),
            delay,
            sink,
        }
    }

    /// Fallback whose sink only logs; used until the host registers a navigator.
    pub fn logging(delay: Duration) -> Self {
        Self::new(
            DEFAULT_LOGIN_LOCATION,
            delay,
            Arc::new(|location: &str| info!(location, "Hard redirect requested")),
        )
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

impl fmt::Debug for HardRedirectFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardRedirectFallback")
            .field("location", &self.location)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionTerminator for HardRedirectFallback {
    fn kind(&self) -> TerminatorKind {
        TerminatorKind::HardRedirectFallback
    }

    async fn terminate(&self) {
        sleep(self.delay).await;
        (self.sink)(&self.location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[tokio::test]
    async fn injected_navigator_invokes_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let navigator = InjectedNavigator::new({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        navigator.terminate().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(navigator.kind(), TerminatorKind::InjectedNavigator);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_redirect_waits_then_redirects() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fallback = HardRedirectFallback::new(
            "/signin",
            Duration::from_millis(100),
            Arc::new({
                let seen = Arc::clone(&seen);
                move |location: &str| seen.lock().unwrap().push(location.to_string())
            }),
        );

        let started = Instant::now();
        fallback.terminate().await;
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), vec!["/signin".to_string()]);
    }
}
