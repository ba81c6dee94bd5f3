//! Page lifecycle events and the "was this a reload?" heuristic.
//!
//! Each heuristic is an independent boolean signal computed once per event from
//! plain inputs, then OR-combined into [`ReloadSignals::suspected_reload`].
//! Nothing here touches shared state, so tests can feed synthetic inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::SignalConfig;

/// Navigation type as reported by the browser Performance API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationType {
    #[default]
    Navigate,
    Reload,
    BackForward,
    Prerender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Load {
        #[serde(default)]
        navigation: NavigationType,
    },
    Unload,
    VisibilityChange {
        visible: bool,
    },
    /// F5, Ctrl/Cmd+R and friends.
    RefreshShortcut,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Load { .. } => "load",
            LifecycleEvent::Unload => "unload",
            LifecycleEvent::VisibilityChange { .. } => "visibility_change",
            LifecycleEvent::RefreshShortcut => "refresh_shortcut",
        }
    }
}

/// Everything the heuristic needs, captured at event time.
#[derive(Debug, Clone, Copy)]
pub struct SignalInputs {
    pub event: LifecycleEvent,
    pub now: Instant,
    pub wall_now: DateTime<Utc>,
    /// Page-load marker persisted by the previous load, if any.
    pub previous_load: Option<DateTime<Utc>>,
    /// When the page was last hidden, if it has not been shown since.
    pub hidden_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSignals {
    pub recent_page_load: bool,
    pub fast_visibility_return: bool,
    pub reload_navigation: bool,
    pub refresh_shortcut: bool,
}

impl ReloadSignals {
    pub fn evaluate(inputs: &SignalInputs, config: &SignalConfig) -> Self {
        let mut signals = ReloadSignals::default();

        match inputs.event {
            LifecycleEvent::Load { navigation } => {
                signals.reload_navigation = navigation == NavigationType::Reload;
                signals.recent_page_load = inputs
                    .previous_load
                    .and_then(|previous| (inputs.wall_now - previous).to_std().ok())
                    .map(|since| since < config.recent_load())
                    .unwrap_or(false);
            }
            LifecycleEvent::VisibilityChange { visible: true } => {
                signals.fast_visibility_return = inputs
                    .hidden_at
                    .map(|hidden_at| inputs.now.duration_since(hidden_at) < config.fast_visibility())
                    .unwrap_or(false);
            }
            LifecycleEvent::RefreshShortcut => {
                signals.refresh_shortcut = true;
            }
            LifecycleEvent::VisibilityChange { visible: false } | LifecycleEvent::Unload => {}
        }

        signals
    }

    pub fn suspected_reload(&self) -> bool {
        self.recent_page_load
            || self.fast_visibility_return
            || self.reload_navigation
            || self.refresh_shortcut
    }
}
