//! Tunable thresholds for the coordinator.
//!
//! The timings are empirically tuned (they exist to keep page reloads from
//! looking like expired sessions) so every one of them is overridable from a
//! TOML file. Missing keys fall back to the defaults below.
//!
//! ```toml
//! [refresh]
//! max_refreshes = 2
//! lockout_ms = 30000
//!
//! [gate]
//! debounce_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GuardError, Result};

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".session-guard/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub signals: SignalConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub critical_section: CriticalSectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long a settled result keeps answering duplicate calls.
    pub grace_ms: u64,
    pub recent_use_window_ms: u64,
    pub resubmit_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            grace_ms: 2_000,
            recent_use_window_ms: 5_000,
            resubmit_delay_ms: 1_000,
        }
    }
}

impl LockConfig {
    /// Delay before retry number `attempt + 1`, given that `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn recent_use_window(&self) -> Duration {
        Duration::from_millis(self.recent_use_window_ms)
    }

    pub fn resubmit_delay(&self) -> Duration {
        Duration::from_millis(self.resubmit_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub max_refreshes: usize,
    pub time_window_ms: u64,
    pub lockout_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_refreshes: 2,
            time_window_ms: 10_000,
            lockout_ms: 30_000,
        }
    }
}

impl RefreshConfig {
    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }

    pub fn lockout(&self) -> Duration {
        Duration::from_millis(self.lockout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// A load this soon after the previous one counts as a reload.
    pub recent_load_ms: u64,
    /// A hidden→visible flip faster than this counts as a reload.
    pub fast_visibility_ms: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            recent_load_ms: 3_000,
            fast_visibility_ms: 1_000,
        }
    }
}

impl SignalConfig {
    pub fn recent_load(&self) -> Duration {
        Duration::from_millis(self.recent_load_ms)
    }

    pub fn fast_visibility(&self) -> Duration {
        Duration::from_millis(self.fast_visibility_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub initialization_grace_ms: u64,
    pub focus_grace_ms: u64,
    pub shield_delay_ms: u64,
    pub rapid_shield_delay_ms: u64,
    pub refresh_recency_ms: u64,
    pub burst_window_ms: u64,
    pub burst_max_failures: usize,
    pub debounce_ms: u64,
    pub redirect_delay_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            initialization_grace_ms: 60_000,
            focus_grace_ms: 3_000,
            shield_delay_ms: 3_000,
            rapid_shield_delay_ms: 10_000,
            refresh_recency_ms: 20_000,
            burst_window_ms: 2_000,
            burst_max_failures: 3,
            debounce_ms: 5_000,
            redirect_delay_ms: 100,
        }
    }
}

impl GateConfig {
    pub fn initialization_grace(&self) -> Duration {
        Duration::from_millis(self.initialization_grace_ms)
    }

    pub fn focus_grace(&self) -> Duration {
        Duration::from_millis(self.focus_grace_ms)
    }

    pub fn shield_delay(&self) -> Duration {
        Duration::from_millis(self.shield_delay_ms)
    }

    pub fn rapid_shield_delay(&self) -> Duration {
        Duration::from_millis(self.rapid_shield_delay_ms)
    }

    pub fn refresh_recency(&self) -> Duration {
        Duration::from_millis(self.refresh_recency_ms)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn redirect_delay(&self) -> Duration {
        Duration::from_millis(self.redirect_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalSectionConfig {
    pub timeout_ms: u64,
}

impl Default for CriticalSectionConfig {
    fn default() -> Self {
        Self { timeout_ms: 60_000 }
    }
}

impl CriticalSectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Returns `~/.session-guard/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(GuardError::HomeDirNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

/// Loads configuration, returning defaults if the file doesn't exist.
pub fn load_config(path: Option<PathBuf>) -> Result<GuardConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(GuardConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| GuardError::Io {
        context: format!("Failed to read config {}", config_path.display()),
        source,
    })?;
    parse_config(&config_path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<GuardConfig> {
    toml::from_str::<GuardConfig>(content).map_err(|err| GuardError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
