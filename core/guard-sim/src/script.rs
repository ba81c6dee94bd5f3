//! Replay script format.
//!
//! ```json
//! {
//!   "steps": [
//!     { "at_ms": 0,   "action": { "type": "lifecycle", "event": { "kind": "load", "navigation": "reload" } } },
//!     { "at_ms": 50,  "action": { "type": "auth_failure" } },
//!     { "at_ms": 100, "action": { "type": "mutate", "key": "update-7", "outcome": "ok", "duration_ms": 20 } }
//!   ]
//! }
//! ```

use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_guard::{ApiResponse, LifecycleEvent, TransportError};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid script: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Step {index} at {at_ms}ms is earlier than the step before it")]
    OutOfOrder { index: usize, at_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Step {
    pub at_ms: u64,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Lifecycle {
        event: LifecycleEvent,
    },
    AuthFailure,
    Success,
    CriticalStart {
        #[serde(default = "default_label")]
        label: String,
    },
    CriticalEnd,
    Check,
    Mutate {
        key: String,
        #[serde(default)]
        outcome: MutateOutcome,
        #[serde(default)]
        duration_ms: u64,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Lifecycle { .. } => "lifecycle",
            Action::AuthFailure => "auth_failure",
            Action::Success => "success",
            Action::CriticalStart { .. } => "critical_start",
            Action::CriticalEnd => "critical_end",
            Action::Check => "check",
            Action::Mutate { .. } => "mutate",
        }
    }
}

fn default_label() -> String {
    "script".to_string()
}

/// What every attempt of a scripted mutation returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutateOutcome {
    #[default]
    Ok,
    Network,
    Server,
    Unauthorized,
}

impl MutateOutcome {
    pub fn into_result(self) -> Result<ApiResponse, TransportError> {
        match self {
            MutateOutcome::Ok => Ok(ApiResponse {
                status: 200,
                body: Value::Null,
            }),
            MutateOutcome::Network => Err(TransportError::Network("simulated".to_string())),
            MutateOutcome::Server => Err(TransportError::from_status(503, "simulated")),
            MutateOutcome::Unauthorized => Err(TransportError::unauthorized("simulated")),
        }
    }
}

pub fn load(path: &Path) -> Result<Script, ScriptError> {
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Script, ScriptError> {
    let script: Script = serde_json::from_str(content)?;

    let mut previous = 0;
    for (index, step) in script.steps.iter().enumerate() {
        if step.at_ms < previous {
            return Err(ScriptError::OutOfOrder {
                index,
                at_ms: step.at_ms,
            });
        }
        previous = step.at_ms;
    }

    Ok(script)
}
