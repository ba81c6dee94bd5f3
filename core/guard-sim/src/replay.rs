//! Drives a coordinator through a script on a paused tokio clock.
//!
//! Each step sleeps until its offset, applies the action and prints one JSON
//! line with the outcome and a full debug snapshot. Mutations go through a
//! [`GuardedTransport`] on spawned tasks so later steps can overlap them;
//! their results are printed after the last step, in step order.

use async_trait::async_trait;
use serde_json::{json, Value};
use session_guard::{
    load_config, ApiRequest, ApiResponse, FileSessionStorage, GuardError, GuardedTransport,
    MemoryCredentialStore, Method, OperationError, SessionCoordinator, SessionStorage, Transport,
    TransportError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

use crate::script::{self, Action, MutateOutcome, Script, ScriptError};

#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Config(#[from] GuardError),

    #[error("Failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Mutation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct PendingMutation {
    step: usize,
    key: String,
    handle: JoinHandle<Result<ApiResponse, OperationError>>,
}

/// Answers every attempt with the step's scripted outcome after `latency`.
struct ScriptedTransport {
    outcome: MutateOutcome,
    latency: Duration,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        debug!(path = %request.path, outcome = ?self.outcome, "Scripted request");
        sleep(self.latency).await;
        self.outcome.into_result()
    }
}

pub fn run(
    script_path: &Path,
    config_path: Option<PathBuf>,
    session_file: Option<PathBuf>,
) -> Result<(), SimError> {
    let script = script::load(script_path)?;
    let config = load_config(config_path)?;

    let mut builder = SessionCoordinator::builder()
        .config(config)
        .credentials(Arc::new(MemoryCredentialStore::with_token("simulated")));
    if let Some(path) = session_file {
        let storage: Arc<dyn SessionStorage> = Arc::new(FileSessionStorage::new(path));
        builder = builder.session_storage(storage);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()?;

    info!(steps = script.steps.len(), "Replaying script");
    runtime.block_on(async move {
        // Built inside the runtime so its clock anchors to virtual time.
        let coordinator = builder.build();
        replay(&coordinator, script).await
    })
}

async fn replay(coordinator: &SessionCoordinator, script: Script) -> Result<(), SimError> {
    let origin = Instant::now();
    let mut pending = Vec::new();

    for (index, step) in script.steps.into_iter().enumerate() {
        sleep_until(origin + Duration::from_millis(step.at_ms)).await;
        debug!(step = index, action = step.action.name(), "Applying step");

        let outcome = apply(coordinator, index, step.action.clone(), &mut pending).await;
        emit(json!({
            "step": index,
            "at_ms": step.at_ms,
            "action": step.action.name(),
            "outcome": outcome,
            "snapshot": coordinator.debug_snapshot(),
        }))?;
    }

    for mutation in pending {
        let result = match mutation.handle.await? {
            Ok(response) => json!({ "ok": response.status }),
            Err(e) => json!({ "error": e.to_string(), "auth": e.is_auth() }),
        };
        emit(json!({
            "step": mutation.step,
            "mutation": mutation.key,
            "result": result,
        }))?;
    }

    emit(json!({ "final": coordinator.debug_snapshot() }))
}

async fn apply(
    coordinator: &SessionCoordinator,
    index: usize,
    action: Action,
    pending: &mut Vec<PendingMutation>,
) -> Value {
    match action {
        Action::Lifecycle { event } => json!(coordinator.record_page_lifecycle_event(event)),
        Action::AuthFailure => json!(coordinator.on_auth_failure().await),
        Action::Success => {
            coordinator.on_success();
            Value::Null
        }
        Action::CriticalStart { label } => {
            json!({ "section": coordinator.begin_critical_section(&label) })
        }
        Action::CriticalEnd => {
            coordinator.end_critical_section();
            Value::Null
        }
        Action::Check => json!({ "may_terminate": coordinator.may_terminate_session() }),
        Action::Mutate {
            key,
            outcome,
            duration_ms,
        } => {
            // Through the interceptor, so a scripted 401 reaches the gate.
            let transport = GuardedTransport::new(
                ScriptedTransport {
                    outcome,
                    latency: Duration::from_millis(duration_ms),
                },
                coordinator.clone(),
            );
            let request = ApiRequest::new(Method::Put, format!("/{}", key));
            let handle = tokio::spawn({
                let key = key.clone();
                async move { transport.send_exclusive(&key, request).await }
            });
            // Let the task reach the registry before the snapshot is taken.
            tokio::task::yield_now().await;
            pending.push(PendingMutation {
                step: index,
                key: key.clone(),
                handle,
            });
            json!({ "key": key })
        }
    }
}

fn emit(line: Value) -> Result<(), SimError> {
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}
