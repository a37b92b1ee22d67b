// ABOUTME: Sandbox worker that owns one task run on a dedicated OS thread
// ABOUTME: Builds the host bridge, runs the engine and reports exactly one outcome to the registry

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

use crate::config::SandboxLimits;
use crate::error::TaskError;
use crate::permissions::PermissionBroker;
use crate::registry::{RunOutcome, TaskRegistry};
use crate::sandbox::{ExecutionContext, HostBridge, ScriptEngine, ScriptOutcome};
use crate::types::FailureKind;

/// Everything a worker thread takes ownership of
pub(crate) struct SandboxWorker {
    pub task_id: String,
    pub run_id: u64,
    pub code: String,
    pub cancel: CancellationToken,
    pub broker: PermissionBroker,
    pub engine: Arc<dyn ScriptEngine>,
    pub registry: Arc<TaskRegistry>,
    pub limits: SandboxLimits,
    pub app_name: String,
}

impl SandboxWorker {
    /// Start the run on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("runbox-worker-{}", self.run_id))
            .spawn(move || self.run())
    }

    fn run(self) {
        let span = info_span!("sandbox_worker", task_id = %self.task_id, run_id = self.run_id);
        let _guard = span.enter();

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = format!("Sandbox worker panicked: {}", panic_message(payload.as_ref()));
                error!("{}", message);
                RunOutcome::Failed {
                    kind: FailureKind::Worker,
                    message,
                }
            }
        };

        if !self.registry.finish(&self.task_id, self.run_id, outcome) {
            info!("Run finished after its task was already settled");
        }
    }

    fn execute(&self) -> RunOutcome {
        let bridge = match HostBridge::new(
            &self.task_id,
            &self.app_name,
            self.cancel.clone(),
            self.broker.clone(),
            &self.limits,
        ) {
            Ok(bridge) => bridge,
            Err(e) => {
                error!("Failed to prepare sandbox: {}", e);
                return RunOutcome::Failed {
                    kind: FailureKind::Worker,
                    message: format!("Failed to prepare sandbox: {}", e),
                };
            }
        };

        let context = ExecutionContext {
            task_id: self.task_id.clone(),
            run_id: self.run_id,
            code: self.code.clone(),
            cancel: self.cancel.clone(),
            bridge,
        };

        match self.engine.execute(context) {
            ScriptOutcome::Interrupted => RunOutcome::Stopped,
            // Failures raised while unwinding a cancelled run are part of the stop.
            _ if self.cancel.is_cancelled() => RunOutcome::Stopped,
            ScriptOutcome::Completed(value) => RunOutcome::Completed(value),
            ScriptOutcome::Failed(message) => RunOutcome::Failed {
                kind: FailureKind::Script,
                message: TaskError::ScriptRuntime(message).to_string(),
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
