// ABOUTME: Public task orchestration API used by host applications
// ABOUTME: Submits, cancels, queries and prunes sandboxed script tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Result, TaskError};
use crate::permissions::{Capability, PermissionBroker, PermissionPrompter};
use crate::registry::{CancelDisposition, RunOutcome, TaskRegistry};
use crate::sandbox::{QuickJsEngine, ScriptEngine};
use crate::types::{FailureKind, TaskEvent, TaskSnapshot};
use crate::worker::SandboxWorker;

const MAX_TASK_ID_LEN: usize = 256;

/// Facade over the registry, the permission broker and the sandbox workers
///
/// Must be created inside a Tokio runtime; the broker's decision loop and
/// cancellation watchdogs run on it.
pub struct TaskOrchestrator {
    registry: Arc<TaskRegistry>,
    broker: PermissionBroker,
    engine: Arc<dyn ScriptEngine>,
    config: OrchestratorConfig,
    runtime: Handle,
}

impl TaskOrchestrator {
    /// Orchestrator running scripts on QuickJS.
    pub fn new(config: OrchestratorConfig, prompter: Arc<dyn PermissionPrompter>) -> Result<Self> {
        let engine = Arc::new(QuickJsEngine::new(config.limits.clone()));
        Self::with_engine(config, prompter, engine)
    }

    pub fn with_engine(
        config: OrchestratorConfig,
        prompter: Arc<dyn PermissionPrompter>,
        engine: Arc<dyn ScriptEngine>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            TaskError::Runtime(format!("task orchestrator needs a Tokio runtime: {}", e))
        })?;
        let broker = PermissionBroker::spawn(&runtime, prompter);
        let registry = Arc::new(TaskRegistry::new(config.event_channel_size));

        info!(
            "Task orchestrator ready (grace period {}ms)",
            config.grace_period.as_millis()
        );

        Ok(Self {
            registry,
            broker,
            engine,
            config,
            runtime,
        })
    }

    /// Start `code` as task `task_id`. Returns once the worker is launched.
    ///
    /// Resubmitting an id whose previous run is terminal replays it as a new run.
    pub fn submit(&self, task_id: &str, code: &str) -> Result<()> {
        validate_task_id(task_id)?;
        let ticket = self.registry.begin_run(task_id, code)?;
        // A new lifecycle starts without the previous run's remembered answers.
        self.broker.clear_task(task_id);
        info!("Submitted task {} (run {})", task_id, ticket.run_id);

        let worker = SandboxWorker {
            task_id: task_id.to_string(),
            run_id: ticket.run_id,
            code: code.to_string(),
            cancel: ticket.cancel,
            broker: self.broker.clone(),
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            limits: self.config.limits.clone(),
            app_name: self.config.app_name.clone(),
        };

        match worker.spawn() {
            Ok(handle) => self.registry.attach_worker(task_id, ticket.run_id, handle),
            Err(e) => {
                error!("Failed to start worker for task {}: {}", task_id, e);
                self.registry.finish(
                    task_id,
                    ticket.run_id,
                    RunOutcome::Failed {
                        kind: FailureKind::Worker,
                        message: TaskError::WorkerSpawn(e).to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Request cancellation. A no-op for tasks already stopping or finished.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        match self.registry.request_stop(task_id)? {
            CancelDisposition::Signalled { run_id } => {
                info!("Cancelling task {} (run {})", task_id, run_id);
                self.spawn_watchdog(task_id, run_id);
            }
            CancelDisposition::AlreadyStopping => {
                debug!("Task {} is already stopping", task_id)
            }
            CancelDisposition::AlreadyFinished => {
                debug!("Task {} already finished, nothing to cancel", task_id)
            }
        }
        Ok(())
    }

    pub fn get_state(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.registry.snapshot(task_id)
    }

    /// Every registered task, oldest first
    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.list()
    }

    /// Remove finished tasks; running and stopping tasks are kept.
    pub fn prune_terminal(&self) -> Vec<String> {
        let removed = self.registry.prune_terminal();
        for task_id in &removed {
            self.broker.clear_task(task_id);
        }
        removed
    }

    /// Transition notifications for every task
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.registry.subscribe()
    }

    /// Wait until the current run of `task_id` is terminal.
    pub async fn wait_for_terminal(&self, task_id: &str, timeout: Duration) -> Result<TaskSnapshot> {
        // Subscribe before the first look so no transition slips between them.
        let mut events = self.registry.subscribe();
        let snapshot = self.get_state(task_id)?;
        if snapshot.state.is_terminal() {
            return Ok(snapshot);
        }
        let run_id = snapshot.run_id;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event)
                        if event.task_id == task_id
                            && event.run_id == run_id
                            && event.state.is_terminal() =>
                    {
                        return self.get_state(task_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Skipped {} task events while waiting for {}", skipped, task_id);
                        let current = self.get_state(task_id)?;
                        if current.run_id != run_id || current.state.is_terminal() {
                            return Ok(current);
                        }
                    }
                    Err(RecvError::Closed) => return self.get_state(task_id),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TaskError::WaitTimeout {
                task_id: task_id.to_string(),
            })?
    }

    /// Seed a session-wide permission decision.
    pub fn preauthorize(&self, capability: Capability, granted: bool) {
        self.broker.preauthorize(capability, granted);
    }

    /// Cancel every running task; returns the ids that were signalled.
    pub fn shutdown(&self) -> Vec<String> {
        let running = self.registry.running_ids();
        if !running.is_empty() {
            info!("Shutting down {} running tasks", running.len());
        }
        running
            .into_iter()
            .filter(|task_id| match self.cancel(task_id) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not cancel task {} during shutdown: {}", task_id, e);
                    false
                }
            })
            .collect()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Report the run as forcibly terminated if it is still stopping after the grace period.
    fn spawn_watchdog(&self, task_id: &str, run_id: u64) {
        let registry = Arc::clone(&self.registry);
        let grace_period = self.config.grace_period;
        let task_id = task_id.to_string();

        self.runtime.spawn(async move {
            tokio::time::sleep(grace_period).await;
            if registry.force_terminate(&task_id, run_id, grace_period) {
                warn!(
                    "Task {} (run {}) did not stop within {}ms and was forcibly terminated",
                    task_id,
                    run_id,
                    grace_period.as_millis()
                );
            }
        });
    }
}

fn validate_task_id(task_id: &str) -> Result<()> {
    let reason = if task_id.trim().is_empty() {
        "must not be empty"
    } else if task_id.len() > MAX_TASK_ID_LEN {
        "must be at most 256 bytes"
    } else if task_id.chars().any(char::is_control) {
        "must not contain control characters"
    } else {
        return Ok(());
    };
    Err(TaskError::InvalidTaskId {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
    })
}
