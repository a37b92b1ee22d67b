// ABOUTME: Session-scoped ledger of submitted tasks and their control handles
// ABOUTME: Enforces the lifecycle graph and publishes a notification for every transition

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TaskError};
use crate::types::{FailureKind, TaskEvent, TaskSnapshot, TaskState};

/// Handles a worker needs for one run
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    pub run_id: u64,
    pub cancel: CancellationToken,
}

/// How a worker finished, as reported to the registry
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunOutcome {
    Completed(Option<serde_json::Value>),
    Failed { kind: FailureKind, message: String },
    /// The worker observed its cancellation signal and unwound
    Stopped,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelDisposition {
    /// `running -> stopping` happened and the worker was signalled
    Signalled { run_id: u64 },
    AlreadyStopping,
    AlreadyFinished,
}

struct TaskEntry {
    run_id: u64,
    code: String,
    state: TaskState,
    result: Option<serde_json::Value>,
    error: Option<String>,
    failure_kind: Option<FailureKind>,
    submitted_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl TaskEntry {
    fn snapshot(&self, task_id: &str) -> TaskSnapshot {
        TaskSnapshot {
            id: task_id.to_string(),
            run_id: self.run_id,
            code: self.code.clone(),
            state: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
            failure_kind: self.failure_kind,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }
}

/// Mapping from task id to the current run of that id
///
/// Every mutation touches one entry under a short-held lock; nothing blocks
/// or performs I/O while the lock is held. Events are published under the
/// lock so the notification order for one task matches its transition order.
pub struct TaskRegistry {
    entries: Mutex<HashMap<String, TaskEntry>>,
    events: broadcast::Sender<TaskEvent>,
    next_run_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new(event_channel_size: usize) -> Self {
        let (events, _) = broadcast::channel(event_channel_size);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to transition notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        // A panic while holding the lock cannot leave an entry half-written:
        // every mutation assigns whole fields after validation.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new run in `running`, replacing a terminal predecessor.
    pub(crate) fn begin_run(&self, task_id: &str, code: &str) -> Result<RunTicket> {
        let mut entries = self.entries();

        if let Some(existing) = entries.get(task_id) {
            if !existing.state.is_terminal() {
                return Err(TaskError::DuplicateTask {
                    task_id: task_id.to_string(),
                });
            }
            debug!(
                "Replaying task {} (previous run {} ended {})",
                task_id, existing.run_id, existing.state
            );
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let entry = TaskEntry {
            run_id,
            code: code.to_string(),
            state: TaskState::Running,
            result: None,
            error: None,
            failure_kind: None,
            submitted_at: Utc::now(),
            finished_at: None,
            cancel: cancel.clone(),
            worker: None,
        };

        self.publish(task_id, &entry);
        entries.insert(task_id.to_string(), entry);

        Ok(RunTicket { run_id, cancel })
    }

    /// Keep the worker's join handle with the run it belongs to.
    pub(crate) fn attach_worker(&self, task_id: &str, run_id: u64, handle: JoinHandle<()>) {
        let mut entries = self.entries();
        match entries.get_mut(task_id) {
            Some(entry) if entry.run_id == run_id => entry.worker = Some(handle),
            _ => debug!("Run {} of task {} already replaced, detaching worker", run_id, task_id),
        }
    }

    /// Move a running task to `stopping` and fire its cancellation token.
    pub(crate) fn request_stop(&self, task_id: &str) -> Result<CancelDisposition> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(task_id)
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        match entry.state {
            TaskState::Running => {
                self.transition(task_id, entry, TaskState::Stopping);
                entry.cancel.cancel();
                Ok(CancelDisposition::Signalled {
                    run_id: entry.run_id,
                })
            }
            TaskState::Stopping => Ok(CancelDisposition::AlreadyStopping),
            _ => Ok(CancelDisposition::AlreadyFinished),
        }
    }

    /// Record the worker's report. Returns false when the report is stale
    /// (a different run) or the run already ended.
    ///
    /// A `stopping` task always resolves to `stopped` here, whatever the report.
    pub(crate) fn finish(&self, task_id: &str, run_id: u64, outcome: RunOutcome) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(task_id) else {
            debug!("Task {} was pruned before run {} reported", task_id, run_id);
            return false;
        };
        if entry.run_id != run_id || entry.state.is_terminal() {
            debug!(
                "Ignoring report for run {} of task {} (current run {}, state {})",
                run_id, task_id, entry.run_id, entry.state
            );
            return false;
        }

        match (entry.state, outcome) {
            (TaskState::Running, RunOutcome::Completed(value)) => {
                entry.result = value;
                self.transition(task_id, entry, TaskState::Completed)
            }
            (TaskState::Running, RunOutcome::Failed { kind, message }) => {
                entry.error = Some(message);
                entry.failure_kind = Some(kind);
                self.transition(task_id, entry, TaskState::Error)
            }
            (TaskState::Running, RunOutcome::Stopped) => {
                // Cancelled without going through request_stop; keep the path valid.
                self.transition(task_id, entry, TaskState::Stopping);
                self.transition(task_id, entry, TaskState::Stopped)
            }
            // Once cancellation was accepted, every report (worker panics
            // included) ends the unwind. Only the watchdog reaches error.
            (TaskState::Stopping, _) => self.transition(task_id, entry, TaskState::Stopped),
            _ => false,
        }
    }

    /// Report a run that ignored cancellation for the whole grace period.
    pub(crate) fn force_terminate(&self, task_id: &str, run_id: u64, grace_period: Duration) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(task_id) else {
            return false;
        };
        if entry.run_id != run_id || entry.state != TaskState::Stopping {
            return false;
        }

        let grace_ms = grace_period.as_millis() as u64;
        entry.error = Some(
            TaskError::ForcedTermination {
                task_id: task_id.to_string(),
                grace_ms,
            }
            .to_string(),
        );
        entry.failure_kind = Some(FailureKind::ForcedTermination);

        if let Some(worker) = entry.worker.take() {
            if !worker.is_finished() {
                warn!(
                    "Detaching sandbox worker for task {} (run {}) that is still executing",
                    task_id, run_id
                );
            }
        }

        self.transition(task_id, entry, TaskState::Error)
    }

    pub fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot> {
        let entries = self.entries();
        entries
            .get(task_id)
            .map(|entry| entry.snapshot(task_id))
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// All tasks, oldest submission first
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let entries = self.entries();
        let mut snapshots: Vec<TaskSnapshot> = entries
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .collect();
        snapshots.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then(a.run_id.cmp(&b.run_id))
        });
        snapshots
    }

    /// Ids of tasks still in `running`
    pub(crate) fn running_ids(&self) -> Vec<String> {
        let entries = self.entries();
        entries
            .iter()
            .filter(|(_, entry)| entry.state == TaskState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove every terminal task; returns the removed ids.
    pub fn prune_terminal(&self) -> Vec<String> {
        let mut entries = self.entries();
        let mut removed = Vec::new();
        entries.retain(|id, entry| {
            if entry.state.is_terminal() {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            info!("Pruned {} finished tasks", removed.len());
        }
        removed
    }

    fn transition(&self, task_id: &str, entry: &mut TaskEntry, next: TaskState) -> bool {
        if !entry.state.can_transition_to(next) {
            warn!(
                "Rejected transition {} -> {} for task {}",
                entry.state, next, task_id
            );
            return false;
        }

        entry.state = next;
        if next.is_terminal() {
            entry.finished_at = Some(Utc::now());
        }
        info!("Task {} (run {}) is now {}", task_id, entry.run_id, next);
        self.publish(task_id, entry);
        true
    }

    fn publish(&self, task_id: &str, entry: &TaskEntry) {
        let event = TaskEvent {
            task_id: task_id.to_string(),
            run_id: entry.run_id,
            state: entry.state,
            result: entry.result.clone(),
            error: entry.error.clone(),
            timestamp: Utc::now(),
        };
        // Best-effort: no subscribers is the normal headless case.
        if self.events.send(event).is_err() {
            debug!("No subscribers for task {} event", task_id);
        }
    }
}
