// ABOUTME: Core type definitions for script tasks
// ABOUTME: Lifecycle states, transition rules, snapshots and notification events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task
///
/// ```text
/// running ──► completed
///    │   └──► error
///    ▼
/// stopping ──► stopped
///         └──► error   (forced termination)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopping,
    Stopped,
    Completed,
    Error,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
            TaskState::Completed => "completed",
            TaskState::Error => "error",
        }
    }

    /// `stopped`, `completed` and `error` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Stopped | TaskState::Completed | TaskState::Error
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Error)
                | (TaskState::Running, TaskState::Stopping)
                | (TaskState::Stopping, TaskState::Stopped)
                | (TaskState::Stopping, TaskState::Error)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended in `error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Uncaught script failure, including unhandled permission denials
    Script,
    /// Cancellation exceeded the grace period and the worker was abandoned
    ForcedTermination,
    /// The worker itself could not run (spawn failure, panic, engine setup)
    Worker,
}

/// Consistent point-in-time view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    /// Identifies the lifecycle instance; a replay under the same id gets a new one
    pub run_id: u64,
    /// Script text of this run
    pub code: String,
    pub state: TaskState,
    /// Value registered through `returnValue`, only set once `completed`
    pub result: Option<serde_json::Value>,
    /// Failure description, only set in `error`
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Notification published on every state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub run_id: u64,
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}
