// ABOUTME: Error types for task orchestration
// ABOUTME: API contract violations plus the failure descriptions recorded on terminal tasks

use thiserror::Error;

/// Main error type for task operations
#[derive(Error, Debug)]
pub enum TaskError {
    /// Submission or replay against an id whose current run has not finished
    #[error("Task already running: {task_id}")]
    DuplicateTask { task_id: String },

    /// Operation referenced an id that is not in the registry
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Task id rejected before registration
    #[error("Invalid task id '{task_id}': {reason}")]
    InvalidTaskId { task_id: String, reason: String },

    /// Uncaught failure raised by the script, message kept verbatim
    #[error("{0}")]
    ScriptRuntime(String),

    /// A capability request was denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Cancellation did not finish inside the grace window
    #[error("Task {task_id} was forcibly terminated after a {grace_ms}ms grace period")]
    ForcedTermination { task_id: String, grace_ms: u64 },

    /// The worker thread could not be started
    #[error("Failed to spawn sandbox worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// Missing or broken async runtime
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// `wait_for_terminal` gave up
    #[error("Timed out waiting for task {task_id} to finish")]
    WaitTimeout { task_id: String },

    /// Response for a prompt that is no longer pending
    #[error("Permission prompt not found: {prompt_id}")]
    PromptNotFound { prompt_id: String },

    /// The host could not present a prompt
    #[error("Permission prompt unavailable: {0}")]
    PromptUnavailable(String),
}

/// Type alias for Results that return TaskError
pub type Result<T> = std::result::Result<T, TaskError>;
