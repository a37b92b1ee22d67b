// ABOUTME: Script engine seam used by sandbox workers
// ABOUTME: An engine runs one script to an outcome with the host bridge installed

pub mod bridge;
pub mod quickjs;

use tokio_util::sync::CancellationToken;

pub use bridge::{BridgeError, HostBridge};
pub use quickjs::QuickJsEngine;

/// Everything an engine needs for one run
pub struct ExecutionContext {
    pub task_id: String,
    pub run_id: u64,
    pub code: String,
    /// Fires when the task is cancelled
    pub cancel: CancellationToken,
    pub bridge: HostBridge,
}

/// How a script run ended
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    /// Normal completion with the value registered through `returnValue`, if any
    Completed(Option<serde_json::Value>),
    /// Uncaught failure, description kept verbatim
    Failed(String),
    /// Execution was abandoned after the cancellation signal
    Interrupted,
}

/// Executes scripts in an isolated context
///
/// `execute` is called on the worker's own thread and may block it.
pub trait ScriptEngine: Send + Sync {
    fn execute(&self, context: ExecutionContext) -> ScriptOutcome;
}
