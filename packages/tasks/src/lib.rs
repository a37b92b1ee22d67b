// ABOUTME: Sandboxed script task orchestration for Runbox
// ABOUTME: Parallel QuickJS workers with a finite-state lifecycle and a serialized permission broker

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod permissions;
mod registry;
pub mod sandbox;
pub mod types;
mod worker;

// Re-export commonly used types
pub use config::{OrchestratorConfig, SandboxLimits};
pub use error::{Result, TaskError};
pub use orchestrator::TaskOrchestrator;
pub use permissions::{
    Capability, CapabilityKind, EventPrompter, PermissionDecision, PermissionPrompt,
    PermissionPrompter, PermissionResponse, PromptEvent, RememberScope, StaticPrompter,
};
pub use sandbox::{ExecutionContext, QuickJsEngine, ScriptEngine, ScriptOutcome};
pub use types::{FailureKind, TaskEvent, TaskSnapshot, TaskState};
