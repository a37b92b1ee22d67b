// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Runbox

// Task Lifecycle
pub const RUNBOX_CANCEL_GRACE_MS: &str = "RUNBOX_CANCEL_GRACE_MS";
pub const RUNBOX_TASK_EVENT_CHANNEL_SIZE: &str = "RUNBOX_TASK_EVENT_CHANNEL_SIZE";

// Permission Prompts
pub const RUNBOX_PROMPT_EVENT_CHANNEL_SIZE: &str = "RUNBOX_PROMPT_EVENT_CHANNEL_SIZE";

// Script Sandbox Limits
pub const RUNBOX_SCRIPT_MEMORY_LIMIT_MB: &str = "RUNBOX_SCRIPT_MEMORY_LIMIT_MB";
pub const RUNBOX_SCRIPT_STACK_LIMIT_KB: &str = "RUNBOX_SCRIPT_STACK_LIMIT_KB";
pub const RUNBOX_HTTP_TIMEOUT_SECS: &str = "RUNBOX_HTTP_TIMEOUT_SECS";

// Application Identity
pub const RUNBOX_APP_NAME: &str = "RUNBOX_APP_NAME";
pub const APP_NAME: &str = "APP_NAME"; // Legacy

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
