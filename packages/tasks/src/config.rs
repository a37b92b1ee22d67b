// ABOUTME: Orchestrator configuration with environment overrides
// ABOUTME: Cancellation grace period, channel sizes and per-sandbox resource limits

use std::time::Duration;

use runbox_config::constants;
use runbox_config::env::{
    parse_env_or_default_with_validation, parse_env_with_fallback, parse_millis_env,
};

/// Default bound on cooperative cancellation before a worker is abandoned
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Default capacity for the task event broadcast channel
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;

const DEFAULT_MEMORY_LIMIT_MB: usize = 64;
const DEFAULT_STACK_LIMIT_KB: usize = 1024;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_APP_NAME: &str = "runbox";

/// Resource limits applied to every sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
    pub http_timeout: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_MB * 1024 * 1024,
            max_stack_bytes: DEFAULT_STACK_LIMIT_KB * 1024,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

/// Orchestrator-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Time a cancelled worker gets to unwind before it is reported as forcibly terminated
    pub grace_period: Duration,
    pub event_channel_size: usize,
    pub limits: SandboxLimits,
    /// Used to resolve the `app_data` directory for scripts
    pub app_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
            limits: SandboxLimits::default(),
            app_name: DEFAULT_APP_NAME.to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `RUNBOX_*` environment variables.
    ///
    /// Out-of-range values are logged and ignored.
    pub fn from_env() -> Self {
        let grace_period = parse_millis_env(
            constants::RUNBOX_CANCEL_GRACE_MS,
            DEFAULT_GRACE_PERIOD,
            Duration::from_millis(100),
            Duration::from_secs(60),
        );

        let event_channel_size = parse_env_or_default_with_validation(
            constants::RUNBOX_TASK_EVENT_CHANNEL_SIZE,
            DEFAULT_EVENT_CHANNEL_SIZE,
            |v| (10..=10000).contains(&v),
        );

        let memory_mb = parse_env_or_default_with_validation(
            constants::RUNBOX_SCRIPT_MEMORY_LIMIT_MB,
            DEFAULT_MEMORY_LIMIT_MB,
            |v| (8..=4096).contains(&v),
        );

        let stack_kb = parse_env_or_default_with_validation(
            constants::RUNBOX_SCRIPT_STACK_LIMIT_KB,
            DEFAULT_STACK_LIMIT_KB,
            |v| (256..=65536).contains(&v),
        );

        let http_timeout_secs = parse_env_or_default_with_validation(
            constants::RUNBOX_HTTP_TIMEOUT_SECS,
            DEFAULT_HTTP_TIMEOUT_SECS,
            |v| (1..=600).contains(&v),
        );

        let app_name: String = parse_env_with_fallback(
            constants::RUNBOX_APP_NAME,
            constants::APP_NAME,
            DEFAULT_APP_NAME.to_string(),
        );

        Self {
            grace_period,
            event_channel_size,
            limits: SandboxLimits {
                memory_limit_bytes: memory_mb * 1024 * 1024,
                max_stack_bytes: stack_kb * 1024,
                http_timeout: Duration::from_secs(http_timeout_secs),
            },
            app_name,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}
