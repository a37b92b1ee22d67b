// ABOUTME: Capability and decision types for sandbox permission checks
// ABOUTME: Shared by the broker, the decision cache and host prompt implementations

pub mod broker;
pub mod cache;
pub mod prompter;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use broker::{PermissionBroker, PermissionCheck};
pub use cache::DecisionCache;
pub use prompter::{EventPrompter, PermissionPrompter, PromptEvent, StaticPrompter};

/// Kind of outside access a script can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Read,
    Write,
    Net,
    Env,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Read => "read",
            CapabilityKind::Write => "write",
            CapabilityKind::Net => "net",
            CapabilityKind::Env => "env",
        }
    }
}

impl FromStr for CapabilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(CapabilityKind::Read),
            "write" => Ok(CapabilityKind::Write),
            "net" => Ok(CapabilityKind::Net),
            "env" => Ok(CapabilityKind::Env),
            other => Err(format!("unknown capability kind '{}'", other)),
        }
    }
}

/// A requested capability: a kind plus an optional target (path, host, variable)
///
/// A capability without a target stands for every target of its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub kind: CapabilityKind,
    pub target: Option<String>,
}

impl Capability {
    pub fn new(kind: CapabilityKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: Some(target.into()),
        }
    }

    pub fn any(kind: CapabilityKind) -> Self {
        Self { kind, target: None }
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Read, path)
    }

    pub fn write(path: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Write, path)
    }

    pub fn net(host: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Net, host)
    }

    pub fn env(name: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Env, name)
    }

    /// The same kind without a target
    pub fn widened(&self) -> Self {
        Self::any(self.kind)
    }

    /// Human readable form used in prompts and denial messages
    pub fn describe(&self) -> String {
        match &self.target {
            Some(target) => format!("{} access to \"{}\"", self.kind.as_str(), target),
            None => format!("{} access", self.kind.as_str()),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    /// Parses `kind` or `kind=target`, e.g. `net=example.com`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((kind, target)) if !target.trim().is_empty() => {
                Ok(Capability::new(kind.parse()?, target.trim()))
            }
            Some((kind, _)) => Ok(Capability::any(kind.parse()?)),
            None => Ok(Capability::any(s.parse()?)),
        }
    }
}

/// How long a decision is remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RememberScope {
    /// Applies to this request only
    Once,
    /// Cached for the requesting task
    Task,
    /// Cached for every task in the session
    Global,
}

/// Answer to a permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub granted: bool,
    pub remember: RememberScope,
    /// Remember for every target of the capability's kind
    pub all_targets: bool,
}

impl PermissionDecision {
    pub fn allow_once() -> Self {
        Self {
            granted: true,
            remember: RememberScope::Once,
            all_targets: false,
        }
    }

    pub fn deny_once() -> Self {
        Self {
            granted: false,
            remember: RememberScope::Once,
            all_targets: false,
        }
    }

    pub fn remembered(mut self, remember: RememberScope) -> Self {
        self.remember = remember;
        self
    }

    pub fn for_all_targets(mut self) -> Self {
        self.all_targets = true;
        self
    }
}

/// Response strings accepted from a UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionResponse {
    Allow,
    AllowForTask,
    AllowAll,
    Deny,
    DenyForTask,
    DenyAll,
}

impl PermissionResponse {
    pub fn decision(&self) -> PermissionDecision {
        match self {
            PermissionResponse::Allow => PermissionDecision::allow_once(),
            PermissionResponse::AllowForTask => {
                PermissionDecision::allow_once().remembered(RememberScope::Task)
            }
            PermissionResponse::AllowAll => PermissionDecision::allow_once()
                .remembered(RememberScope::Global)
                .for_all_targets(),
            PermissionResponse::Deny => PermissionDecision::deny_once(),
            PermissionResponse::DenyForTask => {
                PermissionDecision::deny_once().remembered(RememberScope::Task)
            }
            PermissionResponse::DenyAll => PermissionDecision::deny_once()
                .remembered(RememberScope::Global)
                .for_all_targets(),
        }
    }
}

impl FromStr for PermissionResponse {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "A" is the conventional allow-all key, so match it before lowercasing.
        if s.trim() == "A" {
            return Ok(PermissionResponse::AllowAll);
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "y" | "yes" => Ok(PermissionResponse::Allow),
            "allow_task" => Ok(PermissionResponse::AllowForTask),
            "allow_all" => Ok(PermissionResponse::AllowAll),
            "deny" | "n" | "no" => Ok(PermissionResponse::Deny),
            "deny_task" => Ok(PermissionResponse::DenyForTask),
            "deny_all" => Ok(PermissionResponse::DenyAll),
            other => Err(format!("unrecognized permission response '{}'", other)),
        }
    }
}

/// What the host is asked to decide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPrompt {
    pub id: Uuid,
    pub task_id: String,
    pub capability: Capability,
    pub message: String,
}

impl PermissionPrompt {
    pub fn new(task_id: &str, capability: Capability) -> Self {
        let message = format!("Task \"{}\" requests {}", task_id, capability.describe());
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            capability,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse() {
        assert_eq!(
            "net=example.com".parse::<Capability>().unwrap(),
            Capability::net("example.com")
        );
        assert_eq!(
            "READ".parse::<Capability>().unwrap(),
            Capability::any(CapabilityKind::Read)
        );
        assert!("exec".parse::<Capability>().is_err());
    }

    #[test]
    fn test_response_parse() {
        assert_eq!("y".parse::<PermissionResponse>(), Ok(PermissionResponse::Allow));
        assert_eq!("A".parse::<PermissionResponse>(), Ok(PermissionResponse::AllowAll));
        assert_eq!("n".parse::<PermissionResponse>(), Ok(PermissionResponse::Deny));
        assert_eq!("deny_task".parse::<PermissionResponse>(), Ok(PermissionResponse::DenyForTask));
        assert!("maybe".parse::<PermissionResponse>().is_err());
    }

    #[test]
    fn test_allow_all_is_global_and_kind_wide() {
        let decision = PermissionResponse::AllowAll.decision();
        assert!(decision.granted);
        assert_eq!(decision.remember, RememberScope::Global);
        assert!(decision.all_targets);
    }

    #[test]
    fn test_prompt_message() {
        let prompt = PermissionPrompt::new("job-1", Capability::read("/tmp/a.txt"));
        assert_eq!(
            prompt.message,
            "Task \"job-1\" requests read access to \"/tmp/a.txt\""
        );
    }
}
