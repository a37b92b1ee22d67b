// ABOUTME: Host-side prompt surface abstraction and the implementations shipped with the crate
// ABOUTME: Event-driven prompter for UIs plus a fixed-answer prompter for headless hosts

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{PermissionDecision, PermissionPrompt, PermissionResponse};
use crate::error::{Result, TaskError};

/// Default capacity for the prompt event broadcast channel
const DEFAULT_PROMPT_CHANNEL_SIZE: usize = 64;

/// The single prompt surface of the host application
///
/// The broker calls `prompt` for one request at a time and never concurrently.
#[async_trait]
pub trait PermissionPrompter: Send + Sync {
    /// Present the prompt and wait for the user's decision.
    async fn prompt(&self, prompt: &PermissionPrompt) -> Result<PermissionDecision>;

    /// The requesting task stopped waiting; dismiss the prompt if it is still shown.
    fn withdraw(&self, _prompt: &PermissionPrompt) {}
}

/// Answers every prompt with the same decision
#[derive(Debug, Clone, Copy)]
pub struct StaticPrompter {
    decision: PermissionDecision,
}

impl StaticPrompter {
    pub fn new(decision: PermissionDecision) -> Self {
        Self { decision }
    }

    pub fn allow_all() -> Self {
        Self::new(PermissionDecision::allow_once())
    }

    pub fn deny_all() -> Self {
        Self::new(PermissionDecision::deny_once())
    }
}

#[async_trait]
impl PermissionPrompter for StaticPrompter {
    async fn prompt(&self, prompt: &PermissionPrompt) -> Result<PermissionDecision> {
        debug!(
            "Auto-answering prompt {} for task {}: granted={}",
            prompt.id, prompt.task_id, self.decision.granted
        );
        Ok(self.decision)
    }
}

/// Notifications for a UI presenting permission prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptEvent {
    Requested { prompt: PermissionPrompt },
    Withdrawn { prompt_id: Uuid, task_id: String },
}

/// Prompter that publishes prompts as events and waits for `respond`
///
/// A UI subscribes, shows each `Requested` prompt and calls `respond` with
/// the prompt id. When no UI is subscribed the prompt fails and the broker
/// treats it as a one-off denial.
pub struct EventPrompter {
    events: broadcast::Sender<PromptEvent>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<PermissionDecision>>>,
}

impl Default for EventPrompter {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_CHANNEL_SIZE)
    }
}

impl EventPrompter {
    pub fn new(channel_size: usize) -> Self {
        let (events, _) = broadcast::channel(channel_size);
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Channel size from `RUNBOX_PROMPT_EVENT_CHANNEL_SIZE`
    pub fn from_env() -> Self {
        let size = runbox_config::parse_env_or_default_with_validation(
            runbox_config::constants::RUNBOX_PROMPT_EVENT_CHANNEL_SIZE,
            DEFAULT_PROMPT_CHANNEL_SIZE,
            |v| (1..=4096).contains(&v),
        );
        Self::new(size)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PromptEvent> {
        self.events.subscribe()
    }

    /// Deliver the user's answer for a pending prompt.
    pub fn respond(&self, prompt_id: Uuid, response: PermissionResponse) -> Result<()> {
        self.respond_with(prompt_id, response.decision())
    }

    /// Deliver an explicit decision for a pending prompt.
    pub fn respond_with(&self, prompt_id: Uuid, decision: PermissionDecision) -> Result<()> {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&prompt_id)
            .ok_or_else(|| TaskError::PromptNotFound {
                prompt_id: prompt_id.to_string(),
            })?;

        sender.send(decision).map_err(|_| TaskError::PromptNotFound {
            prompt_id: prompt_id.to_string(),
        })
    }

    /// String form used by UI bridges, e.g. `("…uuid…", "allow_task")`.
    pub fn respond_str(&self, prompt_id: &str, response: &str) -> Result<()> {
        let prompt_id = Uuid::parse_str(prompt_id).map_err(|_| TaskError::PromptNotFound {
            prompt_id: prompt_id.to_string(),
        })?;
        let response: PermissionResponse =
            response.parse().map_err(TaskError::PromptUnavailable)?;
        self.respond(prompt_id, response)
    }

    /// Number of prompts waiting for an answer
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl PermissionPrompter for EventPrompter {
    async fn prompt(&self, prompt: &PermissionPrompt) -> Result<PermissionDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prompt.id, tx);

        let event = PromptEvent::Requested {
            prompt: prompt.clone(),
        };
        if self.events.send(event).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&prompt.id);
            return Err(TaskError::PromptUnavailable(
                "no prompt presenter is subscribed".to_string(),
            ));
        }

        rx.await
            .map_err(|_| TaskError::PromptUnavailable("prompt was dismissed".to_string()))
    }

    fn withdraw(&self, prompt: &PermissionPrompt) {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&prompt.id);
        if removed.is_none() {
            return;
        }
        let event = PromptEvent::Withdrawn {
            prompt_id: prompt.id,
            task_id: prompt.task_id.clone(),
        };
        if self.events.send(event).is_err() {
            warn!("Prompt {} withdrawn with no presenter subscribed", prompt.id);
        }
    }
}
