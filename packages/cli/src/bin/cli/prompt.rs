// ABOUTME: Terminal presenter for permission prompts raised by running tasks
// ABOUTME: Shows one inquire selection per prompt and answers it through the event prompter

use std::fmt;
use std::sync::Arc;

use colored::*;
use inquire::Select;
use runbox_tasks::{EventPrompter, PermissionPrompt, PermissionResponse, PromptEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Choice {
    label: &'static str,
    response: PermissionResponse,
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

fn choices() -> Vec<Choice> {
    vec![
        Choice {
            label: "Allow once",
            response: PermissionResponse::Allow,
        },
        Choice {
            label: "Allow for this task",
            response: PermissionResponse::AllowForTask,
        },
        Choice {
            label: "Allow everything of this kind for every task",
            response: PermissionResponse::AllowAll,
        },
        Choice {
            label: "Deny once",
            response: PermissionResponse::Deny,
        },
        Choice {
            label: "Deny for this task",
            response: PermissionResponse::DenyForTask,
        },
        Choice {
            label: "Deny everything of this kind for every task",
            response: PermissionResponse::DenyAll,
        },
    ]
}

fn ask(prompt: &PermissionPrompt) -> Result<PermissionResponse, inquire::InquireError> {
    let message = format!("{} {}", "⚠".yellow(), prompt.message);
    Select::new(&message, choices())
        .prompt()
        .map(|choice| choice.response)
}

/// Answer prompts until the prompter goes away.
pub fn spawn_presenter(prompter: Arc<EventPrompter>) -> JoinHandle<()> {
    let mut events = prompter.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PromptEvent::Requested { prompt }) => {
                    let prompt_id = prompt.id;
                    let response = match tokio::task::spawn_blocking(move || ask(&prompt)).await {
                        Ok(Ok(response)) => response,
                        Ok(Err(e)) => {
                            warn!("Permission prompt dismissed, denying: {}", e);
                            PermissionResponse::Deny
                        }
                        Err(e) => {
                            warn!("Permission prompt failed, denying: {}", e);
                            PermissionResponse::Deny
                        }
                    };
                    if let Err(e) = prompter.respond(prompt_id, response) {
                        debug!("Answer arrived after the prompt closed: {}", e);
                    }
                }
                Ok(PromptEvent::Withdrawn { task_id, .. }) => {
                    eprintln!(
                        "{} Task {} no longer needs an answer",
                        "↩".dimmed(),
                        task_id.bold()
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} permission prompt events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
