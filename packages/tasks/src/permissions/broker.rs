// ABOUTME: Serialized permission decision loop shared by every sandbox worker
// ABOUTME: Cached answers short-circuit the queue; each request carries its own reply channel

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Capability, DecisionCache, PermissionPrompt, PermissionPrompter};

/// Answer delivered to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCheck {
    Granted,
    Denied,
    /// The requesting task was cancelled before a decision arrived
    Cancelled,
}

impl PermissionCheck {
    fn from_granted(granted: bool) -> Self {
        if granted {
            PermissionCheck::Granted
        } else {
            PermissionCheck::Denied
        }
    }
}

/// One pending prompt-and-decide cycle
struct PermissionRequest {
    prompt: PermissionPrompt,
    cancel: CancellationToken,
    reply: oneshot::Sender<bool>,
}

/// Client handle to the decision loop
///
/// Cloned into every worker. The loop owns the host prompt surface and
/// presents one prompt at a time in arrival order.
#[derive(Clone)]
pub struct PermissionBroker {
    queue: mpsc::UnboundedSender<PermissionRequest>,
    cache: Arc<DecisionCache>,
}

impl PermissionBroker {
    /// Start the decision loop on `handle`.
    pub fn spawn(handle: &Handle, prompter: Arc<dyn PermissionPrompter>) -> Self {
        let (queue, requests) = mpsc::unbounded_channel();
        let cache = Arc::new(DecisionCache::new());
        handle.spawn(decision_loop(requests, prompter, cache.clone()));
        Self { queue, cache }
    }

    /// Decide whether `task_id` may use `capability`.
    ///
    /// Remembered decisions are answered without touching the queue, so a
    /// cached check never waits behind another task's open prompt.
    pub async fn check(
        &self,
        task_id: &str,
        capability: Capability,
        cancel: &CancellationToken,
    ) -> PermissionCheck {
        if cancel.is_cancelled() {
            return PermissionCheck::Cancelled;
        }
        if let Some(granted) = self.cache.lookup(task_id, &capability) {
            debug!(
                "Cached decision for task {}: {} -> {}",
                task_id,
                capability.describe(),
                granted
            );
            return PermissionCheck::from_granted(granted);
        }

        let (reply, decision) = oneshot::channel();
        let request = PermissionRequest {
            prompt: PermissionPrompt::new(task_id, capability),
            cancel: cancel.clone(),
            reply,
        };
        if self.queue.send(request).is_err() {
            warn!("Permission broker stopped; denying request from task {}", task_id);
            return PermissionCheck::Denied;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => PermissionCheck::Cancelled,
            decision = decision => match decision {
                Ok(granted) => PermissionCheck::from_granted(granted),
                Err(_) => PermissionCheck::Denied,
            },
        }
    }

    /// Seed a session-wide decision.
    pub fn preauthorize(&self, capability: Capability, granted: bool) {
        info!(
            "Preauthorized {}: {}",
            capability.describe(),
            if granted { "allow" } else { "deny" }
        );
        self.cache.store_global(capability, granted);
    }

    /// Forget decisions remembered for `task_id`.
    pub fn clear_task(&self, task_id: &str) {
        self.cache.clear_task(task_id);
    }
}

async fn decision_loop(
    mut requests: mpsc::UnboundedReceiver<PermissionRequest>,
    prompter: Arc<dyn PermissionPrompter>,
    cache: Arc<DecisionCache>,
) {
    debug!("Permission decision loop started");

    while let Some(request) = requests.recv().await {
        let PermissionRequest {
            prompt,
            cancel,
            mut reply,
        } = request;

        if cancel.is_cancelled() || reply.is_closed() {
            debug!("Dropping prompt {} for task {}: requester gone", prompt.id, prompt.task_id);
            continue;
        }

        // An earlier prompt in the queue may have remembered the answer.
        if let Some(granted) = cache.lookup(&prompt.task_id, &prompt.capability) {
            let _ = reply.send(granted);
            continue;
        }

        debug!("Presenting prompt {}: {}", prompt.id, prompt.message);
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = reply.closed() => None,
            answer = prompter.prompt(&prompt) => Some(answer),
        };

        match answer {
            None => {
                debug!("Withdrawing prompt {} for task {}", prompt.id, prompt.task_id);
                prompter.withdraw(&prompt);
            }
            Some(Ok(decision)) => {
                cache.store(&prompt.task_id, &prompt.capability, &decision);
                if reply.send(decision.granted).is_err() {
                    debug!("Task {} stopped waiting for prompt {}", prompt.task_id, prompt.id);
                }
            }
            Some(Err(e)) => {
                warn!(
                    "Prompt {} for task {} failed, denying once: {}",
                    prompt.id, prompt.task_id, e
                );
                let _ = reply.send(false);
            }
        }
    }

    debug!("Permission decision loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::Result;
    use crate::permissions::{
        EventPrompter, PermissionDecision, PermissionResponse, PromptEvent, RememberScope,
        StaticPrompter,
    };

    /// Counts calls and the highest number of overlapping prompts
    struct CountingPrompter {
        decision: PermissionDecision,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl CountingPrompter {
        fn new(decision: PermissionDecision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PermissionPrompter for CountingPrompter {
        async fn prompt(&self, _prompt: &PermissionPrompt) -> Result<PermissionDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.decision)
        }
    }

    #[tokio::test]
    async fn test_static_deny() {
        let broker = PermissionBroker::spawn(&Handle::current(), Arc::new(StaticPrompter::deny_all()));
        let cancel = CancellationToken::new();
        assert_eq!(
            broker.check("a", Capability::read("/x"), &cancel).await,
            PermissionCheck::Denied
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_prompts_are_serialized() {
        let prompter = CountingPrompter::new(PermissionDecision::allow_once());
        let broker = PermissionBroker::spawn(&Handle::current(), prompter.clone());

        let checks: Vec<_> = (0..6)
            .map(|i| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    broker
                        .check(&format!("task-{}", i), Capability::net("example.com"), &cancel)
                        .await
                })
            })
            .collect();

        for check in checks {
            assert_eq!(check.await.unwrap(), PermissionCheck::Granted);
        }
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 6);
        assert_eq!(prompter.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_scope_does_not_leak() {
        let prompter =
            CountingPrompter::new(PermissionDecision::allow_once().remembered(RememberScope::Task));
        let broker = PermissionBroker::spawn(&Handle::current(), prompter.clone());
        let cancel = CancellationToken::new();
        let cap = Capability::write("/tmp/out.txt");

        assert_eq!(broker.check("a", cap.clone(), &cancel).await, PermissionCheck::Granted);
        assert_eq!(broker.check("a", cap.clone(), &cancel).await, PermissionCheck::Granted);
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);

        // Another task is prompted on its own.
        assert_eq!(broker.check("b", cap, &cancel).await, PermissionCheck::Granted);
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cached_check_skips_pending_prompt() {
        let prompter = Arc::new(EventPrompter::new(16));
        let mut events = prompter.subscribe();
        let broker = PermissionBroker::spawn(&Handle::current(), prompter.clone());
        broker.preauthorize(Capability::env("HOME"), true);

        // Task a opens a prompt nobody answers yet.
        let pending = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                broker.check("a", Capability::net("example.com"), &cancel).await
            })
        };
        let PromptEvent::Requested { prompt } = events.recv().await.unwrap() else {
            panic!("expected a request");
        };

        let cancel = CancellationToken::new();
        let cached = tokio::time::timeout(
            Duration::from_millis(200),
            broker.check("b", Capability::env("HOME"), &cancel),
        )
        .await
        .expect("cached check must not queue");
        assert_eq!(cached, PermissionCheck::Granted);

        prompter.respond(prompt.id, PermissionResponse::Deny).unwrap();
        assert_eq!(pending.await.unwrap(), PermissionCheck::Denied);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_preempts_prompt_and_withdraws() {
        let prompter = Arc::new(EventPrompter::new(16));
        let mut events = prompter.subscribe();
        let broker = PermissionBroker::spawn(&Handle::current(), prompter.clone());
        let cancel = CancellationToken::new();

        let waiting = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.check("a", Capability::read("/etc"), &cancel).await })
        };
        let PromptEvent::Requested { prompt } = events.recv().await.unwrap() else {
            panic!("expected a request");
        };

        cancel.cancel();
        assert_eq!(waiting.await.unwrap(), PermissionCheck::Cancelled);

        let withdrawn = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            withdrawn,
            PromptEvent::Withdrawn {
                prompt_id: prompt.id,
                task_id: "a".to_string()
            }
        );
        assert_eq!(prompter.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decisions_route_to_their_requester() {
        let prompter = Arc::new(EventPrompter::new(16));
        let mut events = prompter.subscribe();
        let broker = PermissionBroker::spawn(&Handle::current(), prompter.clone());

        let spawn_check = |task: &'static str| {
            let broker = broker.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                broker.check(task, Capability::read("/data"), &cancel).await
            })
        };
        let c = spawn_check("c");
        let d = spawn_check("d");

        for _ in 0..2 {
            let PromptEvent::Requested { prompt } = events.recv().await.unwrap() else {
                panic!("expected a request");
            };
            let response = if prompt.task_id == "c" {
                PermissionResponse::Allow
            } else {
                PermissionResponse::Deny
            };
            prompter.respond(prompt.id, response).unwrap();
        }

        assert_eq!(c.await.unwrap(), PermissionCheck::Granted);
        assert_eq!(d.await.unwrap(), PermissionCheck::Denied);
    }
}
