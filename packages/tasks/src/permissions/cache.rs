// ABOUTME: Remembered permission decisions keyed by scope and capability
// ABOUTME: Consulted before any prompt is queued so cached checks never wait on the prompt surface

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{Capability, PermissionDecision, RememberScope};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheScope {
    Global,
    Task(String),
}

/// Decisions remembered for a task or for the whole session
#[derive(Debug, Default)]
pub struct DecisionCache {
    decisions: Mutex<HashMap<CacheScope, HashMap<Capability, bool>>>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a remembered answer.
    ///
    /// Order: task exact, task kind-wide, global exact, global kind-wide.
    pub fn lookup(&self, task_id: &str, capability: &Capability) -> Option<bool> {
        let decisions = self.decisions.lock().unwrap_or_else(PoisonError::into_inner);
        let widened = capability.widened();
        let task_scope = CacheScope::Task(task_id.to_string());

        [task_scope, CacheScope::Global]
            .iter()
            .filter_map(|scope| decisions.get(scope))
            .find_map(|by_capability| {
                by_capability
                    .get(capability)
                    .or_else(|| by_capability.get(&widened))
                    .copied()
            })
    }

    /// Remember a decision at the scope it was given. `Once` decisions are not stored.
    pub fn store(&self, task_id: &str, capability: &Capability, decision: &PermissionDecision) {
        let scope = match decision.remember {
            RememberScope::Once => return,
            RememberScope::Task => CacheScope::Task(task_id.to_string()),
            RememberScope::Global => CacheScope::Global,
        };
        let key = if decision.all_targets {
            capability.widened()
        } else {
            capability.clone()
        };

        let mut decisions = self.decisions.lock().unwrap_or_else(PoisonError::into_inner);
        decisions
            .entry(scope)
            .or_default()
            .insert(key, decision.granted);
    }

    /// Seed a session-wide answer without prompting.
    pub fn store_global(&self, capability: Capability, granted: bool) {
        let mut decisions = self.decisions.lock().unwrap_or_else(PoisonError::into_inner);
        decisions
            .entry(CacheScope::Global)
            .or_default()
            .insert(capability, granted);
    }

    /// Forget everything remembered for one task.
    pub fn clear_task(&self, task_id: &str) {
        let mut decisions = self.decisions.lock().unwrap_or_else(PoisonError::into_inner);
        decisions.remove(&CacheScope::Task(task_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::CapabilityKind;

    #[test]
    fn test_once_is_not_remembered() {
        let cache = DecisionCache::new();
        let cap = Capability::read("/etc/hosts");
        cache.store("a", &cap, &PermissionDecision::allow_once());
        assert_eq!(cache.lookup("a", &cap), None);
    }

    #[test]
    fn test_task_scope_is_private() {
        let cache = DecisionCache::new();
        let cap = Capability::net("example.com");
        cache.store(
            "a",
            &cap,
            &PermissionDecision::allow_once().remembered(RememberScope::Task),
        );
        assert_eq!(cache.lookup("a", &cap), Some(true));
        assert_eq!(cache.lookup("b", &cap), None);
        assert_eq!(cache.lookup("a", &Capability::net("other.org")), None);
    }

    #[test]
    fn test_global_kind_wide() {
        let cache = DecisionCache::new();
        cache.store(
            "a",
            &Capability::env("HOME"),
            &PermissionDecision::allow_once()
                .remembered(RememberScope::Global)
                .for_all_targets(),
        );
        assert_eq!(cache.lookup("b", &Capability::env("PATH")), Some(true));
        assert_eq!(cache.lookup("b", &Capability::read("/tmp")), None);
    }

    #[test]
    fn test_task_decision_overrides_global() {
        let cache = DecisionCache::new();
        cache.store_global(Capability::any(CapabilityKind::Write), true);
        cache.store(
            "a",
            &Capability::write("/tmp/x"),
            &PermissionDecision::deny_once().remembered(RememberScope::Task),
        );
        assert_eq!(cache.lookup("a", &Capability::write("/tmp/x")), Some(false));
        assert_eq!(cache.lookup("b", &Capability::write("/tmp/x")), Some(true));
    }

    #[test]
    fn test_clear_task() {
        let cache = DecisionCache::new();
        let cap = Capability::read("/tmp/x");
        cache.store(
            "a",
            &cap,
            &PermissionDecision::allow_once().remembered(RememberScope::Task),
        );
        cache.clear_task("a");
        assert_eq!(cache.lookup("a", &cap), None);
    }
}
