// ABOUTME: Integration tests for task submission, lifecycle transitions and cancellation
// ABOUTME: Runs real QuickJS workers plus a stub engine for forced termination paths

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use runbox_tasks::{
    FailureKind, OrchestratorConfig, ScriptEngine, ScriptOutcome, StaticPrompter, TaskError,
    TaskEvent, TaskOrchestrator, TaskState,
};
use runbox_tasks::sandbox::ExecutionContext;
use serde_json::json;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn orchestrator() -> TaskOrchestrator {
    TaskOrchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(StaticPrompter::deny_all()),
    )
    .unwrap()
}

/// Ignores cancellation entirely when asked to run `"stubborn"`
struct StubbornEngine {
    hold: Duration,
}

impl ScriptEngine for StubbornEngine {
    fn execute(&self, context: ExecutionContext) -> ScriptOutcome {
        if context.code == "stubborn" {
            std::thread::sleep(self.hold);
            return ScriptOutcome::Completed(Some(json!("late")));
        }
        ScriptOutcome::Completed(Some(json!(context.code)))
    }
}

fn drain_states(events: &mut broadcast::Receiver<TaskEvent>, task_id: &str) -> Vec<TaskState> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| event.task_id == task_id)
        .map(|event| event.state)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_submit_while_running() {
    let orchestrator = orchestrator();
    orchestrator.submit("dup", "await Runtime.sleep(2000);").unwrap();

    let err = orchestrator.submit("dup", "1").unwrap_err();
    assert!(matches!(err, TaskError::DuplicateTask { .. }));

    orchestrator.cancel("dup").unwrap();
    let snapshot = orchestrator.wait_for_terminal("dup", WAIT).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_visible_only_after_completion() {
    let orchestrator = orchestrator();
    orchestrator
        .submit("a", "returnValue({ x: 1 });\nawait Runtime.sleep(800);")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let running = orchestrator.get_state("a").unwrap();
    assert_eq!(running.state, TaskState::Running);
    assert_eq!(running.result, None);

    let done = orchestrator.wait_for_terminal("a", WAIT).await.unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.result, Some(json!({ "x": 1 })));
    assert!(done.error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_awaits_within_a_task_overlap() {
    let orchestrator = orchestrator();
    let started = std::time::Instant::now();
    orchestrator
        .submit(
            "overlap",
            "await Promise.all([Runtime.sleep(400), Runtime.sleep(400), Runtime.sleep(400)]);\n\
             const t = Date.now();\n\
             await Promise.race([Runtime.sleep(1500), new Promise((r) => setTimeout(r, 50))]);\n\
             returnValue(Date.now() - t);",
        )
        .unwrap();

    let done = orchestrator.wait_for_terminal("overlap", WAIT).await.unwrap();
    assert_eq!(done.state, TaskState::Completed);
    let raced = done.result.and_then(|value| value.as_u64()).unwrap();
    assert!(raced < 1000, "race took {}ms", raced);
    // The slower sleep still runs out before the task ends.
    assert!(started.elapsed() < Duration::from_millis(2500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_any_capability_is_stopped() {
    let orchestrator = orchestrator();
    let mut events = orchestrator.subscribe();
    orchestrator.submit("b", "await Runtime.sleep(10000);").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    orchestrator.cancel("b").unwrap();
    // A second request is a no-op.
    orchestrator.cancel("b").unwrap();

    let snapshot = orchestrator.wait_for_terminal("b", WAIT).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Stopped);
    assert!(snapshot.error.is_none());
    assert_eq!(
        drain_states(&mut events, "b"),
        vec![TaskState::Running, TaskState::Stopping, TaskState::Stopped]
    );

    orchestrator.cancel("b").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_loop_stops_within_grace_period() {
    let config = OrchestratorConfig::default().with_grace_period(Duration::from_secs(2));
    let orchestrator =
        TaskOrchestrator::new(config, Arc::new(StaticPrompter::deny_all())).unwrap();
    orchestrator.submit("spin", "while (true) {}").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    orchestrator.cancel("spin").unwrap();
    let snapshot = orchestrator
        .wait_for_terminal("spin", Duration::from_secs(3))
        .await
        .unwrap();
    assert!(snapshot.state.is_terminal());
    assert_eq!(snapshot.state, TaskState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_termination_is_an_error() {
    let config = OrchestratorConfig::default().with_grace_period(Duration::from_millis(200));
    let orchestrator = TaskOrchestrator::with_engine(
        config,
        Arc::new(StaticPrompter::deny_all()),
        Arc::new(StubbornEngine {
            hold: Duration::from_millis(1500),
        }),
    )
    .unwrap();

    orchestrator.submit("stuck", "stubborn").unwrap();
    orchestrator.cancel("stuck").unwrap();

    let forced = orchestrator.wait_for_terminal("stuck", WAIT).await.unwrap();
    assert_eq!(forced.state, TaskState::Error);
    assert_eq!(forced.failure_kind, Some(FailureKind::ForcedTermination));
    assert_eq!(
        forced.error.as_deref(),
        Some("Task stuck was forcibly terminated after a 200ms grace period")
    );

    // Replay while the abandoned worker is still sleeping.
    orchestrator.submit("stuck", "fresh").unwrap();
    let replay = orchestrator.wait_for_terminal("stuck", WAIT).await.unwrap();
    assert_eq!(replay.state, TaskState::Completed);
    assert_eq!(replay.result, Some(json!("fresh")));

    // The old worker reports late and must not touch the replay.
    tokio::time::sleep(Duration::from_millis(1600)).await;
    let after = orchestrator.get_state("stuck").unwrap();
    assert_eq!(after.run_id, replay.run_id);
    assert_eq!(after.result, Some(json!("fresh")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uncaught_script_error() {
    let orchestrator = orchestrator();
    orchestrator.submit("boom", "throw new Error('boom');").unwrap();

    let snapshot = orchestrator.wait_for_terminal("boom", WAIT).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Error);
    assert_eq!(snapshot.error.as_deref(), Some("Uncaught Error: boom"));
    assert_eq!(snapshot.failure_kind, Some(FailureKind::Script));
    assert_eq!(snapshot.result, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_in_one_task_is_contained() {
    let orchestrator = orchestrator();
    orchestrator.submit("bad", "null.explode();").unwrap();
    orchestrator.submit("good", "returnValue(42);").unwrap();

    let bad = orchestrator.wait_for_terminal("bad", WAIT).await.unwrap();
    let good = orchestrator.wait_for_terminal("good", WAIT).await.unwrap();
    assert_eq!(bad.state, TaskState::Error);
    assert!(bad.error.unwrap().starts_with("Uncaught TypeError"));
    assert_eq!(good.state, TaskState::Completed);
    assert_eq!(good.result, Some(json!(42)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_after_completion() {
    let orchestrator = orchestrator();
    orchestrator.submit("r", "returnValue(1);").unwrap();
    let first = orchestrator.wait_for_terminal("r", WAIT).await.unwrap();

    orchestrator.submit("r", "returnValue(2);").unwrap();
    let second = orchestrator.wait_for_terminal("r", WAIT).await.unwrap();

    assert!(second.run_id > first.run_id);
    assert_eq!(second.result, Some(json!(2)));
    assert_eq!(second.code, "returnValue(2);");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prune_keeps_live_tasks() {
    let orchestrator = orchestrator();
    orchestrator.submit("done", "returnValue(true);").unwrap();
    orchestrator.wait_for_terminal("done", WAIT).await.unwrap();
    orchestrator.submit("live", "await Runtime.sleep(10000);").unwrap();

    for _ in 0..3 {
        orchestrator.prune_terminal();
    }
    assert!(matches!(
        orchestrator.get_state("done"),
        Err(TaskError::TaskNotFound { .. })
    ));
    assert_eq!(orchestrator.get_state("live").unwrap().state, TaskState::Running);

    orchestrator.cancel("live").unwrap();
    assert_eq!(orchestrator.prune_terminal().len(), 0);
    assert!(orchestrator.get_state("live").is_ok());
    orchestrator.wait_for_terminal("live", WAIT).await.unwrap();
    assert_eq!(orchestrator.prune_terminal(), vec!["live".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_task_errors() {
    let orchestrator = orchestrator();
    assert!(matches!(
        orchestrator.cancel("ghost"),
        Err(TaskError::TaskNotFound { .. })
    ));
    assert!(matches!(
        orchestrator.get_state("ghost"),
        Err(TaskError::TaskNotFound { .. })
    ));
    assert!(matches!(
        orchestrator.submit("", "1"),
        Err(TaskError::InvalidTaskId { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_list_and_shutdown() {
    let orchestrator = orchestrator();
    orchestrator.submit("first", "await Runtime.sleep(10000);").unwrap();
    orchestrator.submit("second", "await Runtime.sleep(10000);").unwrap();

    let ids: Vec<_> = orchestrator.list_tasks().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec!["first".to_string(), "second".to_string()]);

    let mut cancelled = orchestrator.shutdown();
    cancelled.sort();
    assert_eq!(cancelled, vec!["first".to_string(), "second".to_string()]);

    for id in ["first", "second"] {
        let snapshot = orchestrator.wait_for_terminal(id, WAIT).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Stopped);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_times_out() {
    let orchestrator = orchestrator();
    orchestrator.submit("slow", "await Runtime.sleep(10000);").unwrap();
    let err = orchestrator
        .wait_for_terminal("slow", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::WaitTimeout { .. }));
    orchestrator.shutdown();
}
