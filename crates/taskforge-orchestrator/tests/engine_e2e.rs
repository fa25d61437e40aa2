//! End-to-end engine tests.
//!
//! Exercises the dispatch loop with mock agents: priority ordering under a
//! single concurrency slot, dependency gating, retry exhaustion and recovery,
//! timeouts, and cancellation of running work.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskforge_core::{Agent, TaskforgeError, TaskforgeResult};
use taskforge_orchestrator::*;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock agents
// ---------------------------------------------------------------------------

/// Logs the `label` parameter of every invocation, gated on a semaphore so
/// tests can hold work back until the queue is fully populated.
struct GatedRecorder {
    gate: Arc<tokio::sync::Semaphore>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Agent for GatedRecorder {
    async fn handle(
        &self,
        parameters: &Map<String, Value>,
        _cancel: CancellationToken,
    ) -> TaskforgeResult<Value> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| TaskforgeError::Execution(e.to_string()))?;
        permit.forget();
        let label = parameters
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        if let Ok(mut log) = self.log.lock() {
            log.push(label.clone());
        }
        Ok(json!({ "ran": label }))
    }
}

/// Fails the first `failures` invocations, then succeeds.
struct FlakyAgent {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Agent for FlakyAgent {
    async fn handle(
        &self,
        _parameters: &Map<String, Value>,
        _cancel: CancellationToken,
    ) -> TaskforgeResult<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(TaskforgeError::Execution(format!("transient failure {n}")))
        } else {
            Ok(json!({ "attempt": n + 1 }))
        }
    }
}

/// Sleeps far past any test deadline; honours cancellation.
struct SleepyAgent;

#[async_trait]
impl Agent for SleepyAgent {
    async fn handle(
        &self,
        _parameters: &Map<String, Value>,
        cancel: CancellationToken,
    ) -> TaskforgeResult<Value> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TaskforgeError::Execution("interrupted".into())),
            _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config(max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        max_concurrent_tasks: max_concurrent,
        poll_interval_ms: 10,
        retry_delay_ms: 10,
        ..EngineConfig::default()
    }
}

fn new_engine(max_concurrent: usize) -> Arc<ExecutionEngine> {
    ExecutionEngine::new(fast_config(max_concurrent), Arc::new(MemorySnapshotStore::new()))
        .expect("config is valid")
}

fn labelled(label: &str) -> Map<String, Value> {
    let mut parameters = Map::new();
    parameters.insert("label".into(), json!(label));
    parameters
}

async fn wait_for<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_terminal(engine: &Arc<ExecutionEngine>, id: uuid::Uuid) -> TaskView {
    for _ in 0..500 {
        if let Some(view) = engine.get_task_status(id).await {
            if view.status.is_terminal() {
                return view;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached a terminal state");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_order_with_single_slot() {
    let engine = new_engine(1);
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    engine
        .register_agent(
            "recorder",
            Arc::new(GatedRecorder {
                gate: Arc::clone(&gate),
                log: Arc::clone(&log),
            }),
            vec!["recorder".into()],
        )
        .await;

    // The blocker occupies the only slot so the rest queue up behind it.
    let blocker = engine
        .create_task("blocker", "recorder", labelled("blocker"), TaskPriority::Critical, vec![], None)
        .await
        .unwrap();
    let blocker_task = engine.created_task(blocker).await.unwrap();
    assert!(engine.submit_task(blocker_task).await);

    for (label, priority) in [
        ("low", TaskPriority::Low),
        ("critical", TaskPriority::Critical),
        ("medium", TaskPriority::Medium),
    ] {
        let id = engine
            .create_task(label, "recorder", labelled(label), priority, vec![], None)
            .await
            .unwrap();
        let task = engine.created_task(id).await.unwrap();
        assert!(engine.submit_task(task).await);
    }

    gate.add_permits(8);
    wait_for(
        || log.lock().map(|l| l.len() == 4).unwrap_or(false),
        "all four tasks to run",
    )
    .await;

    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec!["blocker", "critical", "medium", "low"]);
    engine.shutdown();
}

#[tokio::test]
async fn dependent_task_waits_for_dependency() {
    let engine = new_engine(4);
    let gate = Arc::new(tokio::sync::Semaphore::new(8));
    let log = Arc::new(Mutex::new(Vec::new()));
    engine
        .register_agent(
            "recorder",
            Arc::new(GatedRecorder {
                gate,
                log: Arc::clone(&log),
            }),
            vec![],
        )
        .await;

    let first = engine
        .create_task("first", "recorder", labelled("first"), TaskPriority::Low, vec![], None)
        .await
        .unwrap();
    let second = engine
        .create_task(
            "second",
            "recorder",
            labelled("second"),
            // Higher priority, but gated behind `first`.
            TaskPriority::Critical,
            vec![first],
            None,
        )
        .await
        .unwrap();

    // Submit the dependent first; it must sit in the queue untouched.
    let second_task = engine.created_task(second).await.unwrap();
    assert!(engine.submit_task(second_task).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.lock().unwrap().is_empty(), "dependent ran before its dependency");

    let first_task = engine.created_task(first).await.unwrap();
    assert!(engine.submit_task(first_task).await);

    let view = wait_for_terminal(&engine, second).await;
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(log.lock().unwrap().as_slice(), ["first", "second"]);
    engine.shutdown();
}

#[tokio::test]
async fn retry_budget_recovers_transient_failures() {
    let engine = new_engine(2);
    engine
        .register_agent(
            "flaky",
            Arc::new(FlakyAgent {
                failures: 2,
                calls: AtomicU32::new(0),
            }),
            vec![],
        )
        .await;

    let task = Task::new("flaky job", "flaky").with_max_retries(2);
    let id = task.id;
    assert!(engine.submit_task(task).await);

    let view = wait_for_terminal(&engine, id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.retry_count, 2, "two retries must have been consumed");
    engine.shutdown();
}

#[tokio::test]
async fn retry_exhaustion_fails_terminally() {
    let engine = new_engine(2);
    engine
        .register_agent(
            "flaky",
            Arc::new(FlakyAgent {
                failures: 10,
                calls: AtomicU32::new(0),
            }),
            vec![],
        )
        .await;

    let id = engine
        .create_task("doomed", "flaky", Map::new(), TaskPriority::Medium, vec![], None)
        .await
        .unwrap();
    let report = engine.execute_task(id).await.unwrap();

    // max_retries defaults to zero: one attempt, then terminal failure.
    assert!(matches!(report.status, TaskStatus::Failed { .. }));
    assert!(report.error.unwrap().contains("transient failure 0"));
    engine.shutdown();
}

#[tokio::test]
async fn timeout_without_retries_fails_immediately() {
    let engine = new_engine(2);
    engine.register_agent("sleepy", Arc::new(SleepyAgent), vec![]).await;

    let id = engine
        .create_task(
            "slowpoke",
            "sleepy",
            Map::new(),
            TaskPriority::High,
            vec![],
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    let report = engine.execute_task(id).await.unwrap();

    assert!(matches!(report.status, TaskStatus::Failed { .. }));
    assert!(report.error.unwrap().contains("timed out"));
    engine.shutdown();
}

#[tokio::test]
async fn missing_agent_fails_without_retry() {
    let engine = new_engine(2);
    let id = engine
        .create_task("orphan", "nonexistent", Map::new(), TaskPriority::Medium, vec![], None)
        .await
        .unwrap();
    let report = engine.execute_task(id).await.unwrap();

    assert!(matches!(report.status, TaskStatus::Failed { .. }));
    assert!(report.error.unwrap().contains("no agent registered"));
    engine.shutdown();
}

#[tokio::test]
async fn cancel_running_task_interrupts_it() {
    let engine = new_engine(2);
    engine.register_agent("sleepy", Arc::new(SleepyAgent), vec![]).await;

    let id = engine
        .create_task("long haul", "sleepy", Map::new(), TaskPriority::Medium, vec![], None)
        .await
        .unwrap();
    let task = engine.created_task(id).await.unwrap();
    assert!(engine.submit_task(task).await);

    // Wait until the attempt is actually running, then cancel it.
    wait_for_running(&engine, id).await;
    assert!(engine.cancel_task(id).await);

    let view = wait_for_terminal(&engine, id).await;
    assert_eq!(view.status, TaskStatus::Cancelled);
    engine.shutdown();
}

#[tokio::test]
async fn pause_and_resume_running_task() {
    let engine = new_engine(2);
    engine.register_agent("sleepy", Arc::new(SleepyAgent), vec![]).await;

    let id = engine
        .create_task("interruptible", "sleepy", Map::new(), TaskPriority::Medium, vec![], None)
        .await
        .unwrap();
    let task = engine.created_task(id).await.unwrap();
    assert!(engine.submit_task(task).await);
    wait_for_running(&engine, id).await;

    // Pause interrupts the attempt without consuming a retry.
    assert!(engine.pause_task(id).await);
    wait_for_status(&engine, id, TaskStatus::Pending).await;
    let view = engine.get_task_status(id).await.unwrap();
    assert_eq!(view.retry_count, 0);

    // Resume re-queues it; the agent picks it back up.
    assert!(engine.resume_task(id).await);
    wait_for_running(&engine, id).await;

    assert!(engine.cancel_task(id).await);
    let view = wait_for_terminal(&engine, id).await;
    assert_eq!(view.status, TaskStatus::Cancelled);
    engine.shutdown();
}

async fn wait_for_status(engine: &Arc<ExecutionEngine>, id: uuid::Uuid, wanted: TaskStatus) {
    for _ in 0..500 {
        if let Some(view) = engine.get_task_status(id).await {
            if view.status == wanted {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached {wanted:?}");
}

async fn wait_for_running(engine: &Arc<ExecutionEngine>, id: uuid::Uuid) {
    for _ in 0..500 {
        if let Some(view) = engine.get_task_status(id).await {
            if view.status == TaskStatus::Running {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never started running");
}

#[tokio::test]
async fn coordination_stats_track_outcomes() {
    let engine = new_engine(2);
    engine
        .register_agent(
            "flaky",
            Arc::new(FlakyAgent {
                failures: 0,
                calls: AtomicU32::new(0),
            }),
            vec![],
        )
        .await;

    let id = engine
        .create_task("counted", "flaky", Map::new(), TaskPriority::Medium, vec![], None)
        .await
        .unwrap();
    engine.execute_task(id).await.unwrap();

    let stats = engine.get_coordination_stats().await;
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["failed"], 0);
    assert_eq!(stats["max_concurrent_tasks"], 2);

    let metrics = engine.get_detailed_metrics().await;
    assert_eq!(metrics["agents"][0]["capability"], "flaky");
    assert_eq!(metrics["agents"][0]["utilization"]["completed"], 1);
    engine.shutdown();
}
