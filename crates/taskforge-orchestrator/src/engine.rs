use crate::checkpoint::SnapshotStore;
use crate::config::EngineConfig;
use crate::queue::DispatchQueue;
use crate::registry::{AgentHealth, AgentRegistry};
use crate::types::{Task, TaskPriority, TaskStatus, TaskView, Workflow};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskforge_core::{
    EventKind, EventSink, LifecycleEvent, NullEventSink, ResultStore, TaskforgeError,
    TaskforgeResult,
};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the completed-task history ring.
pub const COMPLETED_HISTORY_CAPACITY: usize = 1000;
/// Capacity of the failed/cancelled-task history ring.
pub const FAILED_HISTORY_CAPACITY: usize = 100;

/// Outcome of a direct (synchronous) task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// The executed task.
    pub task_id: Uuid,
    /// Terminal status reached.
    pub status: TaskStatus,
    /// Agent result on success.
    pub result: Option<Value>,
    /// Error text otherwise.
    pub error: Option<String>,
    /// Wall-clock time spent, including retries and their delays.
    pub duration_ms: u64,
}

impl ExecutionReport {
    fn from_task(task: &Task, duration: Duration) -> Self {
        Self {
            task_id: task.id,
            status: task.status.clone(),
            result: task.result.clone(),
            error: task.error.clone(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

pub(crate) struct RunningEntry {
    pub(crate) task: Task,
    pub(crate) cancel: CancellationToken,
}

/// All mutable scheduler collections, owned by one lock so no two dispatch
/// decisions interleave.
pub(crate) struct EngineState {
    pub(crate) queue: DispatchQueue,
    pub(crate) drafts: HashMap<Uuid, Task>,
    pub(crate) running: HashMap<Uuid, RunningEntry>,
    pub(crate) paused: HashMap<Uuid, Task>,
    pub(crate) retrying: HashMap<Uuid, Task>,
    /// Every completed task id, retained for the process lifetime: queued
    /// tasks may declare dependencies on arbitrarily old completions, so
    /// entries are never evicted.
    pub(crate) completed_ids: HashSet<Uuid>,
    pub(crate) completed: VecDeque<Task>,
    pub(crate) failed: VecDeque<Task>,
    pub(crate) total_completed: u64,
    pub(crate) total_failed: u64,
    pub(crate) total_cancelled: u64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            queue: DispatchQueue::new(),
            drafts: HashMap::new(),
            running: HashMap::new(),
            paused: HashMap::new(),
            retrying: HashMap::new(),
            completed_ids: HashSet::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            total_completed: 0,
            total_failed: 0,
            total_cancelled: 0,
        }
    }
}

/// Push onto a bounded history ring, evicting the oldest entry at capacity.
pub(crate) fn push_history(ring: &mut VecDeque<Task>, capacity: usize, task: Task) {
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(task);
}

enum AttemptOutcome {
    Completed(Task),
    Retry(Task),
    Failed(Task),
    Cancelled(Task),
    Paused(Task),
}

/// The task execution engine.
///
/// An explicit value with `start`/`shutdown` lifecycle: callers hold an
/// `Arc<ExecutionEngine>` and inject it where scheduling is needed. The
/// background dispatcher wakes on submission/completion events with a
/// periodic fallback tick, pulls dependency-eligible tasks in priority
/// order, and runs each under the process-wide concurrency bound.
pub struct ExecutionEngine {
    pub(crate) config: EngineConfig,
    pub(crate) registry: AgentRegistry,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) results: Option<Arc<dyn ResultStore>>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) workflows: Mutex<HashMap<Uuid, Workflow>>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) notify: Notify,
    loop_running: AtomicBool,
}

impl ExecutionEngine {
    /// Create an engine with the default (no-op) event sink and no result
    /// store.
    pub fn new(
        config: EngineConfig,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> TaskforgeResult<Arc<Self>> {
        Self::with_collaborators(config, snapshots, Arc::new(NullEventSink), None)
    }

    /// Create an engine with explicit collaborators.
    pub fn with_collaborators(
        config: EngineConfig,
        snapshots: Arc<dyn SnapshotStore>,
        events: Arc<dyn EventSink>,
        results: Option<Arc<dyn ResultStore>>,
    ) -> TaskforgeResult<Arc<Self>> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Ok(Arc::new(Self {
            config,
            registry: AgentRegistry::new(),
            events,
            results,
            snapshots,
            state: Mutex::new(EngineState::new()),
            workflows: Mutex::new(HashMap::new()),
            semaphore,
            notify: Notify::new(),
            loop_running: AtomicBool::new(false),
        }))
    }

    /// The agent registry.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register or replace an agent for a capability.
    pub async fn register_agent(
        &self,
        capability: impl Into<String>,
        handle: Arc<dyn taskforge_core::Agent>,
        declared_capabilities: Vec<String>,
    ) {
        self.registry
            .register(capability, handle, declared_capabilities)
            .await;
    }

    /// Probe an agent's health (§ registry).
    pub async fn check_agent_health(&self, capability: &str) -> TaskforgeResult<AgentHealth> {
        self.registry.check_health(capability).await
    }

    /// Start the background dispatch loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.loop_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.dispatch_loop().await;
        });
    }

    /// Stop the background dispatch loop. In-flight tasks run to completion.
    pub fn shutdown(&self) {
        self.loop_running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the dispatch loop is running.
    pub fn is_running(&self) -> bool {
        self.loop_running.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.events.emit(event);
    }

    /// Create a task draft. Fails only on malformed input; the task is not
    /// queued until [`submit_task`](Self::submit_task).
    pub async fn create_task(
        &self,
        name: impl Into<String>,
        capability: impl Into<String>,
        parameters: Map<String, Value>,
        priority: TaskPriority,
        dependencies: Vec<Uuid>,
        timeout: Option<Duration>,
    ) -> TaskforgeResult<Uuid> {
        let name = name.into();
        let capability = capability.into();
        if name.trim().is_empty() {
            return Err(TaskforgeError::InvalidInput("task name is empty".into()));
        }
        if capability.trim().is_empty() {
            return Err(TaskforgeError::InvalidInput(
                "task capability is empty".into(),
            ));
        }

        let task = Task::new(name, capability)
            .with_parameters(parameters)
            .with_priority(priority)
            .with_dependencies(dependencies)
            .with_timeout(timeout.unwrap_or_else(|| self.config.default_task_timeout()));
        let id = task.id;

        let mut state = self.state.lock().await;
        state.drafts.insert(id, task);
        Ok(id)
    }

    /// A clone of a created-but-unsubmitted task.
    pub async fn created_task(&self, id: Uuid) -> Option<Task> {
        self.state.lock().await.drafts.get(&id).cloned()
    }

    /// Enqueue a pending task and make sure the dispatcher is awake.
    ///
    /// Returns false if the task is not in the pending state.
    pub async fn submit_task(self: &Arc<Self>, task: Task) -> bool {
        if task.status != TaskStatus::Pending {
            return false;
        }
        let id = task.id;
        {
            let mut state = self.state.lock().await;
            state.drafts.remove(&id);
            state.queue.insert(task);
        }
        debug!(task_id = %id, "task submitted");
        self.start();
        self.notify.notify_waiters();
        true
    }

    /// Run one task to a terminal state from the caller's perspective.
    ///
    /// The task must be a draft or queued and dependency-eligible; retries
    /// happen in place with the configured delay between attempts.
    pub async fn execute_task(self: &Arc<Self>, task_id: Uuid) -> TaskforgeResult<ExecutionReport> {
        let task = {
            let mut state = self.state.lock().await;
            let EngineState {
                queue,
                drafts,
                completed_ids,
                ..
            } = &mut *state;
            let staged = queue
                .get(task_id)
                .or_else(|| drafts.get(&task_id))
                .ok_or(TaskforgeError::TaskNotFound(task_id))?;
            if !staged.is_ready(completed_ids) {
                return Err(TaskforgeError::InvalidInput(format!(
                    "task {task_id} has unmet dependencies"
                )));
            }
            queue
                .remove(task_id)
                .or_else(|| drafts.remove(&task_id))
                .ok_or(TaskforgeError::TaskNotFound(task_id))?
        };

        let started = Instant::now();
        let terminal = self.run_until_terminal(task).await;
        Ok(ExecutionReport::from_task(&terminal, started.elapsed()))
    }

    /// Cancel a task.
    ///
    /// A queued, paused, or retry-waiting task is removed and marked
    /// cancelled. For a running task the cancellation token is signalled;
    /// the engine races the agent against the token, so the attempt is
    /// interrupted even if the agent ignores it.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let parked = state
            .queue
            .remove(task_id)
            .or_else(|| state.retrying.remove(&task_id))
            .or_else(|| state.paused.remove(&task_id))
            .or_else(|| state.drafts.remove(&task_id));
        if let Some(mut task) = parked {
            task.mark_cancelled();
            state.total_cancelled += 1;
            push_history(&mut state.failed, FAILED_HISTORY_CAPACITY, task.clone());
            self.emit(LifecycleEvent::task(
                EventKind::TaskCancelled,
                task_id,
                json!({ "name": task.name }),
            ));
            info!(task_id = %task_id, "pending task cancelled");
            return true;
        }
        if let Some(entry) = state.running.get(&task_id) {
            entry.cancel.cancel();
            info!(task_id = %task_id, "running task signalled for cancellation");
            return true;
        }
        false
    }

    /// Park a task. A queued task is pulled from the queue; a running task
    /// has its current attempt interrupted without consuming a retry.
    pub async fn pause_task(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let parked = state
            .queue
            .remove(task_id)
            .or_else(|| state.retrying.remove(&task_id));
        if let Some(task) = parked {
            state.paused.insert(task_id, task);
            self.emit(LifecycleEvent::task(
                EventKind::TaskProgress,
                task_id,
                json!({ "phase": "paused" }),
            ));
            return true;
        }
        if let Some((task, cancel)) = state
            .running
            .get(&task_id)
            .map(|entry| (entry.task.clone(), entry.cancel.clone()))
        {
            // Park a placeholder first so the attempt body knows this
            // interruption is a pause, not a cancellation.
            state.paused.insert(task_id, task);
            cancel.cancel();
            return true;
        }
        false
    }

    /// Re-enter a paused task into the priority queue as pending.
    pub async fn resume_task(self: &Arc<Self>, task_id: Uuid) -> bool {
        {
            let mut state = self.state.lock().await;
            let Some(mut task) = state.paused.remove(&task_id) else {
                return false;
            };
            task.reset_to_pending();
            state.queue.insert(task);
            self.emit(LifecycleEvent::task(
                EventKind::TaskProgress,
                task_id,
                json!({ "phase": "resumed" }),
            ));
        }
        self.start();
        self.notify.notify_waiters();
        true
    }

    /// Current view of a task wherever it lives: draft, queue, running,
    /// paused, retry wait, history, or inside a workflow.
    pub async fn get_task_status(&self, task_id: Uuid) -> Option<TaskView> {
        {
            let state = self.state.lock().await;
            if let Some(task) = state.drafts.get(&task_id) {
                return Some(TaskView::from(task));
            }
            if let Some(task) = state.queue.get(task_id) {
                return Some(TaskView::from(task));
            }
            if let Some(entry) = state.running.get(&task_id) {
                return Some(TaskView::from(&entry.task));
            }
            if let Some(task) = state.paused.get(&task_id) {
                return Some(TaskView::from(task));
            }
            if let Some(task) = state.retrying.get(&task_id) {
                return Some(TaskView::from(task));
            }
            if let Some(task) = state.completed.iter().rev().find(|t| t.id == task_id) {
                return Some(TaskView::from(task));
            }
            if let Some(task) = state.failed.iter().rev().find(|t| t.id == task_id) {
                return Some(TaskView::from(task));
            }
        }
        let workflows = self.workflows.lock().await;
        workflows
            .values()
            .find_map(|wf| wf.task(task_id).map(TaskView::from))
    }

    /// Aggregate scheduler counters plus system efficiency.
    pub async fn get_coordination_stats(&self) -> Value {
        let (queued, running, paused, retrying, completed, failed, cancelled) = {
            let state = self.state.lock().await;
            (
                state.queue.len(),
                state.running.len(),
                state.paused.len(),
                state.retrying.len(),
                state.total_completed,
                state.total_failed,
                state.total_cancelled,
            )
        };
        let workflows = self.workflows.lock().await.len();
        let efficiency = self.registry.system_efficiency(completed, failed).await;
        json!({
            "queued": queued,
            "running": running,
            "paused": paused,
            "retrying": retrying,
            "completed": completed,
            "failed": failed,
            "cancelled": cancelled,
            "workflows": workflows,
            "max_concurrent_tasks": self.config.max_concurrent_tasks,
            "system_efficiency": efficiency,
        })
    }

    /// Coordination stats plus per-agent utilization, health, and the
    /// load-balancing advisory.
    pub async fn get_detailed_metrics(&self) -> Value {
        let coordination = self.get_coordination_stats().await;
        let agents = self.registry.snapshot().await;
        let load = self
            .registry
            .load_report(self.config.bottleneck_threshold_ms)
            .await;
        let queue = {
            let state = self.state.lock().await;
            state.queue.views()
        };
        json!({
            "coordination": coordination,
            "agents": agents,
            "load": load,
            "queue": queue,
        })
    }

    // --- dispatch loop ---

    async fn dispatch_loop(self: Arc<Self>) {
        info!(
            max_concurrent = self.config.max_concurrent_tasks,
            "dispatch loop started"
        );
        while self.loop_running.load(Ordering::SeqCst) {
            self.dispatch_ready().await;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("dispatch loop stopped");
    }

    /// Pull eligible tasks while concurrency permits are free.
    async fn dispatch_ready(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return;
            };
            let next = {
                let mut state = self.state.lock().await;
                let EngineState {
                    queue,
                    completed_ids,
                    ..
                } = &mut *state;
                queue.pop_eligible(completed_ids)
            };
            match next {
                Some(task) => {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.run_dispatched(task, permit).await;
                    });
                }
                None => return,
            }
        }
    }

    async fn run_dispatched(self: Arc<Self>, task: Task, permit: OwnedSemaphorePermit) {
        let outcome = self.attempt(task).await;
        // Release the concurrency slot before any retry backoff.
        drop(permit);
        if let AttemptOutcome::Retry(task) = outcome {
            self.schedule_retry(task).await;
        }
    }

    /// Hold a retried task out of the queue for the fixed delay, then
    /// re-insert it by priority.
    async fn schedule_retry(self: &Arc<Self>, task: Task) {
        let id = task.id;
        {
            let mut state = self.state.lock().await;
            state.retrying.insert(id, task);
        }
        tokio::time::sleep(self.config.retry_delay()).await;
        let requeued = {
            let mut state = self.state.lock().await;
            // May have been cancelled or paused while waiting.
            match state.retrying.remove(&id) {
                Some(task) => {
                    state.queue.insert(task);
                    true
                }
                None => false,
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Run a task to a terminal state, retrying in place. Used by the
    /// direct execution path and by workflow fan-out.
    pub(crate) async fn run_until_terminal(self: &Arc<Self>, task: Task) -> Task {
        let mut task = task;
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return self
                        .finish_failed(task, "engine stopped".to_string(), None)
                        .await;
                }
            };
            let outcome = self.attempt(task).await;
            drop(permit);
            match outcome {
                AttemptOutcome::Retry(retrying) => {
                    // Wait out the delay in the retrying map so the task
                    // stays visible to status lookups and cancellable.
                    let id = retrying.id;
                    let waiting = retrying.clone();
                    {
                        let mut state = self.state.lock().await;
                        state.retrying.insert(id, retrying);
                    }
                    tokio::time::sleep(self.config.retry_delay()).await;
                    let reclaimed = {
                        let mut state = self.state.lock().await;
                        state.retrying.remove(&id)
                    };
                    match reclaimed {
                        Some(next) => task = next,
                        // Cancelled or paused while waiting.
                        None => return self.settled_elsewhere(id, waiting).await,
                    }
                }
                AttemptOutcome::Completed(t)
                | AttemptOutcome::Failed(t)
                | AttemptOutcome::Cancelled(t)
                | AttemptOutcome::Paused(t) => return t,
            }
        }
    }

    /// Current record of a task that was pulled out of the retry-wait map
    /// by cancellation or pause while this path was sleeping.
    async fn settled_elsewhere(&self, id: Uuid, fallback: Task) -> Task {
        let state = self.state.lock().await;
        if let Some(parked) = state.paused.get(&id) {
            return parked.clone();
        }
        if let Some(terminal) = state.failed.iter().rev().find(|t| t.id == id) {
            return terminal.clone();
        }
        fallback
    }

    /// One attempt: resolve the agent, run under the deadline, settle the
    /// outcome. All shared-state mutation happens through the finish_*
    /// transitions.
    async fn attempt(&self, mut task: Task) -> AttemptOutcome {
        let id = task.id;
        let capability = task.capability.clone();

        let Some(agent) = self.registry.resolve(&capability).await else {
            let reason = TaskforgeError::AgentNotRegistered(capability).to_string();
            task.mark_running();
            let task = self.finish_failed(task, reason, None).await;
            return AttemptOutcome::Failed(task);
        };

        let cancel = CancellationToken::new();
        task.mark_running();
        {
            let mut state = self.state.lock().await;
            state.running.insert(
                id,
                RunningEntry {
                    task: task.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        self.registry.record_assignment(&capability).await;
        self.emit(LifecycleEvent::task(
            EventKind::TaskStarted,
            id,
            json!({
                "name": task.name,
                "capability": task.capability,
                "attempt": task.retry_count + 1,
            }),
        ));

        enum RawResult {
            Ok(Value),
            Err(String),
            TimedOut,
            Cancelled,
        }

        let started = Instant::now();
        // Biased so a signalled token always settles as an interruption,
        // even when the agent notices and returns its own error first.
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => RawResult::Cancelled,
            res = tokio::time::timeout(task.timeout, agent.handle(&task.parameters, cancel.clone())) => {
                match res {
                    Err(_) => RawResult::TimedOut,
                    Ok(Ok(value)) => RawResult::Ok(value),
                    Ok(Err(e)) => RawResult::Err(e.to_string()),
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        {
            let mut state = self.state.lock().await;
            state.running.remove(&id);
        }

        match raw {
            RawResult::Ok(value) => {
                let task = self.finish_completed(task, value, duration_ms).await;
                AttemptOutcome::Completed(task)
            }
            RawResult::Cancelled => self.finish_interrupted(task).await,
            RawResult::TimedOut => {
                let reason = TaskforgeError::Timeout {
                    task_id: id,
                    timeout: task.timeout,
                }
                .to_string();
                self.settle_retryable(task, reason, duration_ms).await
            }
            RawResult::Err(message) => {
                let reason = TaskforgeError::Execution(message).to_string();
                self.settle_retryable(task, reason, duration_ms).await
            }
        }
    }

    /// Retry if budget remains, otherwise fail terminally.
    async fn settle_retryable(
        &self,
        mut task: Task,
        reason: String,
        duration_ms: u64,
    ) -> AttemptOutcome {
        if task.retry_count < task.max_retries {
            task.mark_retrying(reason.clone());
            warn!(
                task_id = %task.id,
                retry = task.retry_count,
                max_retries = task.max_retries,
                error = %reason,
                "task attempt failed, retrying"
            );
            self.emit(LifecycleEvent::task(
                EventKind::TaskRetrying,
                task.id,
                json!({ "retry_count": task.retry_count, "error": reason }),
            ));
            AttemptOutcome::Retry(task)
        } else {
            let task = self.finish_failed(task, reason, Some(duration_ms)).await;
            AttemptOutcome::Failed(task)
        }
    }

    async fn finish_completed(&self, mut task: Task, value: Value, duration_ms: u64) -> Task {
        task.mark_completed(value.clone());
        {
            let mut state = self.state.lock().await;
            // A pause that lost the race with this outcome leaves a stale
            // placeholder; terminal tasks never re-enter the queue.
            state.paused.remove(&task.id);
            state.completed_ids.insert(task.id);
            state.total_completed += 1;
            push_history(
                &mut state.completed,
                COMPLETED_HISTORY_CAPACITY,
                task.clone(),
            );
        }
        self.registry
            .record_completion(&task.capability, duration_ms)
            .await;
        self.emit(LifecycleEvent::task(
            EventKind::TaskCompleted,
            task.id,
            json!({ "name": task.name, "duration_ms": duration_ms }),
        ));
        if let Some(results) = &self.results {
            // Fire-and-forget; persistence failures never fail the task.
            let results = Arc::clone(results);
            let task_id = task.id;
            tokio::spawn(async move {
                if let Err(e) = results.persist(task_id, &value).await {
                    warn!(task_id = %task_id, error = %e, "result persistence failed");
                }
            });
        }
        info!(task_id = %task.id, duration_ms, "task completed");
        self.notify.notify_waiters();
        task
    }

    async fn finish_failed(
        &self,
        mut task: Task,
        reason: String,
        agent_duration_ms: Option<u64>,
    ) -> Task {
        task.mark_failed(reason.clone());
        {
            let mut state = self.state.lock().await;
            state.paused.remove(&task.id);
            state.total_failed += 1;
            push_history(&mut state.failed, FAILED_HISTORY_CAPACITY, task.clone());
        }
        if let Some(duration_ms) = agent_duration_ms {
            self.registry
                .record_failure(&task.capability, duration_ms)
                .await;
        }
        self.emit(LifecycleEvent::task(
            EventKind::TaskFailed,
            task.id,
            json!({ "name": task.name, "error": reason }),
        ));
        warn!(task_id = %task.id, error = %reason, "task failed terminally");
        self.notify.notify_waiters();
        task
    }

    /// Settle an interrupted attempt: a pause parks the task as pending, a
    /// cancellation is terminal.
    async fn finish_interrupted(&self, mut task: Task) -> AttemptOutcome {
        let id = task.id;
        let was_pause = {
            let mut state = self.state.lock().await;
            if let Some(slot) = state.paused.get_mut(&id) {
                task.reset_to_pending();
                *slot = task.clone();
                true
            } else {
                task.mark_cancelled();
                state.total_cancelled += 1;
                push_history(&mut state.failed, FAILED_HISTORY_CAPACITY, task.clone());
                false
            }
        };
        if was_pause {
            info!(task_id = %id, "running task paused");
            AttemptOutcome::Paused(task)
        } else {
            self.emit(LifecycleEvent::task(
                EventKind::TaskCancelled,
                id,
                json!({ "name": task.name }),
            ));
            info!(task_id = %id, "running task cancelled");
            self.notify.notify_waiters();
            AttemptOutcome::Cancelled(task)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::MemorySnapshotStore;
    use async_trait::async_trait;
    use taskforge_core::Agent;

    fn test_engine() -> Arc<ExecutionEngine> {
        ExecutionEngine::new(EngineConfig::default(), Arc::new(MemorySnapshotStore::new()))
            .expect("default config is valid")
    }

    struct InstantAgent;

    #[async_trait]
    impl Agent for InstantAgent {
        async fn handle(
            &self,
            _parameters: &Map<String, Value>,
            _cancel: CancellationToken,
        ) -> TaskforgeResult<Value> {
            Ok(json!({ "ok": true }))
        }
    }

    #[test]
    fn test_history_ring_evicts_oldest() {
        let mut ring = VecDeque::new();
        for i in 0..5 {
            push_history(&mut ring, 3, Task::new(format!("t{i}"), "echo"));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.front().unwrap().name, "t2");
        assert_eq!(ring.back().unwrap().name, "t4");
    }

    #[tokio::test]
    async fn test_create_task_rejects_empty_input() {
        let engine = test_engine();
        let err = engine
            .create_task("", "echo", Map::new(), TaskPriority::Medium, vec![], None)
            .await;
        assert!(matches!(err, Err(TaskforgeError::InvalidInput(_))));

        let err = engine
            .create_task("ok", "  ", Map::new(), TaskPriority::Medium, vec![], None)
            .await;
        assert!(matches!(err, Err(TaskforgeError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_create_task_applies_default_timeout() {
        let engine = test_engine();
        let id = engine
            .create_task("t", "echo", Map::new(), TaskPriority::High, vec![], None)
            .await
            .unwrap();
        let draft = engine.created_task(id).await.unwrap();
        assert_eq!(draft.timeout, engine.config().default_task_timeout());
        assert_eq!(draft.priority, TaskPriority::High);
    }

    #[tokio::test]
    async fn test_submit_rejects_non_pending() {
        let engine = test_engine();
        let mut task = Task::new("done", "echo");
        task.mark_running();
        task.mark_completed(Value::Null);
        assert!(!engine.submit_task(task).await);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let engine = test_engine();
        // No agent registered, loop not started: the task just sits queued.
        let task = Task::new("doomed", "echo");
        let id = task.id;
        {
            let mut state = engine.state.lock().await;
            state.queue.insert(task);
        }

        assert!(engine.cancel_task(id).await);
        let view = engine.get_task_status(id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Cancelled);

        // Cancelled tasks never re-enter the queue.
        let state = engine.state.lock().await;
        assert!(!state.queue.contains(id));
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_returns_false() {
        let engine = test_engine();
        assert!(!engine.cancel_task(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_pause_and_resume_queued_task() {
        let engine = test_engine();
        let task = Task::new("parked", "echo").with_priority(TaskPriority::Critical);
        let id = task.id;
        {
            let mut state = engine.state.lock().await;
            state.queue.insert(task);
        }

        assert!(engine.pause_task(id).await);
        {
            let state = engine.state.lock().await;
            assert!(state.queue.is_empty());
            assert!(state.paused.contains_key(&id));
        }

        assert!(engine.resume_task(id).await);
        {
            let state = engine.state.lock().await;
            assert!(state.queue.contains(id));
            assert!(state.paused.is_empty());
        }
        let view = engine.get_task_status(id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_execute_task_refuses_unmet_draft_dependencies() {
        let engine = test_engine();
        engine.register_agent("echo", Arc::new(InstantAgent), vec![]).await;
        let dep = engine
            .create_task("dep", "echo", Map::new(), TaskPriority::Medium, vec![], None)
            .await
            .unwrap();
        let dependent = engine
            .create_task("dependent", "echo", Map::new(), TaskPriority::Medium, vec![dep], None)
            .await
            .unwrap();

        let err = engine.execute_task(dependent).await;
        assert!(matches!(err, Err(TaskforgeError::InvalidInput(_))));
        // The refused draft is left staged, not consumed.
        assert!(engine.created_task(dependent).await.is_some());

        // Once the dependency completes, the same call goes through.
        engine.execute_task(dep).await.unwrap();
        let report = engine.execute_task(dependent).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_pause_running_task_parks_and_signals() {
        let engine = test_engine();
        let mut task = Task::new("inflight", "echo");
        task.mark_running();
        let id = task.id;
        let cancel = CancellationToken::new();
        {
            let mut state = engine.state.lock().await;
            state.running.insert(
                id,
                RunningEntry {
                    task,
                    cancel: cancel.clone(),
                },
            );
        }

        assert!(engine.pause_task(id).await);
        assert!(cancel.is_cancelled());
        let state = engine.state.lock().await;
        assert!(state.paused.contains_key(&id));
    }

    #[tokio::test]
    async fn test_terminal_outcome_purges_stale_paused_placeholder() {
        let engine = test_engine();
        engine.register_agent("echo", Arc::new(InstantAgent), vec![]).await;
        let id = engine
            .create_task("racy", "echo", Map::new(), TaskPriority::Medium, vec![], None)
            .await
            .unwrap();
        {
            // A pause landing after the outcome settles leaves a placeholder
            // behind; the terminal transition must clear it.
            let mut state = engine.state.lock().await;
            let draft = state.drafts.get(&id).cloned().unwrap();
            state.paused.insert(id, draft);
        }

        let report = engine.execute_task(id).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);

        {
            let state = engine.state.lock().await;
            assert!(!state.paused.contains_key(&id));
        }
        // Resuming the settled task is refused, so it cannot re-run.
        assert!(!engine.resume_task(id).await);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_resume_unknown_returns_false() {
        let engine = test_engine();
        assert!(!engine.resume_task(Uuid::new_v4()).await);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_coordination_stats_shape() {
        let engine = test_engine();
        let stats = engine.get_coordination_stats().await;
        assert_eq!(stats["queued"], 0);
        assert_eq!(stats["running"], 0);
        assert_eq!(stats["max_concurrent_tasks"], 5);
        assert!(stats["system_efficiency"].as_f64().unwrap() >= 0.0);
    }
}
