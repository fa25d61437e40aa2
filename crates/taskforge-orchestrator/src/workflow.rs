use crate::checkpoint::WorkflowSnapshot;
use crate::engine::ExecutionEngine;
use crate::types::{Task, TaskPriority, TaskStatus, Workflow, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use taskforge_core::{EventKind, LifecycleEvent, TaskforgeError, TaskforgeResult};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of workflow integrity validation.
///
/// `valid` is false exactly when `issues` is non-empty: a dependency cycle or
/// a reference to a task that does not exist. `warnings` are advisory
/// (possibly-unreachable tasks) and never fail validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Whether the workflow may be executed.
    pub valid: bool,
    /// Hard problems: cycles and missing dependency references.
    pub issues: Vec<String>,
    /// Advisory observations that do not block execution.
    pub warnings: Vec<String>,
}

/// Declarative task definition used by workflow construction.
///
/// Dependencies are expressed by the names of sibling specs and resolved to
/// task ids when the workflow is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name; must be unique within the workflow.
    pub name: String,
    /// Target agent capability.
    pub capability: String,
    /// Opaque parameters forwarded to the agent.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Scheduling priority.
    #[serde(default = "default_spec_priority")]
    pub priority: TaskPriority,
    /// Names of sibling specs this task depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Retry budget for transient failures.
    #[serde(default)]
    pub max_retries: u32,
    /// Per-attempt deadline in milliseconds; the engine default applies when
    /// absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_spec_priority() -> TaskPriority {
    TaskPriority::Medium
}

/// Outcome of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// The executed workflow.
    pub workflow_id: Uuid,
    /// Terminal workflow status.
    pub status: WorkflowStatus,
    /// Results of completed tasks, keyed by task id.
    pub task_results: HashMap<Uuid, Value>,
    /// Total number of tasks in the workflow.
    pub total_tasks: usize,
    /// How many tasks completed.
    pub completed_tasks: usize,
    /// How many tasks failed terminally or were cancelled.
    pub failed_tasks: usize,
}

/// Validate a workflow's dependency graph.
///
/// Depth-first traversal with a visited set and an in-progress path set to
/// detect back edges; any dependency id that is neither an in-workflow task
/// nor in `known_completed` is a missing reference. A task that has
/// dependencies but is itself depended on by nothing is flagged as possibly
/// unreachable — an advisory warning, not a failure.
pub fn validate_workflow(workflow: &Workflow, known_completed: &HashSet<Uuid>) -> IntegrityReport {
    let ids: HashSet<Uuid> = workflow.tasks.iter().map(|t| t.id).collect();
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    for task in &workflow.tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep) && !known_completed.contains(dep) {
                issues.push(format!(
                    "task '{}' depends on missing task {dep}",
                    task.name
                ));
            }
        }
    }

    // Back-edge search over in-workflow edges: 1 = on current path, 2 = done.
    let by_id: HashMap<Uuid, &Task> = workflow.tasks.iter().map(|t| (t.id, t)).collect();
    let mut colors: HashMap<Uuid, u8> = HashMap::new();
    for task in &workflow.tasks {
        if let Some(cyclic) = dfs_cycle(task.id, &by_id, &mut colors) {
            let name = by_id.get(&cyclic).map_or("?", |t| t.name.as_str());
            issues.push(format!("dependency cycle detected involving task '{name}'"));
            break;
        }
    }

    let depended_on: HashSet<Uuid> = workflow
        .tasks
        .iter()
        .flat_map(|t| t.dependencies.iter().copied())
        .collect();
    for task in &workflow.tasks {
        if !task.dependencies.is_empty() && !depended_on.contains(&task.id) {
            warnings.push(format!("task '{}' is possibly unreachable", task.name));
        }
    }

    IntegrityReport {
        valid: issues.is_empty(),
        issues,
        warnings,
    }
}

fn dfs_cycle(id: Uuid, by_id: &HashMap<Uuid, &Task>, colors: &mut HashMap<Uuid, u8>) -> Option<Uuid> {
    match colors.get(&id) {
        Some(1) => return Some(id),
        Some(2) => return None,
        _ => {}
    }
    colors.insert(id, 1);
    if let Some(task) = by_id.get(&id) {
        for dep in &task.dependencies {
            if by_id.contains_key(dep) {
                if let Some(cyclic) = dfs_cycle(*dep, by_id, colors) {
                    return Some(cyclic);
                }
            }
        }
    }
    colors.insert(id, 2);
    None
}

impl ExecutionEngine {
    /// Build a workflow from task specs, resolving symbolic dependencies.
    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        specs: Vec<TaskSpec>,
    ) -> TaskforgeResult<Uuid> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TaskforgeError::InvalidInput("workflow name is empty".into()));
        }
        if specs.is_empty() {
            return Err(TaskforgeError::InvalidInput(
                "workflow has no tasks".into(),
            ));
        }

        let mut ids_by_name: HashMap<String, Uuid> = HashMap::new();
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in &specs {
            if spec.name.trim().is_empty() || spec.capability.trim().is_empty() {
                return Err(TaskforgeError::InvalidInput(
                    "task spec name and capability must be non-empty".into(),
                ));
            }
            let task = Task::new(&spec.name, &spec.capability)
                .with_parameters(spec.parameters.clone())
                .with_priority(spec.priority)
                .with_max_retries(spec.max_retries)
                .with_timeout(
                    spec.timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| self.config().default_task_timeout()),
                );
            if ids_by_name.insert(spec.name.clone(), task.id).is_some() {
                return Err(TaskforgeError::InvalidInput(format!(
                    "duplicate task name '{}' in workflow",
                    spec.name
                )));
            }
            tasks.push(task);
        }

        for (task, spec) in tasks.iter_mut().zip(&specs) {
            let mut deps = Vec::with_capacity(spec.depends_on.len());
            for dep_name in &spec.depends_on {
                let dep_id = ids_by_name.get(dep_name).ok_or_else(|| {
                    TaskforgeError::InvalidInput(format!(
                        "task '{}' depends on unknown task '{dep_name}'",
                        spec.name
                    ))
                })?;
                deps.push(*dep_id);
            }
            task.dependencies = deps;
        }

        let workflow = Workflow::new(name, description, tasks);
        let id = workflow.id;
        self.workflows.lock().await.insert(id, workflow);
        Ok(id)
    }

    /// A clone of a registered workflow.
    pub async fn get_workflow(&self, workflow_id: Uuid) -> Option<Workflow> {
        self.workflows.lock().await.get(&workflow_id).cloned()
    }

    /// Ids of all registered workflows.
    pub async fn list_workflows(&self) -> Vec<Uuid> {
        self.workflows.lock().await.keys().copied().collect()
    }

    /// Validate a registered workflow against the engine's known-completed
    /// task set.
    pub async fn validate_workflow_integrity(
        &self,
        workflow_id: Uuid,
    ) -> TaskforgeResult<IntegrityReport> {
        let workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or(TaskforgeError::WorkflowNotFound(workflow_id))?;
        let known = {
            let state = self.state.lock().await;
            state.completed_ids.clone()
        };
        Ok(validate_workflow(&workflow, &known))
    }

    /// Execute a workflow to a terminal status.
    ///
    /// Validation failures refuse execution before any task runs. Execution
    /// proceeds in dependency levels: all eligible tasks fan out concurrently
    /// (bounded by the process-wide concurrency limit), the batch is awaited,
    /// and eligibility is recomputed. A task failure does not abort sibling
    /// branches; tasks downstream of the failure are left pending and the
    /// workflow finishes `Failed`.
    pub async fn execute_workflow(
        self: &Arc<Self>,
        workflow_id: Uuid,
    ) -> TaskforgeResult<WorkflowReport> {
        let mut workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or(TaskforgeError::WorkflowNotFound(workflow_id))?;

        let integrity = self.validate_workflow_integrity(workflow_id).await?;
        if !integrity.valid {
            self.set_workflow_status(workflow_id, WorkflowStatus::Failed)
                .await;
            self.emit(LifecycleEvent::workflow(
                EventKind::WorkflowFailed,
                workflow_id,
                json!({ "issues": integrity.issues }),
            ));
            return Err(TaskforgeError::WorkflowValidation(
                integrity.issues.join("; "),
            ));
        }

        workflow.status = WorkflowStatus::Running;
        self.sync_workflow(&workflow).await;
        self.emit(LifecycleEvent::workflow(
            EventKind::WorkflowStarted,
            workflow_id,
            json!({ "name": workflow.name, "total_tasks": workflow.tasks.len() }),
        ));
        info!(workflow_id = %workflow_id, tasks = workflow.tasks.len(), "workflow started");

        loop {
            let known = {
                let state = self.state.lock().await;
                state.completed_ids.clone()
            };
            let mut completed = workflow.completed_ids();
            completed.extend(known);

            let eligible: Vec<Task> = workflow
                .tasks
                .iter()
                .filter(|t| t.is_ready(&completed))
                .cloned()
                .collect();

            if eligible.is_empty() {
                let pending_remain = workflow
                    .tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Pending);
                if !pending_remain {
                    break;
                }
                if self.pending_blocked_by_failure(&workflow) {
                    // Downstream of a terminal failure; no progress is
                    // possible but this is a failure, not a deadlock.
                    break;
                }
                workflow.status = WorkflowStatus::Failed;
                self.sync_workflow(&workflow).await;
                let message = format!(
                    "no eligible task while {} pending tasks remain",
                    workflow
                        .tasks
                        .iter()
                        .filter(|t| t.status == TaskStatus::Pending)
                        .count()
                );
                self.emit(LifecycleEvent::workflow(
                    EventKind::WorkflowFailed,
                    workflow_id,
                    json!({ "error": message, "deadlock": true }),
                ));
                warn!(workflow_id = %workflow_id, "workflow deadlocked");
                return Err(TaskforgeError::WorkflowDeadlock(message));
            }

            let mut join_set = JoinSet::new();
            for task in eligible {
                let engine = Arc::clone(self);
                join_set.spawn(async move { engine.run_until_terminal(task).await });
            }
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(finished) => {
                        if let Some(slot) =
                            workflow.tasks.iter_mut().find(|t| t.id == finished.id)
                        {
                            *slot = finished;
                        }
                    }
                    Err(e) => warn!(workflow_id = %workflow_id, error = %e, "task body panicked"),
                }
            }

            self.sync_workflow(&workflow).await;
            if self.config().autosave_checkpoints {
                self.save_checkpoint_best_effort(workflow_id).await;
            }
        }

        let all_completed = workflow
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed);
        workflow.status = if all_completed {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        self.sync_workflow(&workflow).await;

        let report = build_report(&workflow);
        let kind = if all_completed {
            EventKind::WorkflowCompleted
        } else {
            EventKind::WorkflowFailed
        };
        self.emit(LifecycleEvent::workflow(
            kind,
            workflow_id,
            json!({
                "completed_tasks": report.completed_tasks,
                "failed_tasks": report.failed_tasks,
                "total_tasks": report.total_tasks,
            }),
        ));
        if all_completed {
            info!(workflow_id = %workflow_id, "workflow completed");
        } else {
            warn!(
                workflow_id = %workflow_id,
                failed = report.failed_tasks,
                "workflow finished with failures"
            );
        }
        Ok(report)
    }

    /// Whether every still-pending task is (transitively) downstream of a
    /// terminally failed or cancelled task.
    fn pending_blocked_by_failure(&self, workflow: &Workflow) -> bool {
        let mut doomed = workflow.failed_ids();
        loop {
            let mut grew = false;
            for task in &workflow.tasks {
                if task.status == TaskStatus::Pending
                    && !doomed.contains(&task.id)
                    && task.dependencies.iter().any(|d| doomed.contains(d))
                {
                    doomed.insert(task.id);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        workflow
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .all(|t| doomed.contains(&t.id))
    }

    async fn sync_workflow(&self, workflow: &Workflow) {
        self.workflows
            .lock()
            .await
            .insert(workflow.id, workflow.clone());
    }

    async fn set_workflow_status(&self, workflow_id: Uuid, status: WorkflowStatus) {
        if let Some(workflow) = self.workflows.lock().await.get_mut(&workflow_id) {
            workflow.status = status;
        }
    }

    // --- checkpoint & recovery ---

    /// Write a snapshot of the workflow's current task states.
    pub async fn save_checkpoint(&self, workflow_id: Uuid) -> TaskforgeResult<()> {
        let snapshot = self
            .get_workflow(workflow_id)
            .await
            .map(|wf| WorkflowSnapshot::capture(&wf))
            .ok_or(TaskforgeError::WorkflowNotFound(workflow_id))?;
        self.snapshots
            .put(&snapshot)
            .await
            .map_err(|e| TaskforgeError::Checkpoint(e.to_string()))?;
        self.emit(LifecycleEvent::workflow(
            EventKind::CheckpointSaved,
            workflow_id,
            json!({ "tasks": snapshot.tasks.len() }),
        ));
        info!(workflow_id = %workflow_id, "checkpoint saved");
        Ok(())
    }

    /// Save a checkpoint, logging instead of failing on error.
    pub(crate) async fn save_checkpoint_best_effort(&self, workflow_id: Uuid) {
        if let Err(e) = self.save_checkpoint(workflow_id).await {
            warn!(workflow_id = %workflow_id, error = %e, "checkpoint save failed");
        }
    }

    /// Reconstruct a workflow from its most recent snapshot.
    ///
    /// Completed and failed tasks keep their recorded terminal states;
    /// everything else — including tasks that were running at snapshot time —
    /// restarts from pending (at-least-once semantics). The workflow is
    /// re-registered as running and is eligible for dispatch.
    pub async fn recover_workflow(&self, workflow_id: Uuid) -> TaskforgeResult<bool> {
        let snapshot = self
            .snapshots
            .get(workflow_id)
            .await?
            .ok_or(TaskforgeError::CheckpointNotFound(workflow_id))?;

        let mut tasks = snapshot.tasks;
        for task in &mut tasks {
            if snapshot.completed_ids.contains(&task.id) {
                // Recorded terminal state (result, timestamps) is kept.
                continue;
            }
            if snapshot.failed_ids.contains(&task.id) {
                if !task.status.is_terminal() {
                    task.mark_failed("failed before checkpoint");
                }
                continue;
            }
            task.reset_to_pending();
        }

        let restored = tasks.len();
        let workflow = Workflow {
            id: snapshot.workflow_id,
            name: snapshot.name,
            description: snapshot.description,
            tasks,
            status: WorkflowStatus::Running,
        };
        {
            let mut state = self.state.lock().await;
            state.completed_ids.extend(snapshot.completed_ids.iter());
        }
        self.workflows.lock().await.insert(workflow_id, workflow);
        self.emit(LifecycleEvent::workflow(
            EventKind::WorkflowRecovered,
            workflow_id,
            json!({ "tasks": restored }),
        ));
        self.notify.notify_waiters();
        info!(workflow_id = %workflow_id, tasks = restored, "workflow recovered from checkpoint");
        Ok(true)
    }

    /// Load every stored snapshot into the workflow registry for inspection.
    ///
    /// Nothing is re-executed; resumption stays an explicit
    /// [`recover_workflow`](Self::recover_workflow) call.
    pub async fn load_snapshots(&self) -> TaskforgeResult<usize> {
        let ids = self.snapshots.list().await?;
        let mut loaded = 0;
        for id in ids {
            {
                let workflows = self.workflows.lock().await;
                if workflows.contains_key(&id) {
                    continue;
                }
            }
            let Some(snapshot) = self.snapshots.get(id).await? else {
                continue;
            };
            let status = derive_status(&snapshot.tasks);
            let workflow = Workflow {
                id: snapshot.workflow_id,
                name: snapshot.name,
                description: snapshot.description,
                tasks: snapshot.tasks,
                status,
            };
            self.workflows.lock().await.insert(id, workflow);
            loaded += 1;
        }
        if loaded > 0 {
            info!(count = loaded, "snapshots loaded into workflow registry");
        }
        Ok(loaded)
    }
}

fn derive_status(tasks: &[Task]) -> WorkflowStatus {
    if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
        WorkflowStatus::Completed
    } else if tasks.iter().all(|t| t.status.is_terminal()) {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Pending
    }
}

fn build_report(workflow: &Workflow) -> WorkflowReport {
    let mut task_results = HashMap::new();
    let mut completed = 0;
    let mut failed = 0;
    for task in &workflow.tasks {
        match &task.status {
            TaskStatus::Completed => {
                completed += 1;
                task_results.insert(task.id, task.result.clone().unwrap_or(Value::Null));
            }
            TaskStatus::Failed { .. } | TaskStatus::Cancelled => failed += 1,
            _ => {}
        }
    }
    WorkflowReport {
        workflow_id: workflow.id,
        status: workflow.status,
        task_results,
        total_tasks: workflow.tasks.len(),
        completed_tasks: completed,
        failed_tasks: failed,
    }
}
