use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Scheduling priority of a task. Higher ranks dispatch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work, dispatched last.
    Low,
    /// Default priority.
    Medium,
    /// Dispatched ahead of medium and low.
    High,
    /// Dispatched ahead of everything else.
    Critical,
}

impl TaskPriority {
    /// Numeric rank used for queue ordering; larger dispatches first.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Status of a task in the execution engine.
///
/// Legal transitions: `Pending → Running`, `Running → Completed | Failed |
/// Cancelled`, `Pending → Cancelled`, and `Running → Pending` exactly as a
/// retry. Terminal tasks are never mutated again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued or waiting on dependencies.
    Pending,
    /// Currently executing on an agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed {
        /// Why the task failed (timeout text, agent error, missing agent).
        reason: String,
    },
    /// Cancelled before or during execution; never re-enters the queue.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }
}

fn default_max_retries() -> u32 {
    0
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

/// A single unit of work targeting one agent capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// The agent capability this task targets.
    pub capability: String,
    /// Opaque parameters forwarded to the agent.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the current attempt started, if running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result produced by the agent on success.
    pub result: Option<Value>,
    /// Error text on failure or cancellation.
    pub error: Option<String>,
    /// Tasks that must be completed before this one is eligible.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// How many times a transient failure may be retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How many retries have been consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Deadline for a single agent invocation.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

impl Task {
    /// Create a pending task with default priority, no dependencies, and the
    /// default timeout.
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capability: capability.into(),
            parameters: Map::new(),
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            dependencies: Vec::new(),
            max_retries: default_max_retries(),
            retry_count: 0,
            timeout: default_timeout(),
        }
    }

    /// Set the task's parameters.
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the task's priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the task's dependencies.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether this task is pending with every dependency completed.
    pub fn is_ready(&self, completed_ids: &HashSet<Uuid>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed_ids.contains(dep))
    }

    /// Transition `Pending → Running`, stamping `started_at`.
    pub fn mark_running(&mut self) {
        debug_assert_eq!(self.status, TaskStatus::Pending);
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition `Running → Completed`, recording the result.
    pub fn mark_completed(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Transition to `Failed` with the given reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.error = Some(reason.clone());
        self.status = TaskStatus::Failed { reason };
        self.completed_at = Some(Utc::now());
    }

    /// Transition to `Cancelled`.
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.error = Some("cancelled".to_string());
        self.completed_at = Some(Utc::now());
    }

    /// The retry transition: `Running → Pending`, consuming one retry and
    /// clearing `started_at`. The only legal way back to `Pending`.
    pub fn mark_retrying(&mut self, error: impl Into<String>) {
        debug_assert!(self.retry_count < self.max_retries);
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.error = Some(error.into());
    }

    /// Reset to `Pending` without consuming a retry (pause/resume and
    /// checkpoint recovery).
    pub fn reset_to_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }
}

/// Read-only view of a task returned by status lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    /// Task id.
    pub id: Uuid,
    /// Task name.
    pub name: String,
    /// Target capability.
    pub capability: String,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current status.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Start of the current/last attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries consumed.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Result on success.
    pub result: Option<Value>,
    /// Error text on failure.
    pub error: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            capability: task.capability.clone(),
            priority: task.priority,
            status: task.status.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            result: task.result.clone(),
            error: task.error.clone(),
        }
    }
}

/// Status of a workflow as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but not yet executed.
    Pending,
    /// At least one task is pending or running.
    Running,
    /// Every task completed.
    Completed,
    /// A task failed terminally, was cancelled, or progress deadlocked.
    Failed,
}

/// A set of tasks connected by dependency edges, executed to a single
/// terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Constituent tasks.
    pub tasks: Vec<Task>,
    /// Current status.
    pub status: WorkflowStatus,
}

impl Workflow {
    /// Create a pending workflow over the given tasks.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            tasks,
            status: WorkflowStatus::Pending,
        }
    }

    /// Look up a task by id.
    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Ids of all completed tasks.
    pub fn completed_ids(&self) -> HashSet<Uuid> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect()
    }

    /// Ids of all terminally failed or cancelled tasks.
    pub fn failed_ids(&self) -> HashSet<Uuid> {
        self.tasks
            .iter()
            .filter(|t| {
                matches!(t.status, TaskStatus::Failed { .. } | TaskStatus::Cancelled)
            })
            .map(|t| t.id)
            .collect()
    }
}
