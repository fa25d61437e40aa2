use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of lifecycle transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task entered the running state.
    TaskStarted,
    /// A task made observable progress (pause/resume and similar).
    TaskProgress,
    /// A task reached the completed state.
    TaskCompleted,
    /// A task reached the failed state.
    TaskFailed,
    /// A task was cancelled.
    TaskCancelled,
    /// A task transitioned back to pending for another attempt.
    TaskRetrying,
    /// A workflow began executing.
    WorkflowStarted,
    /// A workflow finished with every task completed.
    WorkflowCompleted,
    /// A workflow finished with at least one terminal failure or deadlock.
    WorkflowFailed,
    /// A checkpoint snapshot was written.
    CheckpointSaved,
    /// A workflow was reconstructed from a checkpoint.
    WorkflowRecovered,
}

/// A single task or workflow lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened.
    pub kind: EventKind,
    /// The task this event concerns, if any.
    pub task_id: Option<Uuid>,
    /// The workflow this event concerns, if any.
    pub workflow_id: Option<Uuid>,
    /// Event-specific details (error text, retry count, result summary).
    pub payload: Value,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Create a task-scoped event.
    pub fn task(kind: EventKind, task_id: Uuid, payload: Value) -> Self {
        Self {
            kind,
            task_id: Some(task_id),
            workflow_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Create a workflow-scoped event.
    pub fn workflow(kind: EventKind, workflow_id: Uuid, payload: Value) -> Self {
        Self {
            kind,
            task_id: None,
            workflow_id: Some(workflow_id),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Best-effort sink for lifecycle events.
///
/// `emit` is infallible and must not block: the dispatch loop calls it inline
/// and an implementation that needs to do I/O should hand the event off to
/// its own queue or task.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Never blocks, never fails.
    fn emit(&self, event: LifecycleEvent);
}

/// An event sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// An event sink that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        tracing::info!(
            kind = ?event.kind,
            task_id = ?event.task_id,
            workflow_id = ?event.workflow_id,
            payload = %event.payload,
            "lifecycle event"
        );
    }
}
