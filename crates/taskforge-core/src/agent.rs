use crate::error::TaskforgeResult;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The executor contract a task capability resolves to.
///
/// The engine is polymorphic over this single method: tasks are routed purely
/// by capability-name lookup in the registry, never by per-verb dispatch.
/// Implementations should observe `cancel` at their suspension points so that
/// cancellation actually interrupts work; the engine additionally races the
/// invocation against the token, so a non-cooperative agent is abandoned
/// rather than left running unobserved.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Execute one unit of work with the given parameters.
    ///
    /// May be long-running; runs under the task's deadline.
    async fn handle(
        &self,
        parameters: &Map<String, Value>,
        cancel: CancellationToken,
    ) -> TaskforgeResult<Value>;

    /// Optional liveness probe.
    ///
    /// `None` (the default) means the agent exposes no probe and is
    /// classified as `limited` by health checks; `Some(Ok(()))` means
    /// healthy, `Some(Err(_))` means unhealthy.
    async fn health_probe(&self) -> Option<TaskforgeResult<()>> {
        None
    }
}

/// Fire-and-forget persistence of completed task results.
///
/// Failures are logged and never fail the task that produced the result.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist the result of a completed task.
    async fn persist(&self, task_id: Uuid, result: &Value) -> TaskforgeResult<()>;
}
