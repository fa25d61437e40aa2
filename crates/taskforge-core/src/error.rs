use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`TaskforgeError`].
pub type TaskforgeResult<T> = Result<T, TaskforgeError>;

/// Top-level error type for the Taskforge engine.
///
/// Retryability is a property of the variant: [`Timeout`](Self::Timeout) and
/// [`Execution`](Self::Execution) are retried while the task has retry budget
/// left; everything else is terminal or a caller-level error.
#[derive(Debug, Error)]
pub enum TaskforgeError {
    /// No agent is registered for the capability a task targets. Terminal,
    /// never retried.
    #[error("no agent registered for capability '{0}'")]
    AgentNotRegistered(String),

    /// An agent invocation exceeded the task's deadline. Retryable.
    #[error("task {task_id} timed out after {timeout:?}")]
    Timeout {
        /// The task that hit its deadline.
        task_id: Uuid,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// An agent invocation returned an error. Retryable; the message carries
    /// the agent's failure text.
    #[error("execution error: {0}")]
    Execution(String),

    /// A task exhausted its retry budget. Terminal.
    #[error("task {task_id} failed after {retries} retries")]
    MaxRetriesExceeded {
        /// The task that ran out of retries.
        task_id: Uuid,
        /// The retry budget that was exhausted.
        retries: u32,
    },

    /// A workflow failed integrity validation (dependency cycle or missing
    /// task reference). Execution is refused before it starts.
    #[error("workflow validation failed: {0}")]
    WorkflowValidation(String),

    /// No pending task in a workflow is dependency-eligible while pending
    /// tasks remain; progress is provably impossible.
    #[error("workflow deadlock: {0}")]
    WorkflowDeadlock(String),

    /// No checkpoint snapshot exists for the requested workflow.
    #[error("no checkpoint found for workflow {0}")]
    CheckpointNotFound(Uuid),

    /// A snapshot store operation failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A direct lookup was given an id the engine does not know.
    #[error("unknown task {0}")]
    TaskNotFound(Uuid),

    /// A workflow lookup was given an id the engine does not know.
    #[error("unknown workflow {0}")]
    WorkflowNotFound(Uuid),

    /// Malformed caller input (empty name/capability, bad dependency set).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),
}
