//! Task and workflow orchestration engine.
//!
//! The engine accepts tasks targeting named agent capabilities, schedules
//! them by priority under dependency constraints and a process-wide
//! concurrency bound, retries transient failures, and executes workflows
//! (dependency-connected task sets) to a single terminal outcome. Workflow
//! state can be checkpointed to a [`SnapshotStore`] and recovered after a
//! restart.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskforge_orchestrator::{
//!     EngineConfig, ExecutionEngine, MemorySnapshotStore, TaskPriority,
//! };
//!
//! # async fn run(agent: Arc<dyn taskforge_core::Agent>) -> taskforge_core::TaskforgeResult<()> {
//! let engine = ExecutionEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemorySnapshotStore::new()),
//! )?;
//! engine.register_agent("echo", agent, vec!["echo".into()]).await;
//!
//! let id = engine
//!     .create_task("hello", "echo", Default::default(), TaskPriority::High, vec![], None)
//!     .await?;
//! let report = engine.execute_task(id).await?;
//! println!("finished: {:?}", report.status);
//! # Ok(())
//! # }
//! ```

/// Durable workflow snapshots and the stores that hold them.
pub mod checkpoint;
/// Engine tuning knobs, loadable from TOML.
pub mod config;
/// The execution engine: dispatch loop, retries, cancellation, metrics.
pub mod engine;
/// The priority dispatch queue.
pub mod queue;
/// Agent registration, health probing, and utilization tracking.
pub mod registry;
/// Core data model: tasks, priorities, statuses, workflows.
pub mod types;
/// Workflow construction, validation, execution, and recovery.
pub mod workflow;

pub use checkpoint::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, WorkflowSnapshot};
pub use config::EngineConfig;
pub use engine::{
    ExecutionEngine, ExecutionReport, COMPLETED_HISTORY_CAPACITY, FAILED_HISTORY_CAPACITY,
};
pub use queue::DispatchQueue;
pub use registry::{AgentHealth, AgentLoad, AgentRegistry, AgentStats, AgentUtilization, HealthStatus};
pub use types::{Task, TaskPriority, TaskStatus, TaskView, Workflow, WorkflowStatus};
pub use workflow::{validate_workflow, IntegrityReport, TaskSpec, WorkflowReport};
