//! Core contracts and error definitions for the Taskforge orchestration engine.
//!
//! This crate provides the types shared between the orchestrator and its
//! external collaborators: the unified error enum, the agent execution
//! contract, and the lifecycle event sink.
//!
//! # Main types
//!
//! - [`TaskforgeError`] — Unified error enum for all orchestration subsystems.
//! - [`TaskforgeResult`] — Convenience alias for `Result<T, TaskforgeError>`.
//! - [`Agent`] — The executor contract a task capability resolves to.
//! - [`ResultStore`] — Optional fire-and-forget result persistence collaborator.
//! - [`EventSink`] — Best-effort sink for task/workflow lifecycle events.
//! - [`LifecycleEvent`] — A single emitted lifecycle event.

/// Agent execution and result persistence contracts.
pub mod agent;
/// Error enum and result alias.
pub mod error;
/// Lifecycle events and event sinks.
pub mod event;

pub use agent::{Agent, ResultStore};
pub use error::{TaskforgeError, TaskforgeResult};
pub use event::{EventKind, EventSink, LifecycleEvent, NullEventSink, TracingEventSink};
