use crate::types::{Task, TaskView};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Pending-task queue ordered by priority with FIFO stability.
///
/// A new task is inserted immediately before the first queued task whose
/// priority is strictly lower, so equal priorities preserve arrival order.
/// Dequeueing skips tasks whose dependencies are not yet completed; a
/// blocked task stays queued and is reconsidered on the next dispatch cycle.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    tasks: VecDeque<Task>,
}

impl DispatchQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    /// Insert a task by priority, after all equal-priority tasks.
    pub fn insert(&mut self, task: Task) {
        let rank = task.priority.rank();
        let pos = self
            .tasks
            .iter()
            .position(|queued| queued.priority.rank() < rank)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(pos, task);
    }

    /// Remove and return the highest-priority, earliest-arrived task whose
    /// dependencies are all in `completed_ids`. Blocked tasks are skipped,
    /// not removed.
    pub fn pop_eligible(&mut self, completed_ids: &HashSet<Uuid>) -> Option<Task> {
        let pos = self
            .tasks
            .iter()
            .position(|task| task.is_ready(completed_ids))?;
        self.tasks.remove(pos)
    }

    /// Whether any queued task is dependency-eligible.
    pub fn has_eligible(&self, completed_ids: &HashSet<Uuid>) -> bool {
        self.tasks.iter().any(|task| task.is_ready(completed_ids))
    }

    /// Remove a specific task from the queue (cancellation, pause).
    pub fn remove(&mut self, id: Uuid) -> Option<Task> {
        let pos = self.tasks.iter().position(|task| task.id == id)?;
        self.tasks.remove(pos)
    }

    /// Borrow a queued task by id.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Whether a task with this id is queued.
    pub fn contains(&self, id: Uuid) -> bool {
        self.tasks.iter().any(|task| task.id == id)
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Views of all queued tasks in dispatch order.
    pub fn views(&self) -> Vec<TaskView> {
        self.tasks.iter().map(TaskView::from).collect()
    }
}
