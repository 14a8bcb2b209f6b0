//! Pluggable run queue
//!
//! The scheduler pulls ready tasks through this interface and reports task
//! lifecycle events back through it. The process supervisor implements it to
//! tag tasks with their owning process without the scheduler ever learning
//! what a process is; [`FifoQueue`] is the plain implementation used when no
//! supervision is wanted.

use crate::error::InvariantError;
use crate::scheduler::task::{TaskId, TaskOutcome};
use crate::sync::SemaphoreId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;

/// Follow-up commands requested by a run-queue callback
///
/// Callbacks run inside the scheduler and must not re-enter it; they record
/// what should happen and the scheduler applies it right after.
#[derive(Debug, Default)]
pub struct QueueActions {
    /// Tasks to cancel
    pub cancel: Vec<TaskId>,
    /// Semaphores to destroy
    pub destroy: Vec<SemaphoreId>,
}

/// Scheduler-facing run queue interface
pub trait RunQueue: std::fmt::Debug {
    /// Enqueue a ready task
    fn schedule(&mut self, task: TaskId);

    /// Pull the next ready task, if any
    fn next_task(&mut self) -> Result<Option<TaskId>, InvariantError>;

    /// A task was just created and scheduled for the first time
    fn task_started(&mut self, task: TaskId);

    /// A task terminated with the given outcome
    fn task_finished(&mut self, task: TaskId, outcome: &TaskOutcome, actions: &mut QueueActions);

    /// Downcast hook so context extensions can reach a concrete queue
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Plain FIFO run queue with no lifecycle observation
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FifoQueue {
    queue: VecDeque<TaskId>,
}

impl RunQueue for FifoQueue {
    fn schedule(&mut self, task: TaskId) {
        self.queue.push_back(task);
    }

    fn next_task(&mut self) -> Result<Option<TaskId>, InvariantError> {
        Ok(self.queue.pop_front())
    }

    fn task_started(&mut self, _task: TaskId) {}

    fn task_finished(
        &mut self,
        _task: TaskId,
        _outcome: &TaskOutcome,
        _actions: &mut QueueActions,
    ) {
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
