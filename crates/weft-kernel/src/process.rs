//! Process supervision
//!
//! A process is a named group of tasks sharing a cancellation lifecycle. The
//! first task added is the primary: when it terminates, the process records
//! its outcome, cancels every other member, and destroys the semaphores
//! registered for exit cleanup.
//!
//! [`ProcessQueue`] implements the scheduler's [`RunQueue`] so it can tag
//! each task with its owning process and observe start/finish events; the
//! scheduler itself never learns what a process is.

use crate::effect::{call_routine, Effect};
use crate::error::{InvariantError, SerializationError, TaskError};
use crate::heap::{Marks, Spawned};
use crate::routine::{Resume, Routine, Step};
use crate::scheduler::{
    EffectContext, QueueActions, RunQueue, SchedulerCore, TaskId, TaskOutcome,
};
use crate::sync::SemaphoreId;
use crate::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Write as _;

/// Unique identifier for a process
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProcessId(u64);

impl ProcessId {
    /// The numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id from its numeric value
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

/// A live process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    id: ProcessId,
    name: String,
    /// Member tasks; the first entry is the primary
    tasks: Vec<TaskId>,
    /// The primary task's outcome, once it has terminated
    outcome: Option<TaskOutcome>,
    /// Semaphores to destroy when the process exits
    cleanup: Vec<SemaphoreId>,
}

impl Process {
    /// Unique id
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Process name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member tasks, primary first
    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }
}

/// Post-mortem record of an exited process, pruned by reachability at save
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedProcess {
    /// Process name
    pub name: String,
    /// The primary task's outcome
    pub outcome: TaskOutcome,
}

/// Run queue that groups tasks into supervised processes
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProcessQueue {
    queue: VecDeque<TaskId>,
    next_id: u64,
    processes: FxHashMap<ProcessId, Process>,
    finished: FxHashMap<ProcessId, FinishedProcess>,
    owner: FxHashMap<TaskId, ProcessId>,
    /// Process context of the task currently being stepped
    current: Option<ProcessId>,
}

impl ProcessQueue {
    /// Create an empty supervisor
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a process around its primary task
    pub fn start_process(
        &mut self,
        core: &mut SchedulerCore,
        name: &str,
        spawned: Spawned,
    ) -> ProcessId {
        while self.processes.contains_key(&ProcessId(self.next_id))
            || self.finished.contains_key(&ProcessId(self.next_id))
        {
            self.next_id += 1;
        }
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        self.processes.insert(
            id,
            Process {
                id,
                name: name.to_string(),
                tasks: Vec::new(),
                outcome: None,
                cleanup: Vec::new(),
            },
        );
        tracing::debug!(process = id.as_u64(), name, "process started");

        // The primary task starts inside the new process context; the
        // spawning task's own context is restored afterwards.
        let previous = self.current.replace(id);
        let task = core.create_task(spawned);
        self.schedule(task);
        self.task_started(task);
        self.current = previous;
        id
    }

    /// The process whose task is currently being stepped
    pub fn current_process(&self) -> Option<ProcessId> {
        self.current
    }

    /// A live process
    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    /// The primary task of a live process
    pub fn primary(&self, id: ProcessId) -> Option<TaskId> {
        self.processes.get(&id).and_then(|p| p.tasks.first().copied())
    }

    /// Member tasks of a live process
    pub fn member_tasks(&self, id: ProcessId) -> Vec<TaskId> {
        self.processes
            .get(&id)
            .map(|p| p.tasks.clone())
            .unwrap_or_default()
    }

    /// Whether the process has exited (or is no longer known)
    pub fn is_finished(&self, id: ProcessId) -> bool {
        !self.processes.contains_key(&id)
    }

    /// Process name, live or finished
    pub fn name(&self, id: ProcessId) -> Option<&str> {
        self.processes
            .get(&id)
            .map(|p| p.name.as_str())
            .or_else(|| self.finished.get(&id).map(|p| p.name.as_str()))
    }

    /// The primary task's recorded outcome, live or finished
    pub fn outcome(&self, id: ProcessId) -> Option<&TaskOutcome> {
        self.processes
            .get(&id)
            .and_then(|p| p.outcome.as_ref())
            .or_else(|| self.finished.get(&id).map(|p| &p.outcome))
    }

    /// The primary task's result
    pub fn result(&self, id: ProcessId) -> Option<&Value> {
        self.outcome(id).and_then(TaskOutcome::result)
    }

    /// The primary task's error
    pub fn error(&self, id: ProcessId) -> Option<&TaskError> {
        self.outcome(id).and_then(TaskOutcome::error)
    }

    /// Register a semaphore to destroy when the current process exits
    pub fn destroy_on_exit(&mut self, sem: SemaphoreId) -> Result<(), TaskError> {
        let current = self
            .current
            .and_then(|id| self.processes.get_mut(&id))
            .ok_or_else(|| TaskError::invalid("No current process"))?;
        current.cleanup.push(sem);
        Ok(())
    }

    /// Human-readable table of live processes
    pub fn dump(&self) -> String {
        let mut out = String::from("ID Name Tasks");
        let mut ids: Vec<_> = self.processes.keys().copied().collect();
        ids.sort();
        if ids.is_empty() {
            out.push_str("\nNo active processes");
            return out;
        }
        for id in ids {
            if let Some(process) = self.processes.get(&id) {
                let _ = write!(
                    out,
                    "\n{} {} {}",
                    process.id.as_u64(),
                    process.name,
                    process.tasks.len()
                );
            }
        }
        out
    }

    pub(crate) fn trace(&self, marks: &mut Marks) {
        for task in &self.queue {
            marks.task(*task);
        }
        for process in self.processes.values() {
            for task in &process.tasks {
                marks.task(*task);
            }
            for sem in &process.cleanup {
                marks.semaphore(*sem);
            }
            if let Some(outcome) = &process.outcome {
                outcome.trace(marks);
            }
        }
    }

    pub(crate) fn finished_process(&self, id: ProcessId) -> Option<&FinishedProcess> {
        self.finished.get(&id)
    }

    pub(crate) fn retain_finished(&mut self, keep: &FxHashSet<ProcessId>) {
        self.finished.retain(|id, _| keep.contains(id));
    }
}

impl RunQueue for ProcessQueue {
    fn schedule(&mut self, task: TaskId) {
        self.queue.push_back(task);
    }

    fn next_task(&mut self) -> Result<Option<TaskId>, InvariantError> {
        let Some(task) = self.queue.pop_front() else {
            return Ok(None);
        };
        let owner = self.owner.get(&task).copied();
        crate::error::invariant!(
            owner.is_some(),
            "task {} does not belong to any process",
            task.as_u64()
        );
        self.current = owner;
        Ok(Some(task))
    }

    fn task_started(&mut self, task: TaskId) {
        match self.current.and_then(|id| self.processes.get_mut(&id)) {
            Some(process) => {
                process.tasks.push(task);
                self.owner.insert(task, process.id);
            }
            None => {
                tracing::error!(task = task.as_u64(), "task started outside any process");
            }
        }
    }

    fn task_finished(&mut self, task: TaskId, outcome: &TaskOutcome, actions: &mut QueueActions) {
        let Some(pid) = self.owner.remove(&task) else {
            tracing::error!(task = task.as_u64(), "finished task owned by no process");
            return;
        };
        let Some(process) = self.processes.get_mut(&pid) else {
            tracing::error!(process = pid.as_u64(), "finished task of unknown process");
            return;
        };

        if process.tasks.first() == Some(&task) {
            process.outcome = Some(outcome.clone());
            actions
                .cancel
                .extend(process.tasks.iter().copied().filter(|t| *t != task));
            actions.destroy.extend(process.cleanup.drain(..));
        }
        process.tasks.retain(|t| *t != task);

        if process.tasks.is_empty() {
            if let Some(process) = self.processes.remove(&pid) {
                tracing::debug!(
                    process = pid.as_u64(),
                    name = %process.name,
                    "process exited"
                );
                match process.outcome {
                    Some(outcome) => {
                        self.finished.insert(
                            pid,
                            FinishedProcess {
                                name: process.name,
                                outcome,
                            },
                        );
                    }
                    None => {
                        tracing::error!(
                            process = pid.as_u64(),
                            "process exited without a primary outcome"
                        );
                    }
                }
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Type tag for [`ProcessWait`]
pub const PROCESS_WAIT_TAG: &str = "@proc.wait";

/// Built-in routine behind [`process_wait`]
///
/// Joins the process's primary task and swallows its error, so callers
/// observe completion and must check `error()` explicitly.
#[derive(Debug)]
pub struct ProcessWait {
    process: ProcessId,
    waiting: bool,
}

impl ProcessWait {
    /// Wait for the given process
    pub fn new(process: ProcessId) -> Self {
        Self {
            process,
            waiting: false,
        }
    }

    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let process = state
            .field("process")
            .and_then(Value::as_process)
            .ok_or_else(|| SerializationError::Malformed("process wait state".to_string()))?;
        let waiting = state
            .field("waiting")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self { process, waiting })
    }
}

impl Routine for ProcessWait {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        if self.waiting {
            // Completion matters, the underlying error does not.
            let _ = input.into_result();
            return Ok(Step::Done(Value::Bool(true)));
        }
        input.into_result()?;
        let primary = ctx
            .process_queue()
            .ok_or_else(|| TaskError::invalid("No process supervisor"))?
            .primary(self.process);
        match primary {
            Some(task) => {
                self.waiting = true;
                Ok(Step::Yield(Effect::Join(task)))
            }
            None => Ok(Step::Done(Value::Bool(true))),
        }
    }

    fn type_tag(&self) -> &'static str {
        PROCESS_WAIT_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([
            ("process", Value::Process(self.process)),
            ("waiting", Value::Bool(self.waiting)),
        ]))
    }
}

/// Suspend until the process's primary task is done, swallowing its error
pub fn process_wait(process: ProcessId) -> Effect {
    call_routine(Box::new(ProcessWait::new(process)))
}
