//! Task records and wait bookkeeping

use crate::error::TaskError;
use crate::heap::{Marks, ObjectId};
use crate::routine::{Resume, Routine};
use crate::sync::SemaphoreId;
use crate::value::Value;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique identifier for a task, monotonic per scheduler instance
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(u64);

impl TaskId {
    /// The numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id from its numeric value
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

/// Execution state of a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Ready to resume (has, or is about to get, a pending input)
    Running,
    /// Suspended on one or more wait sources
    Waiting,
    /// Terminated; the record is about to leave the active table
    Done,
}

/// How a task terminated
///
/// Explicitly two-state: a successful `Null` or `false` result is a result,
/// never mistaken for "still pending".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// Completed with a result value
    Success(Value),
    /// Completed with an error
    Failure(TaskError),
}

impl TaskOutcome {
    /// The result value, if the task succeeded
    pub fn result(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Success(v) => Some(v),
            TaskOutcome::Failure(_) => None,
        }
    }

    /// The error, if the task failed
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Success(_) => None,
            TaskOutcome::Failure(e) => Some(e),
        }
    }

    /// View the outcome as a join result
    pub fn to_result(&self) -> Result<Value, TaskError> {
        match self {
            TaskOutcome::Success(v) => Ok(v.clone()),
            TaskOutcome::Failure(e) => Err(e.clone()),
        }
    }

    pub(crate) fn trace(&self, marks: &mut Marks) {
        match self {
            TaskOutcome::Success(v) => v.trace(marks),
            TaskOutcome::Failure(e) => trace_error(e, marks),
        }
    }
}

pub(crate) fn trace_error(err: &TaskError, marks: &mut Marks) {
    for value in err.fields.values() {
        value.trace(marks);
    }
}

/// What a suspended task is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitSource {
    /// Joined on another task
    Task(TaskId),
    /// Parked on a semaphore wait list
    Semaphore {
        /// The semaphore
        sem: SemaphoreId,
        /// Which of its wait lists
        kind: SemWaitKind,
    },
    /// Parked until the next tick boundary
    Defer,
}

/// Which semaphore wait list a task is parked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SemWaitKind {
    /// Queued for a decrement of the given amount
    Decrement(i64),
    /// Waiting for the value to reach zero
    Zero,
}

impl WaitSource {
    /// Whether a wake-up probe addresses this source (amounts are ignored;
    /// the wait lists themselves are authoritative for ordering)
    pub(crate) fn matches(&self, probe: &WaitSource) -> bool {
        match (self, probe) {
            (WaitSource::Task(a), WaitSource::Task(b)) => a == b,
            (
                WaitSource::Semaphore { sem: a, kind: ka },
                WaitSource::Semaphore { sem: b, kind: kb },
            ) => {
                a == b
                    && matches!(
                        (ka, kb),
                        (SemWaitKind::Decrement(_), SemWaitKind::Decrement(_))
                            | (SemWaitKind::Zero, SemWaitKind::Zero)
                    )
            }
            (WaitSource::Defer, WaitSource::Defer) => true,
            _ => false,
        }
    }

    pub(crate) fn trace(&self, marks: &mut Marks) {
        match self {
            WaitSource::Task(id) => marks.task(*id),
            WaitSource::Semaphore { sem, .. } => marks.semaphore(*sem),
            WaitSource::Defer => {}
        }
    }
}

/// Position of a group entry in its declared shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKey {
    /// List entry
    Index(usize),
    /// Map entry
    Name(String),
}

/// Declared shape of an All/Race group, preserved into the result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupShape {
    /// A list of the given length
    List(usize),
    /// A name-keyed map
    Map,
}

/// What kind of wait a suspended task holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitMode {
    /// A single wait source
    Single,
    /// Resolve when every entry has resolved
    All(GroupShape),
    /// Resolve at the first entry to resolve
    Race(GroupShape),
}

/// One entry of a task's wait group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitHandle {
    /// Where the entry sits in the group shape
    pub key: GroupKey,
    /// The registered wait source; `None` for entries that resolved at
    /// application time and never registered anywhere
    pub source: Option<WaitSource>,
    /// The resolved value, once this entry has resolved
    pub resolved: Option<Value>,
    /// Whether abandoning this entry must cancel the task behind it
    /// (implicit children created for Call and nested groups)
    pub cancel_on_abandon: bool,
}

impl WaitHandle {
    pub(crate) fn trace(&self, marks: &mut Marks) {
        if let Some(source) = &self.source {
            source.trace(marks);
        }
        if let Some(value) = &self.resolved {
            value.trace(marks);
        }
    }
}

/// A task's active wait descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitGroup {
    /// Resolution rule
    pub mode: WaitMode,
    /// Entries in declaration order
    pub handles: Vec<WaitHandle>,
}

/// The suspendable computation owned by a task
///
/// `Live` holds the routine in memory; `Frozen` holds the heap id of its
/// encoded state, rehydrated through the codec registry on the task's next
/// resume. Serialization requires the routine to have been frozen first, so
/// only an id ever reaches the persisted form.
#[derive(Debug)]
pub enum RoutineSlot {
    /// In-memory routine, with the heap id reused across saves once frozen
    Live {
        /// The routine itself
        routine: Box<dyn Routine>,
        /// Stable heap id assigned at the first freeze
        frozen_id: Option<ObjectId>,
    },
    /// Encoded state awaiting rehydration
    Frozen(ObjectId),
    /// Taken out for the duration of a resume
    Vacant,
}

impl RoutineSlot {
    /// The heap id backing this slot, if one has been assigned
    pub fn frozen_id(&self) -> Option<ObjectId> {
        match self {
            RoutineSlot::Live { frozen_id, .. } => *frozen_id,
            RoutineSlot::Frozen(id) => Some(*id),
            RoutineSlot::Vacant => None,
        }
    }
}

impl Serialize for RoutineSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.frozen_id() {
            Some(id) => id.serialize(serializer),
            None => Err(serde::ser::Error::custom(
                "routine was not frozen before serialization",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for RoutineSlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(RoutineSlot::Frozen(ObjectId::deserialize(deserializer)?))
    }
}

/// One schedulable unit of work
#[derive(Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique id
    pub(crate) id: TaskId,
    /// Execution state
    pub(crate) state: TaskState,
    /// The suspendable computation
    pub(crate) slot: RoutineSlot,
    /// Input for the next resume, if one is queued
    pub(crate) pending: Option<Resume>,
    /// Active wait descriptors while `state` is `Waiting`
    pub(crate) wait: Option<WaitGroup>,
    /// Tasks currently joined on this one
    pub(crate) joiners: Vec<TaskId>,
    /// Implicit children tied to this task's cancellation lifetime
    pub(crate) linked: Vec<TaskId>,
    /// Completion latch: value 1 while live, driven to 0 at termination
    pub(crate) completion: SemaphoreId,
    /// Whether an entry for this task currently sits in the run queue
    pub(crate) scheduled: bool,
}

impl Task {
    /// Unique id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Execution state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The completion-latch semaphore (1 while live, 0 once done)
    pub fn completion(&self) -> SemaphoreId {
        self.completion
    }

    pub(crate) fn trace(&self, marks: &mut Marks) {
        marks.task(self.id);
        marks.semaphore(self.completion);
        if let Some(id) = self.slot.frozen_id() {
            marks.object(id);
        }
        match &self.pending {
            Some(Resume::Next(v)) => v.trace(marks),
            Some(Resume::Throw(e)) => trace_error(e, marks),
            None => {}
        }
        if let Some(wait) = &self.wait {
            for handle in &wait.handles {
                handle.trace(marks);
            }
        }
        for id in &self.joiners {
            marks.task(*id);
        }
        for id in &self.linked {
            marks.task(*id);
        }
    }
}
