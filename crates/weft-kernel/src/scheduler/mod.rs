//! Cooperative task scheduler
//!
//! Tasks are explicit state machines driven to completion by interpreting the
//! effects they yield. One [`Scheduler::step`] drains the ready queue to
//! quiescence; suspension happens only at effect boundaries, so interleaving
//! is fully cooperative and deterministic.

mod queue;
mod runner;
mod task;

pub use queue::{FifoQueue, QueueActions, RunQueue};
pub use runner::{EffectContext, KernelEnv, Scheduler, SchedulerCore};
pub(crate) use runner::resolve_source;
pub use task::{
    GroupKey, GroupShape, RoutineSlot, SemWaitKind, Task, TaskId, TaskOutcome, TaskState,
    WaitGroup, WaitHandle, WaitMode, WaitSource,
};
