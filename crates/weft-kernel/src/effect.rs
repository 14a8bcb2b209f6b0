//! Effect vocabulary
//!
//! Tasks never act on the kernel directly; they yield an [`Effect`] describing
//! the requested action and the scheduler interprets it. Effects are consumed
//! at the moment they are yielded, so they carry live data (including boxed
//! routines) without any serialization obligation.

use crate::routine::Routine;
use crate::scheduler::TaskId;
use crate::sync::SemaphoreId;
use crate::value::Value;

/// A requested scheduler action, yielded by a routine
#[derive(Debug)]
pub enum Effect {
    /// Resume immediately with this value; never suspends
    Value(Value),
    /// Yield exactly one scheduling step; resumes with `true`
    Defer,
    /// Start an independent task; resumes at once with its handle
    Spawn(TaskSource),
    /// Suspend until the task is done; resumes with its result or re-raises
    /// its error
    Join(TaskId),
    /// Call a helper transparently: plain results return immediately,
    /// suspendable results become an implicit child task joined by the
    /// caller and tied to its cancellation lifetime
    Call(TaskSource),
    /// Suspend until every entry resolves, preserving the group shape;
    /// the first error cancels the remaining waits and propagates
    All(EffectGroup),
    /// Resume at the first resolution (success or error), releasing the
    /// losing entries' wait registrations
    Race(EffectGroup),
    /// A semaphore operation, interpreted by the synchronization layer
    Semaphore(SemaphoreEffect),
}

/// Shape-preserving payload of an [`Effect::All`] / [`Effect::Race`]
///
/// Entries are evaluated in declaration order for both shapes.
#[derive(Debug)]
pub enum EffectGroup {
    /// Positional entries; the result is a list of the same length
    List(Vec<Effect>),
    /// Named entries; the result is a map keyed by the same names
    Map(Vec<(String, Effect)>),
}

/// What to run when spawning or calling
#[derive(Debug)]
pub enum TaskSource {
    /// A registered program looked up by name; unknown names surface as an
    /// error inside the issuing task
    Named {
        /// Registered program name
        func: String,
        /// Arguments handed to the program constructor
        args: Vec<Value>,
    },
    /// An already-built routine
    Routine(Box<dyn Routine>),
    /// A plain value: spawn wraps it in an immediately-done task, call
    /// returns it without creating a task at all
    Value(Value),
}

/// Semaphore operations carried as effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreEffect {
    /// Create a semaphore; resumes with its handle
    Create {
        /// Initial value, must be non-negative
        initial: i64,
    },
    /// Block until `amount` can be subtracted; resumes with `true`
    Decrement {
        /// Target semaphore
        sem: SemaphoreId,
        /// Amount to subtract
        amount: i64,
    },
    /// Non-blocking decrement; resumes with whether it succeeded
    TryDecrement {
        /// Target semaphore
        sem: SemaphoreId,
        /// Amount to subtract
        amount: i64,
    },
    /// Add to the value and wake satisfiable waiters in FIFO order
    Increment {
        /// Target semaphore
        sem: SemaphoreId,
        /// Amount to add
        amount: i64,
    },
    /// Block until the value is exactly zero
    WaitForZero {
        /// Target semaphore
        sem: SemaphoreId,
    },
    /// Destroy the semaphore, failing all current and future waiters
    Destroy {
        /// Target semaphore
        sem: SemaphoreId,
    },
}

/// A plain value yield
pub fn value(v: impl Into<Value>) -> Effect {
    Effect::Value(v.into())
}

/// Yield one scheduling step
pub fn defer() -> Effect {
    Effect::Defer
}

/// Spawn a registered program as an independent task
pub fn spawn(func: impl Into<String>, args: Vec<Value>) -> Effect {
    Effect::Spawn(TaskSource::Named {
        func: func.into(),
        args,
    })
}

/// Spawn a pre-built routine as an independent task
pub fn spawn_routine(routine: Box<dyn Routine>) -> Effect {
    Effect::Spawn(TaskSource::Routine(routine))
}

/// Join a task by handle
pub fn join(task: TaskId) -> Effect {
    Effect::Join(task)
}

/// Call a registered program, transparently sync or async
pub fn call(func: impl Into<String>, args: Vec<Value>) -> Effect {
    Effect::Call(TaskSource::Named {
        func: func.into(),
        args,
    })
}

/// Call a pre-built routine as a cancellation-linked child
pub fn call_routine(routine: Box<dyn Routine>) -> Effect {
    Effect::Call(TaskSource::Routine(routine))
}

/// Wait for every positional entry
pub fn all(effects: Vec<Effect>) -> Effect {
    Effect::All(EffectGroup::List(effects))
}

/// Wait for every named entry
pub fn all_named(effects: Vec<(String, Effect)>) -> Effect {
    Effect::All(EffectGroup::Map(effects))
}

/// Wait for the first positional entry to resolve
pub fn race(effects: Vec<Effect>) -> Effect {
    Effect::Race(EffectGroup::List(effects))
}

/// Wait for the first named entry to resolve
pub fn race_named(effects: Vec<(String, Effect)>) -> Effect {
    Effect::Race(EffectGroup::Map(effects))
}

/// Create a semaphore with the given initial value
pub fn semaphore(initial: i64) -> Effect {
    Effect::Semaphore(SemaphoreEffect::Create { initial })
}

/// Blocking decrement
pub fn decrement(sem: SemaphoreId, amount: i64) -> Effect {
    Effect::Semaphore(SemaphoreEffect::Decrement { sem, amount })
}

/// Non-blocking decrement
pub fn try_decrement(sem: SemaphoreId, amount: i64) -> Effect {
    Effect::Semaphore(SemaphoreEffect::TryDecrement { sem, amount })
}

/// Increment, waking satisfiable waiters
pub fn increment(sem: SemaphoreId, amount: i64) -> Effect {
    Effect::Semaphore(SemaphoreEffect::Increment { sem, amount })
}

/// Block until the value reaches zero
pub fn wait_for_zero(sem: SemaphoreId) -> Effect {
    Effect::Semaphore(SemaphoreEffect::WaitForZero { sem })
}

/// Destroy a semaphore
pub fn destroy(sem: SemaphoreId) -> Effect {
    Effect::Semaphore(SemaphoreEffect::Destroy { sem })
}
