//! Weft: a persistable cooperative task kernel
//!
//! Weft runs many concurrent units of work as suspendable routines on a
//! single-threaded cooperative scheduler, built for hosts that grant a tiny
//! CPU budget per invocation and discard all memory in between. The entire
//! live execution graph (suspended routines, pending waits, semaphores,
//! channels, processes, and arbitrary referenced data including cycles)
//! serializes into one size-bounded blob and restores exactly.
//!
//! - **Effects** (`effect`): tasks yield structured requests instead of
//!   acting; the scheduler interprets them.
//! - **Scheduler** (`scheduler`): the per-tick step loop, wait bookkeeping,
//!   and cancellation.
//! - **Synchronization** (`sync`): counting semaphores and bounded channels
//!   with pluggable overflow policies.
//! - **Processes** (`process`): named task groups with cascading
//!   cancellation, implemented as a pluggable run queue.
//! - **Heap** (`heap`): the frozen/live object store with lazy rehydration
//!   and reachability-based collection.
//! - **Kernel** (`kernel`): the driver surface: boot, restore, tick, save.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_kernel::{Kernel, KernelOptions, TaskSource};
//!
//! let mut kernel = match persisted {
//!     Some(blob) => Kernel::restore(options(), &blob)?,
//!     None => {
//!         let mut kernel = Kernel::boot(options());
//!         kernel.start_process("main", TaskSource::Named {
//!             func: "main".into(),
//!             args: vec![],
//!         })?;
//!         kernel
//!     }
//! };
//! kernel.tick()?;
//! host.write_blob(kernel.save()?);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod conn;
pub mod effect;
pub mod error;
pub mod heap;
pub mod kernel;
pub mod process;
pub mod routine;
pub mod scheduler;
pub mod sync;
pub mod value;

#[cfg(test)]
pub(crate) mod test_util;

pub use effect::{Effect, EffectGroup, SemaphoreEffect, TaskSource};
pub use error::{
    InvariantError, KernelError, SerializationError, TaskError, TaskErrorKind,
};
pub use heap::{
    CodecRegistry, ExternalResolver, Heap, NoopResolver, ObjectId, ProgramRegistry, Spawned,
};
pub use kernel::{Kernel, KernelOptions};
pub use process::{ProcessId, ProcessQueue};
pub use routine::{Resume, Routine, Step};
pub use scheduler::{
    EffectContext, FifoQueue, KernelEnv, RunQueue, Scheduler, SchedulerCore, TaskId, TaskOutcome,
    TaskState,
};
pub use sync::{Channel, ChannelId, OverflowPolicy, Semaphore, SemaphoreId};
pub use value::Value;
