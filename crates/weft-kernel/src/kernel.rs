//! Kernel driver surface
//!
//! [`Kernel`] wires the scheduler, the process supervisor, the heap, and the
//! endpoint table together and exposes the whole driver contract: boot from
//! blank state or restore from a blob, advance one tick at a time, save back
//! to a blob, and query task/process handles.
//!
//! The driver contract on errors is strict: if `tick` or `save` fails the
//! in-memory state may be inconsistent and must be discarded, and a failed
//! `restore` means cold start. Nothing is ever partially applied.

use crate::conn::EndpointTable;
use crate::effect::TaskSource;
use crate::error::{KernelError, SerializationError, TaskError};
use crate::heap::{
    encode_routine, open, seal, CodecRegistry, ExternalResolver, Heap, Marks, NoopResolver,
    ProgramRegistry, RootRef, Spawned,
};
use crate::process::{ProcessId, ProcessQueue};
use crate::routine::Routine;
use crate::scheduler::{
    resolve_source, KernelEnv, RoutineSlot, Scheduler, SchedulerCore, TaskId, TaskState,
};
use crate::sync::SemaphoreId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Boot-time configuration: registered programs, routine codecs, and the
/// external resolver
pub struct KernelOptions {
    programs: ProgramRegistry,
    codecs: CodecRegistry,
    resolver: Box<dyn ExternalResolver>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelOptions {
    /// Options with the built-in codecs and no external resolver
    pub fn new() -> Self {
        Self {
            programs: ProgramRegistry::new(),
            codecs: CodecRegistry::new(),
            resolver: Box::new(NoopResolver),
        }
    }

    /// Register a named spawnable program
    pub fn register_program(
        mut self,
        name: impl Into<String>,
        constructor: impl Fn(&[Value]) -> Result<Spawned, TaskError> + 'static,
    ) -> Self {
        self.programs.register(name, constructor);
        self
    }

    /// Register a codec for a custom routine type
    pub fn register_codec(
        mut self,
        tag: impl Into<String>,
        decode: impl Fn(&Value, &CodecRegistry) -> Result<Box<dyn Routine>, SerializationError>
            + 'static,
    ) -> Self {
        self.codecs.register(tag, decode);
        self
    }

    /// Install the host's external-reference resolver
    pub fn with_resolver(mut self, resolver: Box<dyn ExternalResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

#[derive(Serialize)]
struct PersistRef<'a> {
    scheduler: &'a Scheduler<ProcessQueue>,
    endpoints: &'a EndpointTable,
    objects: &'a BTreeMap<u64, Value>,
}

#[derive(Deserialize)]
struct PersistOwned {
    scheduler: Scheduler<ProcessQueue>,
    endpoints: EndpointTable,
    objects: BTreeMap<u64, Value>,
}

/// The cooperative task kernel
#[derive(Debug)]
pub struct Kernel {
    sched: Scheduler<ProcessQueue>,
    heap: Heap,
    endpoints: EndpointTable,
    programs: ProgramRegistry,
    codecs: CodecRegistry,
}

impl Kernel {
    /// Boot with blank state
    pub fn boot(options: KernelOptions) -> Self {
        tracing::info!("kernel booting from blank state");
        let KernelOptions {
            programs,
            codecs,
            resolver,
        } = options;
        Self {
            sched: Scheduler::new(ProcessQueue::new()),
            heap: Heap::new(resolver),
            endpoints: EndpointTable::default(),
            programs,
            codecs,
        }
    }

    /// Restore from a persisted blob
    ///
    /// Any failure is fatal for the load; the caller must boot blank instead.
    pub fn restore(options: KernelOptions, blob: &[u8]) -> Result<Self, SerializationError> {
        let payload = open(blob)?;
        let state: PersistOwned = serde_json::from_slice(&payload)?;

        let KernelOptions {
            programs,
            codecs,
            resolver,
        } = options;
        let mut heap = Heap::new(resolver);
        heap.import_frozen(state.objects);
        heap.validate_tags(&codecs)?;

        tracing::info!(
            tasks = state.scheduler.core().task_count(),
            objects = heap.len(),
            "kernel restored"
        );
        Ok(Self {
            sched: state.scheduler,
            heap,
            endpoints: state.endpoints,
            programs,
            codecs,
        })
    }

    /// Start a supervised process around the given source
    pub fn start_process(
        &mut self,
        name: &str,
        source: TaskSource,
    ) -> Result<ProcessId, KernelError> {
        let spawned = resolve_source(&self.programs, source).map_err(KernelError::Start)?;
        let Scheduler { core, queue } = &mut self.sched;
        Ok(queue.start_process(core, name, spawned))
    }

    /// Advance one scheduling step; returns whether any task progressed
    pub fn tick(&mut self) -> Result<bool, KernelError> {
        let mut env = KernelEnv {
            heap: &mut self.heap,
            endpoints: &mut self.endpoints,
            programs: &self.programs,
            codecs: &self.codecs,
        };
        Ok(self.sched.step(&mut env)?)
    }

    /// Serialize the whole live execution graph into a blob
    ///
    /// Freezes every live routine, prunes everything unreachable from the
    /// kernel root, and frames the result. The kernel remains usable.
    pub fn save(&mut self) -> Result<Vec<u8>, KernelError> {
        // Freeze live routines into the heap, reusing ids across saves.
        for task in self.sched.core.tasks.values_mut() {
            if let RoutineSlot::Live { routine, frozen_id } = &mut task.slot {
                let encoded =
                    encode_routine(routine.as_ref()).map_err(KernelError::Serialization)?;
                let id = match frozen_id {
                    Some(id) => *id,
                    None => {
                        let id = self.heap.reserve_id();
                        *frozen_id = Some(id);
                        id
                    }
                };
                self.heap.store_frozen(id, encoded);
            }
        }

        // Mark everything reachable from the kernel root.
        let mut marks = Marks::default();
        for task in self.sched.core.tasks.values() {
            task.trace(&mut marks);
        }
        for task in &self.sched.core.deferred {
            marks.task(*task);
        }
        self.sched.queue.trace(&mut marks);
        self.endpoints.trace(&mut marks);

        while let Some(root) = marks.pop() {
            match root {
                RootRef::Object(id) => self.heap.trace_entry(id, &mut marks),
                RootRef::Task(id) => {
                    if let Some(outcome) = self.sched.core.outcomes.get(&id) {
                        outcome.trace(&mut marks);
                    }
                }
                RootRef::Channel(id) => {
                    if let Ok(chan) = self.sched.core.channels.get(id) {
                        marks.semaphore(chan.slots());
                        marks.semaphore(chan.ready());
                        for value in chan.buffered() {
                            value.trace(&mut marks);
                        }
                    }
                }
                RootRef::Process(id) => {
                    if let Some(finished) = self.sched.queue.finished_process(id) {
                        finished.outcome.trace(&mut marks);
                    }
                }
            }
        }

        // Sweep: drop everything the mark pass did not reach.
        self.sched
            .core
            .outcomes
            .retain(|id, _| marks.tasks.contains(id));
        self.sched.core.semaphores.retain(&marks.semaphores);
        self.sched.core.channels.retain(&marks.channels);
        self.sched.queue.retain_finished(&marks.processes);
        let objects = self.heap.sweep_export(&marks);

        let payload = serde_json::to_vec(&PersistRef {
            scheduler: &self.sched,
            endpoints: &self.endpoints,
            objects: &objects,
        })
        .map_err(SerializationError::from)?;
        let blob = seal(&payload);
        tracing::debug!(
            tasks = self.sched.core.task_count(),
            objects = objects.len(),
            bytes = blob.len(),
            "snapshot saved"
        );
        Ok(blob)
    }

    /// Whether any task is still live
    pub fn is_active(&self) -> bool {
        self.sched.is_active()
    }

    /// Ticks elapsed since boot
    pub fn ticks(&self) -> u64 {
        self.sched.core().ticks()
    }

    /// Scheduler state, for inspection
    pub fn core(&self) -> &SchedulerCore {
        self.sched.core()
    }

    /// The persistent object store
    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Throw a cancellation into a task at its next resumption
    pub fn cancel_task(&mut self, task: TaskId) -> Result<(), KernelError> {
        let mut env = KernelEnv {
            heap: &mut self.heap,
            endpoints: &mut self.endpoints,
            programs: &self.programs,
            codecs: &self.codecs,
        };
        Ok(self.sched.cancel(task, &mut env)?)
    }

    /// Whether the task has terminated
    pub fn task_finished(&self, task: TaskId) -> bool {
        self.sched.core().outcome(task).is_some()
    }

    /// Execution state of an active task
    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.sched.core().task(task).map(|t| t.state())
    }

    /// A terminated task's result
    pub fn task_result(&self, task: TaskId) -> Option<&Value> {
        self.sched.core().outcome(task).and_then(|o| o.result())
    }

    /// A terminated task's error
    pub fn task_error(&self, task: TaskId) -> Option<&TaskError> {
        self.sched.core().outcome(task).and_then(|o| o.error())
    }

    /// The completion latch of an active task
    pub fn task_completion(&self, task: TaskId) -> Option<SemaphoreId> {
        self.sched.core().task(task).map(|t| t.completion())
    }

    /// Cancel every member task of a process
    pub fn cancel_process(&mut self, process: ProcessId) -> Result<(), KernelError> {
        let members = self.sched.queue().member_tasks(process);
        for task in members {
            self.cancel_task(task)?;
        }
        Ok(())
    }

    /// Whether the process has exited
    pub fn process_finished(&self, process: ProcessId) -> bool {
        self.sched.queue().is_finished(process)
    }

    /// The process's name
    pub fn process_name(&self, process: ProcessId) -> Option<&str> {
        self.sched.queue().name(process)
    }

    /// The primary task's result
    pub fn process_result(&self, process: ProcessId) -> Option<&Value> {
        self.sched.queue().result(process)
    }

    /// The primary task's error
    pub fn process_error(&self, process: ProcessId) -> Option<&TaskError> {
        self.sched.queue().error(process)
    }

    /// The primary task of a live process
    pub fn process_primary(&self, process: ProcessId) -> Option<TaskId> {
        self.sched.queue().primary(process)
    }

    /// Human-readable table of live processes
    pub fn process_list(&self) -> String {
        self.sched.queue().dump()
    }
}
