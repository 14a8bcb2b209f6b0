//! Scheduler core: step loop and effect interpretation
//!
//! [`SchedulerCore`] owns the task table, the synchronization arenas, and the
//! deferred list; the run queue is pluggable behind [`RunQueue`]. All state
//! mutation happens inside [`EffectContext`], the explicit context threaded
//! through every effect handler and routine resume; there is no ambient
//! "current scheduler" anywhere.
//!
//! Internal invariant violations do not panic and are never confined to a
//! task: they latch on the context and abort the step, leaving the driver to
//! discard the state.

use crate::conn::EndpointTable;
use crate::effect::{Effect, EffectGroup, SemaphoreEffect, TaskSource};
use crate::error::{InvariantError, TaskError};
use crate::heap::{CodecRegistry, Heap, ObjectId, ProgramRegistry, Spawned};
use crate::process::{ProcessId, ProcessQueue};
use crate::routine::{GroupCarrier, Immediate, Resume, Routine, Step};
use crate::scheduler::queue::{QueueActions, RunQueue};
use crate::scheduler::task::{
    GroupKey, GroupShape, RoutineSlot, SemWaitKind, Task, TaskId, TaskOutcome, TaskState,
    WaitGroup, WaitHandle, WaitMode, WaitSource,
};
use crate::sync::{
    Channel, ChannelId, ChannelTable, OverflowPolicy, SemaphoreError, SemaphoreId, SemaphoreTable,
};
use crate::value::Value;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Scheduler state minus the run queue
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SchedulerCore {
    next_task_id: u64,
    /// Active tasks
    pub(crate) tasks: FxHashMap<TaskId, Task>,
    /// Outcomes of terminated tasks, pruned by reachability at save
    pub(crate) outcomes: FxHashMap<TaskId, TaskOutcome>,
    /// Tasks to resume at the next tick boundary
    pub(crate) deferred: Vec<TaskId>,
    /// All semaphores owned by this scheduler
    pub(crate) semaphores: SemaphoreTable,
    /// All channels owned by this scheduler
    pub(crate) channels: ChannelTable,
    ticks: u64,
}

impl SchedulerCore {
    /// Look up an active task
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Look up a terminated task's outcome
    pub fn outcome(&self, id: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.get(&id)
    }

    /// Whether any task is still live
    pub fn is_active(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Number of active tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Ticks elapsed since boot
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The semaphore arena
    pub fn semaphores(&self) -> &SemaphoreTable {
        &self.semaphores
    }

    /// The channel arena
    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub(crate) fn create_task(&mut self, spawned: Spawned) -> TaskId {
        while self.tasks.contains_key(&TaskId::from_u64(self.next_task_id))
            || self.outcomes.contains_key(&TaskId::from_u64(self.next_task_id))
        {
            self.next_task_id += 1;
        }
        let id = TaskId::from_u64(self.next_task_id);
        self.next_task_id += 1;

        let routine: Box<dyn Routine> = match spawned {
            Spawned::Routine(routine) => routine,
            Spawned::Value(value) => Box::new(Immediate::new(value)),
        };
        let completion = self.semaphores.create(1);
        self.tasks.insert(
            id,
            Task {
                id,
                state: TaskState::Running,
                slot: RoutineSlot::Live {
                    routine,
                    frozen_id: None,
                },
                pending: Some(Resume::start()),
                wait: None,
                joiners: Vec::new(),
                linked: Vec::new(),
                completion,
                scheduled: true,
            },
        );
        tracing::trace!(task = id.as_u64(), "task created");
        id
    }
}

/// Task scheduler parameterized over its run queue
#[derive(Debug, Serialize, Deserialize)]
pub struct Scheduler<Q> {
    pub(crate) core: SchedulerCore,
    pub(crate) queue: Q,
}

/// Kernel services the scheduler borrows for the duration of a step
pub struct KernelEnv<'a> {
    /// Persistent object store
    pub heap: &'a mut Heap,
    /// Connection endpoint table
    pub endpoints: &'a mut EndpointTable,
    /// Registered spawnable programs
    pub programs: &'a ProgramRegistry,
    /// Registered routine codecs
    pub codecs: &'a CodecRegistry,
}

impl<Q: RunQueue + 'static> Scheduler<Q> {
    /// Create a scheduler with the given run queue
    pub fn new(queue: Q) -> Self {
        Self {
            core: SchedulerCore::default(),
            queue,
        }
    }

    /// Scheduler state
    pub fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// The run queue
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// The run queue, mutably
    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    /// Whether any task is still live
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Start a new top-level task
    pub fn run(&mut self, spawned: Spawned) -> TaskId {
        let id = self.core.create_task(spawned);
        self.queue.schedule(id);
        self.queue.task_started(id);
        id
    }

    /// Advance one tick: resume deferred tasks once, then drain the ready
    /// queue to quiescence. Returns whether any task progressed.
    pub fn step(&mut self, env: &mut KernelEnv<'_>) -> Result<bool, InvariantError> {
        self.core.ticks += 1;
        let mut ctx = EffectContext::new(&mut self.core, &mut self.queue, env);

        let woken = std::mem::take(&mut ctx.core.deferred);
        let mut progressed = !woken.is_empty();
        for task in woken {
            ctx.notify_wait(task, &WaitSource::Defer, Ok(Value::Bool(true)));
        }

        loop {
            if ctx.fatal.is_some() {
                break;
            }
            let Some(task) = ctx.queue.next_task()? else {
                break;
            };
            progressed |= ctx.step_task(task);
        }

        match ctx.fatal.take() {
            Some(err) => Err(err),
            None => Ok(progressed),
        }
    }

    /// Throw a cancellation error into a task at its next resumption,
    /// cascading into its Call-linked children
    pub fn cancel(&mut self, task: TaskId, env: &mut KernelEnv<'_>) -> Result<(), InvariantError> {
        let mut ctx = EffectContext::new(&mut self.core, &mut self.queue, env);
        ctx.cancel_task(task);
        match ctx.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Result of applying a single (non-group) effect
pub(crate) enum Applied {
    /// Resolved synchronously with a value
    Value(Value),
    /// Failed synchronously
    Error(TaskError),
    /// The issuing task must suspend on this source
    Wait {
        /// Registered wait source
        source: WaitSource,
        /// Whether abandoning the wait must cancel the task behind it
        cancel_on_abandon: bool,
    },
}

/// Resolve a spawn/call target to something runnable
pub(crate) fn resolve_source(
    programs: &ProgramRegistry,
    source: TaskSource,
) -> Result<Spawned, TaskError> {
    match source {
        TaskSource::Named { func, args } => programs.spawn(&func, &args),
        TaskSource::Routine(routine) => Ok(Spawned::Routine(routine)),
        TaskSource::Value(value) => Ok(Spawned::Value(value)),
    }
}

/// Explicit execution context threaded through every effect handler
///
/// Borrows the scheduler's tables, the run queue, and the kernel services for
/// the duration of one step. Routines receive it on every resume; all
/// synchronous kernel operations go through it.
pub struct EffectContext<'a> {
    pub(crate) core: &'a mut SchedulerCore,
    pub(crate) queue: &'a mut dyn RunQueue,
    pub(crate) heap: &'a mut Heap,
    pub(crate) endpoints: &'a mut EndpointTable,
    pub(crate) programs: &'a ProgramRegistry,
    pub(crate) codecs: &'a CodecRegistry,
    current: TaskId,
    fatal: Option<InvariantError>,
}

impl<'a> EffectContext<'a> {
    pub(crate) fn new(
        core: &'a mut SchedulerCore,
        queue: &'a mut (impl RunQueue + 'static),
        env: &'a mut KernelEnv<'_>,
    ) -> Self {
        Self {
            core,
            queue,
            heap: &mut *env.heap,
            endpoints: &mut *env.endpoints,
            programs: env.programs,
            codecs: env.codecs,
            current: TaskId::from_u64(0),
            fatal: None,
        }
    }

    /// The task currently being resumed
    pub fn current_task(&self) -> TaskId {
        self.current
    }

    /// Ticks elapsed since boot
    pub fn tick(&self) -> u64 {
        self.core.ticks
    }

    /// The persistent object store
    pub fn heap(&mut self) -> &mut Heap {
        self.heap
    }

    fn invariant_failure(&mut self, message: String) {
        tracing::error!(%message, "kernel invariant violated");
        if self.fatal.is_none() {
            self.fatal = Some(InvariantError::new(message));
        }
    }

    // ------------------------------------------------------------------
    // Task stepping
    // ------------------------------------------------------------------

    pub(crate) fn run_spawned(&mut self, spawned: Spawned) -> TaskId {
        let id = self.core.create_task(spawned);
        self.queue.schedule(id);
        self.queue.task_started(id);
        id
    }

    /// Resume one popped task with its pending input and act on the result
    pub(crate) fn step_task(&mut self, tid: TaskId) -> bool {
        let (input, slot) = {
            let Some(task) = self.core.tasks.get_mut(&tid) else {
                return false;
            };
            task.scheduled = false;
            if task.state != TaskState::Running {
                return false;
            }
            let Some(input) = task.pending.take() else {
                return false;
            };
            (input, std::mem::replace(&mut task.slot, RoutineSlot::Vacant))
        };

        let (mut routine, frozen_id) = match slot {
            RoutineSlot::Live { routine, frozen_id } => (routine, frozen_id),
            RoutineSlot::Frozen(id) => match self.thaw_routine(id) {
                Ok(routine) => (routine, Some(id)),
                Err(err) => {
                    self.finish_task(tid, TaskOutcome::Failure(err));
                    return true;
                }
            },
            RoutineSlot::Vacant => {
                self.invariant_failure(format!("task {} has no routine", tid.as_u64()));
                return false;
            }
        };

        self.current = tid;
        let result = routine.resume(self, input);

        match result {
            Err(err) => self.finish_task(tid, TaskOutcome::Failure(err)),
            Ok(Step::Done(value)) => self.finish_task(tid, TaskOutcome::Success(value)),
            Ok(Step::Yield(effect)) => {
                let canceled_mid_resume = match self.core.tasks.get_mut(&tid) {
                    Some(task) => {
                        task.slot = RoutineSlot::Live { routine, frozen_id };
                        task.pending.is_some()
                    }
                    None => {
                        self.invariant_failure(format!(
                            "task {} vanished during resume",
                            tid.as_u64()
                        ));
                        return true;
                    }
                };
                // A cancellation landed while the routine ran: drop the
                // yielded effect, the queued throw takes precedence.
                if !canceled_mid_resume {
                    self.apply_effect(tid, effect);
                }
            }
        }
        true
    }

    fn thaw_routine(&mut self, id: ObjectId) -> Result<Box<dyn Routine>, TaskError> {
        let encoded = match self.heap.frozen_entry(id) {
            Some(value) => value.clone(),
            None => {
                return Err(TaskError::new(
                    crate::error::TaskErrorKind::Serialization,
                    format!("frozen routine {} is missing from the heap", id.as_u64()),
                ))
            }
        };
        self.codecs.decode_routine(&encoded).map_err(|err| {
            TaskError::new(crate::error::TaskErrorKind::Serialization, err.to_string())
        })
    }

    /// Queue a resume input for a task, scheduling it if necessary
    pub(crate) fn resume_task(&mut self, tid: TaskId, input: Resume) {
        let Some(task) = self.core.tasks.get_mut(&tid) else {
            self.invariant_failure(format!("resumed unknown task {}", tid.as_u64()));
            return;
        };
        task.pending = Some(input);
        task.state = TaskState::Running;
        if !task.scheduled {
            task.scheduled = true;
            self.queue.schedule(tid);
        }
    }

    /// Terminate a task, release its latch, notify joiners, cascade into
    /// linked children, and let the run queue react
    pub(crate) fn finish_task(&mut self, tid: TaskId, outcome: TaskOutcome) {
        let Some(mut task) = self.core.tasks.remove(&tid) else {
            self.invariant_failure(format!("finished unknown task {}", tid.as_u64()));
            return;
        };
        task.state = TaskState::Done;
        match &outcome {
            TaskOutcome::Success(_) => {
                tracing::trace!(task = tid.as_u64(), "task completed");
            }
            TaskOutcome::Failure(err) if err.is_cancellation() => {
                tracing::debug!(task = tid.as_u64(), "task canceled");
            }
            TaskOutcome::Failure(err) => {
                tracing::warn!(task = tid.as_u64(), error = %err, "task failed");
            }
        }

        if let Some(wait) = task.wait.take() {
            for handle in &wait.handles {
                if handle.resolved.is_none() {
                    if let Some(source) = &handle.source {
                        let source = source.clone();
                        self.deregister(tid, &source, handle.cancel_on_abandon);
                    }
                }
            }
        }

        self.core.outcomes.insert(tid, outcome.clone());
        self.latch_force_zero(task.completion);

        for joiner in std::mem::take(&mut task.joiners) {
            self.notify_wait(joiner, &WaitSource::Task(tid), outcome.to_result());
        }
        for child in std::mem::take(&mut task.linked) {
            self.cancel_task(child);
        }

        let mut actions = QueueActions::default();
        self.queue.task_finished(tid, &outcome, &mut actions);
        for task in actions.cancel {
            self.cancel_task(task);
        }
        for sem in actions.destroy {
            let _ = self.sem_destroy(sem);
        }
    }

    /// Cancel a task: deregister its waits, queue a cancellation throw for
    /// its next resumption, and cascade into Call-linked children
    pub(crate) fn cancel_task(&mut self, tid: TaskId) {
        let (wait, linked) = {
            let Some(task) = self.core.tasks.get_mut(&tid) else {
                return;
            };
            (task.wait.take(), std::mem::take(&mut task.linked))
        };
        if let Some(wait) = wait {
            for handle in wait.handles {
                if handle.resolved.is_none() {
                    if let Some(source) = handle.source {
                        self.deregister(tid, &source, handle.cancel_on_abandon);
                    }
                }
            }
        }
        self.resume_task(tid, Resume::Throw(TaskError::canceled()));
        for child in linked {
            self.cancel_task(child);
        }
    }

    // ------------------------------------------------------------------
    // Effect application
    // ------------------------------------------------------------------

    pub(crate) fn apply_effect(&mut self, tid: TaskId, effect: Effect) {
        match effect {
            Effect::All(group) => self.apply_group(tid, group, false),
            Effect::Race(group) => self.apply_group(tid, group, true),
            other => match self.apply_simple(tid, other) {
                Applied::Value(value) => self.resume_task(tid, Resume::Next(value)),
                Applied::Error(err) => self.resume_task(tid, Resume::Throw(err)),
                Applied::Wait {
                    source,
                    cancel_on_abandon,
                } => self.install_wait(
                    tid,
                    WaitGroup {
                        mode: WaitMode::Single,
                        handles: vec![WaitHandle {
                            key: GroupKey::Index(0),
                            source: Some(source),
                            resolved: None,
                            cancel_on_abandon,
                        }],
                    },
                ),
            },
        }
    }

    fn install_wait(&mut self, tid: TaskId, wait: WaitGroup) {
        let Some(task) = self.core.tasks.get_mut(&tid) else {
            self.invariant_failure(format!("suspended unknown task {}", tid.as_u64()));
            return;
        };
        task.wait = Some(wait);
        task.state = TaskState::Waiting;
    }

    /// Apply any effect except a top-level group; nested groups run as an
    /// implicit cancellation-linked child task
    fn apply_simple(&mut self, tid: TaskId, effect: Effect) -> Applied {
        match effect {
            Effect::Value(value) => Applied::Value(value),
            Effect::Defer => {
                self.core.deferred.push(tid);
                Applied::Wait {
                    source: WaitSource::Defer,
                    cancel_on_abandon: false,
                }
            }
            Effect::Spawn(source) => match resolve_source(self.programs, source) {
                Ok(spawned) => {
                    let child = self.run_spawned(spawned);
                    Applied::Value(Value::Task(child))
                }
                Err(err) => Applied::Error(err),
            },
            Effect::Join(target) => self.apply_join(tid, target, false),
            Effect::Call(source) => match resolve_source(self.programs, source) {
                Ok(Spawned::Value(value)) => Applied::Value(value),
                Ok(Spawned::Routine(routine)) => self.apply_linked_child(tid, routine),
                Err(err) => Applied::Error(err),
            },
            Effect::Semaphore(op) => self.apply_semaphore(tid, op),
            nested @ (Effect::All(_) | Effect::Race(_)) => {
                self.apply_linked_child(tid, Box::new(GroupCarrier::new(nested)))
            }
        }
    }

    fn apply_linked_child(&mut self, tid: TaskId, routine: Box<dyn Routine>) -> Applied {
        let child = self.run_spawned(Spawned::Routine(routine));
        if let Some(task) = self.core.tasks.get_mut(&tid) {
            task.linked.push(child);
        }
        self.apply_join(tid, child, true)
    }

    fn apply_join(&mut self, tid: TaskId, target: TaskId, cancel_on_abandon: bool) -> Applied {
        if let Some(task) = self.core.tasks.get_mut(&target) {
            task.joiners.push(tid);
            return Applied::Wait {
                source: WaitSource::Task(target),
                cancel_on_abandon,
            };
        }
        match self.core.outcomes.get(&target) {
            Some(TaskOutcome::Success(value)) => Applied::Value(value.clone()),
            Some(TaskOutcome::Failure(err)) => Applied::Error(err.clone()),
            None => Applied::Error(TaskError::invalid(
                "Join target is not a task of this kernel",
            )),
        }
    }

    fn apply_semaphore(&mut self, tid: TaskId, op: SemaphoreEffect) -> Applied {
        match op {
            SemaphoreEffect::Create { initial } => {
                if initial < 0 {
                    return Applied::Error(SemaphoreError::InvalidAmount(initial).into());
                }
                Applied::Value(Value::Semaphore(self.core.semaphores.create(initial)))
            }
            SemaphoreEffect::Decrement { sem, amount } => {
                if let Err(err) = crate::sync::semaphore::check_amount(amount) {
                    return Applied::Error(err.into());
                }
                let acquired = match self.core.semaphores.get_active_mut(sem) {
                    Err(err) => return Applied::Error(err.into()),
                    Ok(entry) => {
                        if entry.value() >= amount {
                            entry.subtract(amount);
                            true
                        } else {
                            entry.push_waiter(tid, amount);
                            false
                        }
                    }
                };
                if acquired {
                    self.sem_wake_zero(sem);
                    Applied::Value(Value::Bool(true))
                } else {
                    Applied::Wait {
                        source: WaitSource::Semaphore {
                            sem,
                            kind: SemWaitKind::Decrement(amount),
                        },
                        cancel_on_abandon: false,
                    }
                }
            }
            SemaphoreEffect::TryDecrement { sem, amount } => {
                match self.sem_try_decrement(sem, amount) {
                    Ok(ok) => Applied::Value(Value::Bool(ok)),
                    Err(err) => Applied::Error(err),
                }
            }
            SemaphoreEffect::Increment { sem, amount } => {
                match self.sem_increment(sem, amount) {
                    Ok(()) => Applied::Value(Value::Null),
                    Err(err) => Applied::Error(err),
                }
            }
            SemaphoreEffect::WaitForZero { sem } => {
                match self.core.semaphores.get_active_mut(sem) {
                    Err(err) => Applied::Error(err.into()),
                    Ok(entry) => {
                        if entry.value() == 0 {
                            Applied::Value(Value::Null)
                        } else {
                            entry.push_zero_waiter(tid);
                            Applied::Wait {
                                source: WaitSource::Semaphore {
                                    sem,
                                    kind: SemWaitKind::Zero,
                                },
                                cancel_on_abandon: false,
                            }
                        }
                    }
                }
            }
            SemaphoreEffect::Destroy { sem } => match self.sem_destroy(sem) {
                Ok(()) => Applied::Value(Value::Null),
                Err(err) => Applied::Error(err),
            },
        }
    }

    fn apply_group(&mut self, tid: TaskId, group: EffectGroup, race: bool) {
        let (shape, entries): (GroupShape, Vec<(GroupKey, Effect)>) = match group {
            EffectGroup::List(items) => (
                GroupShape::List(items.len()),
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, e)| (GroupKey::Index(i), e))
                    .collect(),
            ),
            EffectGroup::Map(items) => (
                GroupShape::Map,
                items
                    .into_iter()
                    .map(|(k, e)| (GroupKey::Name(k), e))
                    .collect(),
            ),
        };

        let mut handles: Vec<WaitHandle> = Vec::with_capacity(entries.len());
        for (key, effect) in entries {
            match self.apply_simple(tid, effect) {
                Applied::Value(value) => {
                    if race {
                        // First resolution wins; entries after it are never
                        // evaluated and earlier registrations are released.
                        self.rollback_handles(tid, &handles);
                        let shaped = assemble_winner(&shape, &key, value);
                        self.resume_task(tid, Resume::Next(shaped));
                        return;
                    }
                    handles.push(WaitHandle {
                        key,
                        source: None,
                        resolved: Some(value),
                        cancel_on_abandon: false,
                    });
                }
                Applied::Error(err) => {
                    self.rollback_handles(tid, &handles);
                    self.resume_task(tid, Resume::Throw(err));
                    return;
                }
                Applied::Wait {
                    source,
                    cancel_on_abandon,
                } => handles.push(WaitHandle {
                    key,
                    source: Some(source),
                    resolved: None,
                    cancel_on_abandon,
                }),
            }
        }

        if handles.iter().all(|h| h.resolved.is_some()) {
            let result = assemble_all(&shape, &handles);
            self.resume_task(tid, Resume::Next(result));
        } else {
            let mode = if race {
                WaitMode::Race(shape)
            } else {
                WaitMode::All(shape)
            };
            self.install_wait(tid, WaitGroup { mode, handles });
        }
    }

    fn rollback_handles(&mut self, tid: TaskId, handles: &[WaitHandle]) {
        for handle in handles {
            if handle.resolved.is_none() {
                if let Some(source) = &handle.source {
                    let source = source.clone();
                    self.deregister(tid, &source, handle.cancel_on_abandon);
                }
            }
        }
    }

    fn deregister(&mut self, tid: TaskId, source: &WaitSource, cancel_abandoned: bool) {
        match source {
            WaitSource::Task(target) => {
                if let Some(task) = self.core.tasks.get_mut(target) {
                    if let Some(pos) = task.joiners.iter().position(|j| *j == tid) {
                        task.joiners.remove(pos);
                    }
                }
                if cancel_abandoned {
                    self.cancel_task(*target);
                }
            }
            WaitSource::Semaphore { sem, kind } => {
                if let Ok(entry) = self.core.semaphores.get_mut(*sem) {
                    match kind {
                        SemWaitKind::Decrement(_) => entry.remove_waiter(tid),
                        SemWaitKind::Zero => entry.remove_zero_waiter(tid),
                    }
                }
            }
            WaitSource::Defer => {
                if let Some(pos) = self.core.deferred.iter().position(|t| *t == tid) {
                    self.core.deferred.remove(pos);
                }
            }
        }
    }

    /// Resolve one wait entry of a suspended task
    ///
    /// Batch wake-ups (destroy, zero-wake) drain their wait lists before
    /// notifying, so a task resolved by an earlier entry of the same batch
    /// may be woken again; such stale wake-ups are ignored.
    pub(crate) fn notify_wait(
        &mut self,
        tid: TaskId,
        probe: &WaitSource,
        result: Result<Value, TaskError>,
    ) {
        let mut wait = {
            let Some(task) = self.core.tasks.get_mut(&tid) else {
                tracing::debug!(task = tid.as_u64(), "stale wake-up for a finished task");
                return;
            };
            if task.state != TaskState::Waiting {
                tracing::debug!(task = tid.as_u64(), "stale wake-up for a running task");
                return;
            }
            match task.wait.take() {
                Some(wait) => wait,
                None => {
                    self.invariant_failure(format!(
                        "task {} is waiting without wait descriptors",
                        tid.as_u64()
                    ));
                    return;
                }
            }
        };

        let Some(idx) = wait.handles.iter().position(|h| {
            h.resolved.is_none() && h.source.as_ref().map(|s| s.matches(probe)).unwrap_or(false)
        }) else {
            tracing::debug!(task = tid.as_u64(), "stale wake-up with no matching descriptor");
            if let Some(task) = self.core.tasks.get_mut(&tid) {
                task.wait = Some(wait);
            }
            return;
        };

        let mode = wait.mode.clone();
        match (mode, result) {
            (WaitMode::Single, result) => {
                let input = match result {
                    Ok(value) => Resume::Next(value),
                    Err(err) => Resume::Throw(err),
                };
                self.resume_task(tid, input);
            }
            (WaitMode::All(shape), Ok(value)) => {
                wait.handles[idx].resolved = Some(value);
                if wait.handles.iter().all(|h| h.resolved.is_some()) {
                    let result = assemble_all(&shape, &wait.handles);
                    self.resume_task(tid, Resume::Next(result));
                } else if let Some(task) = self.core.tasks.get_mut(&tid) {
                    task.wait = Some(wait);
                }
            }
            (WaitMode::All(_), Err(err)) => {
                wait.handles[idx].source = None;
                self.release_pending(tid, &wait);
                self.resume_task(tid, Resume::Throw(err));
            }
            (WaitMode::Race(shape), result) => {
                let winner = wait.handles[idx].key.clone();
                wait.handles[idx].source = None;
                self.release_pending(tid, &wait);
                match result {
                    Ok(value) => {
                        let shaped = assemble_winner(&shape, &winner, value);
                        self.resume_task(tid, Resume::Next(shaped));
                    }
                    Err(err) => self.resume_task(tid, Resume::Throw(err)),
                }
            }
        }
    }

    fn release_pending(&mut self, tid: TaskId, wait: &WaitGroup) {
        for handle in &wait.handles {
            if handle.resolved.is_none() {
                if let Some(source) = &handle.source {
                    let source = source.clone();
                    self.deregister(tid, &source, handle.cancel_on_abandon);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Semaphore operations
    // ------------------------------------------------------------------

    /// Create a semaphore
    pub fn sem_create(&mut self, initial: i64) -> Result<SemaphoreId, TaskError> {
        if initial < 0 {
            return Err(SemaphoreError::InvalidAmount(initial).into());
        }
        Ok(self.core.semaphores.create(initial))
    }

    /// Current value of an active semaphore
    pub fn sem_value(&self, sem: SemaphoreId) -> Result<i64, TaskError> {
        Ok(self.core.semaphores.get_active(sem)?.value())
    }

    /// Whether the id names an active semaphore
    pub fn sem_is_active(&self, sem: SemaphoreId) -> bool {
        self.core.semaphores.is_active(sem)
    }

    /// Non-blocking decrement
    pub fn sem_try_decrement(&mut self, sem: SemaphoreId, amount: i64) -> Result<bool, TaskError> {
        crate::sync::semaphore::check_amount(amount)?;
        let acquired = {
            let entry = self.core.semaphores.get_active_mut(sem)?;
            if entry.value() >= amount {
                entry.subtract(amount);
                true
            } else {
                false
            }
        };
        if acquired {
            self.sem_wake_zero(sem);
        }
        Ok(acquired)
    }

    /// Increment, waking FIFO decrement waiters whose amounts are satisfiable
    pub fn sem_increment(&mut self, sem: SemaphoreId, amount: i64) -> Result<(), TaskError> {
        crate::sync::semaphore::check_amount(amount)?;
        self.core.semaphores.get_active_mut(sem)?.add(amount);
        self.wake_semaphore(sem);
        Ok(())
    }

    /// Destroy a semaphore, failing all current waiters; idempotent
    pub fn sem_destroy(&mut self, sem: SemaphoreId) -> Result<(), TaskError> {
        let (waiters, zero_waiters) = {
            let entry = match self.core.semaphores.get_mut(sem) {
                Ok(entry) => entry,
                Err(err) => return Err(err.into()),
            };
            if !entry.is_active() {
                return Ok(());
            }
            entry.deactivate();
            (entry.drain_waiters(), entry.drain_zero_waiters())
        };
        for (task, _) in waiters {
            self.notify_wait(
                task,
                &WaitSource::Semaphore {
                    sem,
                    kind: SemWaitKind::Decrement(0),
                },
                Err(SemaphoreError::Destroyed.into()),
            );
        }
        for task in zero_waiters {
            self.notify_wait(
                task,
                &WaitSource::Semaphore {
                    sem,
                    kind: SemWaitKind::Zero,
                },
                Err(SemaphoreError::Destroyed.into()),
            );
        }
        Ok(())
    }

    /// Register a semaphore for destruction when the current process exits
    pub fn sem_destroy_on_exit(&mut self, sem: SemaphoreId) -> Result<(), TaskError> {
        self.process_queue()
            .ok_or_else(|| TaskError::invalid("No process supervisor"))?
            .destroy_on_exit(sem)
    }

    /// The completion latch of an active task
    pub fn task_completion(&self, task: TaskId) -> Option<SemaphoreId> {
        self.core.tasks.get(&task).map(|t| t.completion)
    }

    fn wake_semaphore(&mut self, sem: SemaphoreId) {
        loop {
            let woken = match self.core.semaphores.get_mut(sem) {
                Ok(entry) => match entry.pop_satisfiable() {
                    Some((task, amount)) => {
                        entry.subtract(amount);
                        Some(task)
                    }
                    None => None,
                },
                Err(_) => None,
            };
            let Some(task) = woken else { break };
            self.notify_wait(
                task,
                &WaitSource::Semaphore {
                    sem,
                    kind: SemWaitKind::Decrement(0),
                },
                Ok(Value::Bool(true)),
            );
            self.sem_wake_zero(sem);
        }
    }

    /// Wake all zero-waiters as one unordered batch if the value is zero
    fn sem_wake_zero(&mut self, sem: SemaphoreId) {
        let waiters = match self.core.semaphores.get_mut(sem) {
            Ok(entry) if entry.is_active() && entry.value() == 0 => entry.drain_zero_waiters(),
            _ => return,
        };
        for task in waiters {
            self.notify_wait(
                task,
                &WaitSource::Semaphore {
                    sem,
                    kind: SemWaitKind::Zero,
                },
                Ok(Value::Null),
            );
        }
    }

    /// Drive a completion latch to zero
    fn latch_force_zero(&mut self, sem: SemaphoreId) {
        if let Ok(entry) = self.core.semaphores.get_mut(sem) {
            if entry.is_active() && entry.value() != 0 {
                entry.force_zero();
            }
        }
        self.sem_wake_zero(sem);
    }

    // ------------------------------------------------------------------
    // Channel operations
    // ------------------------------------------------------------------

    /// Create a channel with its two semaphores
    pub fn channel_create(&mut self, capacity: usize, policy: OverflowPolicy) -> ChannelId {
        let slots = self.core.semaphores.create(capacity as i64);
        let ready = self.core.semaphores.create(0);
        self.core.channels.create(capacity, policy, slots, ready)
    }

    /// Look up a channel
    pub fn channel(&self, chan: ChannelId) -> Result<&Channel, TaskError> {
        self.core.channels.get(chan).map_err(Into::into)
    }

    /// Whether the channel still accepts writes
    pub fn channel_is_open(&self, chan: ChannelId) -> bool {
        self.core
            .channels
            .get(chan)
            .map(|c| self.core.semaphores.is_active(c.slots()))
            .unwrap_or(false)
    }

    /// Whether a read would find a buffered item
    pub fn channel_has_data(&self, chan: ChannelId) -> bool {
        self.core
            .channels
            .get(chan)
            .ok()
            .and_then(|c| self.core.semaphores.get(c.ready()).ok())
            .map(|ready| ready.is_active() && ready.value() > 0)
            .unwrap_or(false)
    }

    /// Buffer a value and signal readers
    pub fn channel_store(&mut self, chan: ChannelId, value: Value) -> Result<(), TaskError> {
        let ready = {
            let entry = self.core.channels.get_mut(chan)?;
            entry.push(value);
            entry.ready()
        };
        self.sem_increment(ready, 1)
    }

    /// Replace the oldest buffered value without touching the semaphores
    pub fn channel_evict_store(&mut self, chan: ChannelId, value: Value) -> Result<(), TaskError> {
        self.core.channels.get_mut(chan)?.evict_push(value);
        Ok(())
    }

    /// Pop the oldest buffered value, releasing a writer slot or completing
    /// the drain of a closed channel
    pub fn channel_take(&mut self, chan: ChannelId) -> Result<Value, TaskError> {
        let (value, slots, ready) = {
            let entry = self.core.channels.get_mut(chan)?;
            let value = entry
                .pop()
                .ok_or_else(|| TaskError::invalid("Channel buffer is empty"))?;
            (value, entry.slots(), entry.ready())
        };
        if self.core.semaphores.is_active(slots) {
            self.sem_increment(slots, 1)?;
        } else if !self.channel_has_data(chan) {
            self.sem_destroy(ready)?;
        }
        Ok(value)
    }

    /// Register a channel for closure when the current process exits
    pub fn channel_close_on_exit(&mut self, chan: ChannelId) -> Result<(), TaskError> {
        let slots = self.channel(chan)?.slots();
        self.sem_destroy_on_exit(slots)
    }

    /// Close a channel: fail writers now, let buffered reads drain
    pub fn channel_close(&mut self, chan: ChannelId) -> Result<(), TaskError> {
        let (slots, ready) = {
            let entry = self.core.channels.get(chan)?;
            (entry.slots(), entry.ready())
        };
        self.sem_destroy(slots)?;
        if !self.channel_has_data(chan) {
            self.sem_destroy(ready)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Process operations
    // ------------------------------------------------------------------

    pub(crate) fn process_queue(&mut self) -> Option<&mut ProcessQueue> {
        self.queue.as_any_mut().downcast_mut::<ProcessQueue>()
    }

    /// The process owning the task being resumed, when supervision is active
    pub fn current_process(&mut self) -> Option<ProcessId> {
        self.process_queue().and_then(|q| q.current_process())
    }

    /// Start a supervised process
    pub fn start_process(&mut self, name: &str, source: TaskSource) -> Result<ProcessId, TaskError> {
        let spawned = resolve_source(self.programs, source)?;
        let core = &mut *self.core;
        let queue = self
            .queue
            .as_any_mut()
            .downcast_mut::<ProcessQueue>()
            .ok_or_else(|| TaskError::invalid("No process supervisor"))?;
        Ok(queue.start_process(core, name, spawned))
    }

    /// Whether the process has exited
    pub fn process_finished(&mut self, process: ProcessId) -> bool {
        self.process_queue()
            .map(|q| q.is_finished(process))
            .unwrap_or(true)
    }

    /// A process's name, live or finished
    pub fn process_name(&mut self, process: ProcessId) -> Option<String> {
        self.process_queue()
            .and_then(|q| q.name(process).map(str::to_string))
    }

    /// The primary task's result of a process
    pub fn process_result(&mut self, process: ProcessId) -> Option<Value> {
        self.process_queue()
            .and_then(|q| q.result(process).cloned())
    }

    /// The primary task's error of a process
    pub fn process_error(&mut self, process: ProcessId) -> Option<TaskError> {
        self.process_queue().and_then(|q| q.error(process).cloned())
    }

    /// Cancel every member task of a process
    pub fn cancel_process(&mut self, process: ProcessId) -> Result<(), TaskError> {
        let members = self
            .process_queue()
            .ok_or_else(|| TaskError::invalid("No process supervisor"))?
            .member_tasks(process);
        for task in members {
            self.cancel_task(task);
        }
        Ok(())
    }

    pub(crate) fn endpoint_table(&mut self) -> &mut EndpointTable {
        self.endpoints
    }
}

fn assemble_all(shape: &GroupShape, handles: &[WaitHandle]) -> Value {
    match shape {
        GroupShape::List(len) => {
            let mut out = vec![Value::Null; *len];
            for handle in handles {
                if let (GroupKey::Index(i), Some(value)) = (&handle.key, &handle.resolved) {
                    out[*i] = value.clone();
                }
            }
            Value::List(out)
        }
        GroupShape::Map => Value::Map(
            handles
                .iter()
                .filter_map(|h| match (&h.key, &h.resolved) {
                    (GroupKey::Name(name), Some(value)) => Some((name.clone(), value.clone())),
                    _ => None,
                })
                .collect(),
        ),
    }
}

fn assemble_winner(shape: &GroupShape, key: &GroupKey, value: Value) -> Value {
    match shape {
        GroupShape::List(len) => {
            let mut out = vec![Value::Null; *len];
            if let GroupKey::Index(i) = key {
                out[*i] = value;
            }
            Value::List(out)
        }
        GroupShape::Map => match key {
            GroupKey::Name(name) => Value::Map([(name.clone(), value)].into_iter().collect()),
            GroupKey::Index(_) => Value::Map(std::collections::BTreeMap::new()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect;
    use crate::scheduler::FifoQueue;
    use crate::test_util::{drive, step, Script, TestEnv};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn fifo() -> Scheduler<FifoQueue> {
        Scheduler::new(FifoQueue::default())
    }

    fn run_script(sched: &mut Scheduler<FifoQueue>, steps: Vec<crate::test_util::ScriptStep>) -> TaskId {
        sched.run(Spawned::Routine(Box::new(Script::new(steps))))
    }

    #[test]
    fn test_no_effect_task_joinable_within_one_step() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let seen = Rc::new(RefCell::new(None));

        let seen_in = seen.clone();
        run_script(
            &mut sched,
            vec![
                step(|_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(Effect::Spawn(TaskSource::Value(Value::Int(5)))))
                }),
                step(|_, input| {
                    let handle = input.into_result()?;
                    let child = handle.as_task().expect("spawn resumes with a handle");
                    Ok(Step::Yield(effect::join(child)))
                }),
                step(move |_, input| {
                    *seen_in.borrow_mut() = Some(input.into_result()?);
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        let mut env = te.env();
        let progressed = sched.step(&mut env).unwrap();
        assert!(progressed);
        // The child completed and the join resolved within the same step.
        assert!(!sched.is_active());
        assert_eq!(*seen.borrow(), Some(Value::Int(5)));
    }

    #[test]
    fn test_defer_pauses_exactly_one_tick() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let ticks = Rc::new(RefCell::new(Vec::new()));

        let t1 = ticks.clone();
        let t2 = ticks.clone();
        let t3 = ticks.clone();
        run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    t1.borrow_mut().push(ctx.tick());
                    Ok(Step::Yield(effect::defer()))
                }),
                step(move |ctx, input| {
                    assert_eq!(input.into_result()?, Value::Bool(true));
                    t2.borrow_mut().push(ctx.tick());
                    // Plain value yields do not cross a tick boundary.
                    Ok(Step::Yield(effect::value(1)))
                }),
                step(move |ctx, input| {
                    assert_eq!(input.into_result()?, Value::Int(1));
                    t3.borrow_mut().push(ctx.tick());
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(*ticks.borrow(), vec![1, 2, 2]);
    }

    #[test]
    fn test_plain_value_yields_resume_immediately() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let map = Value::map([("foo", Value::str("bar"))]);
        let map_in = map.clone();
        run_script(
            &mut sched,
            vec![
                step(|_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::value(Value::Null)))
                }),
                step(|_, input| {
                    assert_eq!(input.into_result()?, Value::Null);
                    Ok(Step::Yield(effect::value(1)))
                }),
                step(move |_, input| {
                    assert_eq!(input.into_result()?, Value::Int(1));
                    Ok(Step::Yield(effect::value(map_in.clone())))
                }),
                step(move |_, input| {
                    assert_eq!(input.into_result()?, map);
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        let mut env = te.env();
        sched.step(&mut env).unwrap();
        assert!(!sched.is_active());
    }

    #[test]
    fn test_call_of_plain_program_behaves_synchronously() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        te.programs.register("identity", |args: &[Value]| {
            Ok(Spawned::Value(args.first().cloned().unwrap_or(Value::Null)))
        });
        let log = Rc::new(RefCell::new(Vec::new()));

        let log_in = log.clone();
        run_script(
            &mut sched,
            vec![
                step(|_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::call(
                        "identity",
                        vec![Value::str("sync identity")],
                    )))
                }),
                step(move |_, input| {
                    log_in.borrow_mut().push(input.into_result()?);
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(*log.borrow(), vec![Value::str("sync identity")]);
    }

    #[test]
    fn test_unknown_program_surfaces_inside_task() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let task = run_script(
            &mut sched,
            vec![step(|_, input| {
                input.into_result()?;
                Ok(Step::Yield(effect::call("nope", vec![])))
            })],
        );

        drive(&mut sched, &mut te);
        let err = sched.core().outcome(task).unwrap().error().unwrap().clone();
        assert!(err.message.contains("Unknown program"));
    }

    #[test]
    fn test_spawn_join_async_result() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let lock = sched.core.semaphores.create(0);

        let task = run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    let child = Script::new(vec![
                        step(move |_, input| {
                            input.into_result()?;
                            Ok(Step::Yield(effect::decrement(lock, 1)))
                        }),
                        step(|_, input| {
                            input.into_result()?;
                            Ok(Step::Done(Value::str("async result")))
                        }),
                    ]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(child))))
                }),
                step(move |ctx, input| {
                    let child = input.into_result()?.as_task().unwrap();
                    ctx.sem_increment(lock, 1)?;
                    Ok(Step::Yield(effect::join(child)))
                }),
                step(|_, input| {
                    assert_eq!(input.into_result()?, Value::str("async result"));
                    Ok(Step::Done(Value::Bool(true)))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_join_reraises_child_error() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let task = run_script(
            &mut sched,
            vec![
                step(|_, input| {
                    input.into_result()?;
                    let child = Script::new(vec![step(|_, input| {
                        input.into_result()?;
                        Err(TaskError::user("async error"))
                    })]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(child))))
                }),
                step(|_, input| {
                    let child = input.into_result()?.as_task().unwrap();
                    Ok(Step::Yield(effect::join(child)))
                }),
                step(|_, input| match input {
                    Resume::Throw(err) => {
                        assert_eq!(err.message, "async error");
                        Ok(Step::Done(Value::str("caught")))
                    }
                    Resume::Next(other) => panic!("expected an error, got {other:?}"),
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::str("caught"))
        );
    }

    #[test]
    fn test_join_of_finished_task_resolves_without_suspending() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let child_slot = Rc::new(Cell::new(None));
        let slot_in = child_slot.clone();
        run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(Effect::Spawn(TaskSource::Value(Value::Int(3)))))
                }),
                step(move |_, input| {
                    slot_in.set(input.into_result()?.as_task());
                    // Let the child finish first.
                    Ok(Step::Yield(effect::defer()))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::join(child_slot.get().unwrap())))
                }),
                step(|_, input| {
                    assert_eq!(input.into_result()?, Value::Int(3));
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
    }

    #[test]
    fn test_join_foreign_handle_is_an_error() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let task = run_script(
            &mut sched,
            vec![step(|_, input| {
                input.into_result()?;
                Ok(Step::Yield(effect::join(TaskId::from_u64(999))))
            })],
        );

        drive(&mut sched, &mut te);
        let err = sched.core().outcome(task).unwrap().error().unwrap().clone();
        assert!(err.message.contains("not a task of this kernel"));
    }

    #[test]
    fn test_cancel_removes_semaphore_waiter_and_notifies_joiner() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let lock = sched.core.semaphores.create(0);
        let child_slot = Rc::new(Cell::new(None));

        let slot_a = child_slot.clone();
        let slot_b = child_slot.clone();
        let task = run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    // Child signals readiness, then calls a helper that
                    // blocks forever on the lock.
                    let child = Script::new(vec![step(move |ctx, input| {
                        input.into_result()?;
                        ctx.sem_increment(lock, 1)?;
                        let inner = Script::new(vec![step(move |_, input| {
                            input.into_result()?;
                            Ok(Step::Yield(effect::decrement(lock, 1)))
                        })]);
                        Ok(Step::Yield(effect::call_routine(Box::new(inner))))
                    })]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(child))))
                }),
                step(move |_, input| {
                    slot_a.set(input.into_result()?.as_task());
                    Ok(Step::Yield(effect::decrement(lock, 1)))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    let child = slot_b.get().unwrap();
                    ctx.cancel_task(child);
                    ctx.sem_increment(lock, 1)?;
                    Ok(Step::Yield(effect::join(child)))
                }),
                step(move |ctx, input| match input {
                    Resume::Throw(err) => {
                        assert!(err.is_cancellation());
                        assert_eq!(err.message, "Task has been canceled");
                        // The canceled decrement left the wait list, so the
                        // increment was never consumed.
                        assert_eq!(ctx.sem_value(lock)?, 1);
                        assert_eq!(
                            ctx.core.semaphores.get(lock).unwrap().waiting_count(),
                            0
                        );
                        Ok(Step::Done(Value::Bool(true)))
                    }
                    Resume::Next(other) => panic!("expected cancellation, got {other:?}"),
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_all_of_synchronous_effects_never_suspends() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(2);

        run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::all_named(vec![
                        ("a".to_string(), effect::try_decrement(sem, 1)),
                        ("b".to_string(), effect::try_decrement(sem, 1)),
                    ])))
                }),
                step(|_, input| {
                    let result = input.into_result()?;
                    assert_eq!(
                        result,
                        Value::map([("a", Value::Bool(true)), ("b", Value::Bool(true))])
                    );
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        let mut env = te.env();
        sched.step(&mut env).unwrap();
        assert!(!sched.is_active());
    }

    #[test]
    fn test_all_list_with_delayed_entries() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem_a = sched.core.semaphores.create(0);
        let sem_b = sched.core.semaphores.create(0);

        let task = run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    let feeder = Script::new(vec![
                        step(move |ctx, input| {
                            input.into_result()?;
                            ctx.sem_increment(sem_a, 1)?;
                            Ok(Step::Yield(effect::defer()))
                        }),
                        step(move |ctx, input| {
                            input.into_result()?;
                            ctx.sem_increment(sem_b, 1)?;
                            Ok(Step::Done(Value::Null))
                        }),
                    ]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(feeder))))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::all(vec![
                        effect::decrement(sem_a, 1),
                        effect::decrement(sem_b, 1),
                    ])))
                }),
                step(|_, input| {
                    assert_eq!(
                        input.into_result()?,
                        Value::List(vec![Value::Bool(true), Value::Bool(true)])
                    );
                    Ok(Step::Done(Value::Bool(true)))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_all_propagates_first_error_and_releases_waits() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(0);
        let doomed = sched.core.semaphores.create(0);

        let task = run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    let killer = Script::new(vec![step(move |ctx, input| {
                        input.into_result()?;
                        ctx.sem_destroy(doomed)?;
                        Ok(Step::Done(Value::Null))
                    })]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(killer))))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::all(vec![
                        effect::decrement(sem, 1),
                        effect::decrement(doomed, 1),
                    ])))
                }),
                step(move |ctx, input| match input {
                    Resume::Throw(err) => {
                        assert_eq!(err.message, "Semaphore has been destroyed");
                        // The surviving entry's registration was released.
                        assert_eq!(ctx.core.semaphores.get(sem).unwrap().waiting_count(), 0);
                        Ok(Step::Done(Value::Bool(true)))
                    }
                    Resume::Next(other) => panic!("expected an error, got {other:?}"),
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_race_stops_at_first_synchronous_winner() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem_a = sched.core.semaphores.create(1);
        let sem_b = sched.core.semaphores.create(1);

        run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::race(vec![
                        effect::decrement(sem_a, 1),
                        effect::decrement(sem_b, 1),
                    ])))
                }),
                step(move |ctx, input| {
                    // Only the winner slot is filled; the loser was never
                    // evaluated, so its semaphore still holds its unit.
                    assert_eq!(
                        input.into_result()?,
                        Value::List(vec![Value::Bool(true), Value::Null])
                    );
                    assert_eq!(ctx.sem_value(sem_b)?, 1);
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
    }

    #[test]
    fn test_race_delayed_winner_releases_loser_registration() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem_a = sched.core.semaphores.create(0);
        let sem_b = sched.core.semaphores.create(0);

        let task = run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    let feeder = Script::new(vec![step(move |ctx, input| {
                        input.into_result()?;
                        ctx.sem_increment(sem_b, 1)?;
                        Ok(Step::Done(Value::Null))
                    })]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(feeder))))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::race_named(vec![
                        ("a".to_string(), effect::decrement(sem_a, 1)),
                        ("b".to_string(), effect::decrement(sem_b, 1)),
                    ])))
                }),
                step(move |ctx, input| {
                    assert_eq!(
                        input.into_result()?,
                        Value::map([("b", Value::Bool(true))])
                    );
                    assert_eq!(ctx.core.semaphores.get(sem_a).unwrap().waiting_count(), 0);
                    Ok(Step::Done(Value::Bool(true)))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_nested_groups_resolve_recursively() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let task = run_script(
            &mut sched,
            vec![
                step(|_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::all_named(vec![
                        (
                            "foo".to_string(),
                            effect::race(vec![
                                effect::value("one"),
                                effect::value("two"),
                            ]),
                        ),
                        (
                            "bar".to_string(),
                            effect::all(vec![
                                effect::value("three"),
                                effect::value("four"),
                            ]),
                        ),
                        (
                            "baz".to_string(),
                            effect::all(vec![
                                effect::value("five"),
                                effect::value("six"),
                            ]),
                        ),
                    ])))
                }),
                step(|_, input| {
                    let result = input.into_result()?;
                    assert_eq!(
                        result,
                        Value::map([
                            (
                                "foo",
                                Value::List(vec![Value::str("one"), Value::Null])
                            ),
                            (
                                "bar",
                                Value::List(vec![Value::str("three"), Value::str("four")])
                            ),
                            (
                                "baz",
                                Value::List(vec![Value::str("five"), Value::str("six")])
                            ),
                        ])
                    );
                    Ok(Step::Done(Value::Bool(true)))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_decrement_waiters_release_in_fifo_order_with_amounts() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        for (name, amount) in [("first", 2), ("second", 1), ("third", 1)] {
            let log = log.clone();
            run_script(
                &mut sched,
                vec![
                    step(move |_, input| {
                        input.into_result()?;
                        Ok(Step::Yield(effect::decrement(sem, amount)))
                    }),
                    step(move |_, input| {
                        input.into_result()?;
                        log.borrow_mut().push(name);
                        Ok(Step::Done(Value::Null))
                    }),
                ],
            );
        }

        // A feeder drips one unit per tick; the front waiter needs two, so
        // the first unit satisfies nobody even though later waiters could
        // take it.
        run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    ctx.sem_increment(sem, 1)?;
                    Ok(Step::Yield(effect::defer()))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    ctx.sem_increment(sem, 1)?;
                    Ok(Step::Yield(effect::defer()))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    ctx.sem_increment(sem, 2)?;
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_wait_for_zero_wakes_all_at_once() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(1);
        let log = Rc::new(RefCell::new(Vec::new()));

        for _ in 0..2 {
            let log = log.clone();
            run_script(
                &mut sched,
                vec![
                    step(move |_, input| {
                        input.into_result()?;
                        Ok(Step::Yield(effect::wait_for_zero(sem)))
                    }),
                    step(move |_, input| {
                        input.into_result()?;
                        log.borrow_mut().push("got zero");
                        Ok(Step::Done(Value::Null))
                    }),
                ],
            );
        }

        run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::defer()))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::decrement(sem, 1)))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    // Value is already zero: waiting resolves immediately.
                    Ok(Step::Yield(effect::wait_for_zero(sem)))
                }),
                step(|_, input| {
                    input.into_result()?;
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(*log.borrow(), vec!["got zero", "got zero"]);
    }

    #[test]
    fn test_destroy_fails_current_and_future_waiters() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(0);

        let waiter = run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::decrement(sem, 1)))
                }),
                step(|_, input| match input {
                    Resume::Throw(err) => {
                        assert_eq!(err.message, "Semaphore has been destroyed");
                        Ok(Step::Done(Value::str("failed as expected")))
                    }
                    Resume::Next(other) => panic!("expected destruction, got {other:?}"),
                }),
            ],
        );

        let late = run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    ctx.sem_destroy(sem)?;
                    // Destroying twice stays quiet.
                    ctx.sem_destroy(sem)?;
                    Ok(Step::Yield(effect::decrement(sem, 1)))
                }),
                step(|_, input| match input {
                    Resume::Throw(err) => {
                        assert_eq!(err.kind, crate::error::TaskErrorKind::SemaphoreDestroyed);
                        Ok(Step::Done(Value::str("failed as expected")))
                    }
                    Resume::Next(other) => panic!("expected destruction, got {other:?}"),
                }),
            ],
        );

        drive(&mut sched, &mut te);
        for task in [waiter, late] {
            assert_eq!(
                sched.core().outcome(task).unwrap().result(),
                Some(&Value::str("failed as expected"))
            );
        }
    }

    #[test]
    fn test_one_push_per_increment_across_ticks() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        // Task A: wait(S); push(i); i += 1, three rounds.
        let mut steps = Vec::new();
        for i in 0..3i64 {
            let log = log.clone();
            steps.push(step(move |_, input: Resume| {
                input.into_result()?;
                Ok(Step::Yield(effect::decrement(sem, 1)))
            }));
            steps.push(step(move |ctx: &mut EffectContext<'_>, input: Resume| {
                input.into_result()?;
                log.borrow_mut().push((ctx.tick(), i));
                Ok(Step::Yield(effect::value(Value::Null)))
            }));
        }
        steps.push(step(|_, input: Resume| {
            input.into_result()?;
            Ok(Step::Done(Value::Null))
        }));
        run_script(&mut sched, steps);

        // Controller: one increment per tick, three ticks.
        let mut feeder = Vec::new();
        for _ in 0..3 {
            feeder.push(step(move |ctx: &mut EffectContext<'_>, input: Resume| {
                input.into_result()?;
                ctx.sem_increment(sem, 1)?;
                Ok(Step::Yield(effect::defer()))
            }));
        }
        feeder.push(step(|_, input: Resume| {
            input.into_result()?;
            Ok(Step::Done(Value::Null))
        }));
        run_script(&mut sched, feeder);

        drive(&mut sched, &mut te);
        let log = log.borrow();
        let pushes: Vec<i64> = log.iter().map(|(_, i)| *i).collect();
        assert_eq!(pushes, vec![0, 1, 2]);
        // Exactly one push per tick boundary.
        let ticks: Vec<u64> = log.iter().map(|(t, _)| *t).collect();
        assert_eq!(ticks, vec![ticks[0], ticks[0] + 1, ticks[0] + 2]);
    }

    #[test]
    fn test_failing_task_does_not_disturb_others() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let failing = run_script(
            &mut sched,
            vec![step(|_, input| {
                input.into_result()?;
                Err(TaskError::user("boom"))
            })],
        );
        let healthy = run_script(
            &mut sched,
            vec![
                step(|_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::defer()))
                }),
                step(|_, input| {
                    input.into_result()?;
                    Ok(Step::Done(Value::str("fine")))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(failing).unwrap().error().unwrap().message,
            "boom"
        );
        assert_eq!(
            sched.core().outcome(healthy).unwrap().result(),
            Some(&Value::str("fine"))
        );
    }

    #[test]
    fn test_completion_latch_reaches_zero() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        let task = sched.run(Spawned::Value(Value::Int(1)));
        let latch = sched.core().task(task).unwrap().completion();
        assert_eq!(sched.core().semaphores().get(latch).unwrap().value(), 1);

        drive(&mut sched, &mut te);
        assert_eq!(sched.core().semaphores().get(latch).unwrap().value(), 0);
    }

    #[test]
    fn test_semaphore_supports_exactly_n_unit_decrements() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(2);

        run_script(
            &mut sched,
            vec![
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(effect::decrement(sem, 1)))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    assert_eq!(ctx.sem_value(sem)?, 1);
                    Ok(Step::Yield(effect::decrement(sem, 1)))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    assert_eq!(ctx.sem_value(sem)?, 0);
                    // The third decrement has nothing left to take.
                    Ok(Step::Yield(effect::decrement(sem, 1)))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    assert_eq!(ctx.sem_value(sem)?, 0);
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        let mut env = te.env();
        sched.step(&mut env).unwrap();
        // Two units were granted synchronously; the third blocked.
        assert!(sched.is_active());
        assert_eq!(sched.core().semaphores().get(sem).unwrap().waiting_count(), 1);

        run_script(
            &mut sched,
            vec![step(move |ctx, input| {
                input.into_result()?;
                ctx.sem_increment(sem, 1)?;
                Ok(Step::Done(Value::Null))
            })],
        );
        drive(&mut sched, &mut te);
    }

    #[test]
    fn test_negative_amount_is_a_task_error() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let sem = sched.core.semaphores.create(1);

        let task = run_script(
            &mut sched,
            vec![step(move |_, input| {
                input.into_result()?;
                Ok(Step::Yield(effect::decrement(sem, -2)))
            })],
        );

        drive(&mut sched, &mut te);
        let err = sched.core().outcome(task).unwrap().error().unwrap().clone();
        assert!(err.message.contains("Invalid semaphore amount"));
    }
}
