//! Bounded FIFO channel with pluggable overflow policy
//!
//! A channel is two semaphores and a buffer: `slots` starts at the capacity
//! and meters writers, `ready` starts at zero and meters readers. The
//! blocking read/write operations are built-in routines that yield semaphore
//! effects, so a task suspended mid-read persists like any other.

use crate::effect::{call_routine, Effect};
use crate::error::{SerializationError, TaskError};
use crate::routine::{Resume, Routine, Step};
use crate::scheduler::EffectContext;
use crate::sync::semaphore::SemaphoreId;
use crate::value::Value;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Unique identifier for a channel
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChannelId(u64);

impl ChannelId {
    /// The numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id from its numeric value
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

/// Errors raised by channel operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The id does not name a channel of this kernel
    #[error("Channel {0:?} not found")]
    NotFound(ChannelId),

    /// The channel has been closed
    #[error("Channel has been closed")]
    Closed,
}

impl From<ChannelError> for TaskError {
    fn from(err: ChannelError) -> Self {
        let kind = match err {
            ChannelError::Closed => crate::error::TaskErrorKind::ChannelClosed,
            ChannelError::NotFound(_) => crate::error::TaskErrorKind::Invalid,
        };
        TaskError::new(kind, err.to_string())
    }
}

/// What a write does when the buffer is full
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Block the writer until a slot frees up
    Block,
    /// Evict the oldest buffered item and accept the new one
    KeepNewest,
    /// Drop the new item silently
    KeepOldest,
}

/// A bounded FIFO channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    capacity: usize,
    policy: OverflowPolicy,
    buffer: VecDeque<Value>,
    /// Free-slot semaphore, initialized to the capacity
    slots: SemaphoreId,
    /// Readable-item semaphore, initialized to zero
    ready: SemaphoreId,
}

impl Channel {
    /// Declared capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The free-slot semaphore
    pub fn slots(&self) -> SemaphoreId {
        self.slots
    }

    /// The readable-item semaphore
    pub fn ready(&self) -> SemaphoreId {
        self.ready
    }

    /// Buffered values, oldest first
    pub fn buffered(&self) -> impl Iterator<Item = &Value> {
        self.buffer.iter()
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.buffer.push_back(value);
    }

    pub(crate) fn pop(&mut self) -> Option<Value> {
        self.buffer.pop_front()
    }

    /// Evict the oldest item, then push; buffer length is unchanged
    pub(crate) fn evict_push(&mut self, value: Value) {
        self.buffer.pop_front();
        self.buffer.push_back(value);
    }
}

/// Id-indexed arena of all channels owned by one kernel
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChannelTable {
    next_id: u64,
    entries: FxHashMap<ChannelId, Channel>,
}

impl ChannelTable {
    /// Register a channel built on the given semaphores
    pub fn create(
        &mut self,
        capacity: usize,
        policy: OverflowPolicy,
        slots: SemaphoreId,
        ready: SemaphoreId,
    ) -> ChannelId {
        while self.entries.contains_key(&ChannelId(self.next_id)) {
            self.next_id += 1;
        }
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Channel {
                capacity,
                policy,
                buffer: VecDeque::new(),
                slots,
                ready,
            },
        );
        id
    }

    /// Look up a channel
    pub fn get(&self, id: ChannelId) -> Result<&Channel, ChannelError> {
        self.entries.get(&id).ok_or(ChannelError::NotFound(id))
    }

    pub(crate) fn get_mut(&mut self, id: ChannelId) -> Result<&mut Channel, ChannelError> {
        self.entries.get_mut(&id).ok_or(ChannelError::NotFound(id))
    }

    /// Number of channels in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every channel not in the retained set
    pub(crate) fn retain(&mut self, keep: &rustc_hash::FxHashSet<ChannelId>) {
        self.entries.retain(|id, _| keep.contains(id));
    }
}

/// Create a channel; resumes with its handle
pub fn channel(capacity: usize, policy: OverflowPolicy) -> Effect {
    call_routine(Box::new(ChannelCreate { capacity, policy }))
}

/// Read the oldest item, blocking until one is buffered
pub fn read(chan: ChannelId) -> Effect {
    call_routine(Box::new(ChannelRead {
        chan,
        awaiting: false,
    }))
}

/// Write a value, applying the channel's overflow policy when full; resumes
/// with whether the value was accepted
pub fn write(chan: ChannelId, value: impl Into<Value>) -> Effect {
    call_routine(Box::new(ChannelWrite {
        chan,
        value: Some(value.into()),
        awaiting: false,
    }))
}

/// Close the channel: writes fail immediately, buffered reads still succeed
pub fn close(chan: ChannelId) -> Effect {
    call_routine(Box::new(ChannelClose { chan }))
}

/// Type tag for [`ChannelCreate`]
pub const CHANNEL_CREATE_TAG: &str = "@chan.create";
/// Type tag for [`ChannelRead`]
pub const CHANNEL_READ_TAG: &str = "@chan.read";
/// Type tag for [`ChannelWrite`]
pub const CHANNEL_WRITE_TAG: &str = "@chan.write";
/// Type tag for [`ChannelClose`]
pub const CHANNEL_CLOSE_TAG: &str = "@chan.close";

/// Built-in routine behind [`channel`]
#[derive(Debug)]
pub struct ChannelCreate {
    capacity: usize,
    policy: OverflowPolicy,
}

impl ChannelCreate {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let capacity = state
            .field("capacity")
            .and_then(Value::as_int)
            .ok_or_else(|| SerializationError::Malformed("channel create state".to_string()))?;
        let policy = match state.field("policy").and_then(Value::as_str) {
            Some("block") => OverflowPolicy::Block,
            Some("newest") => OverflowPolicy::KeepNewest,
            Some("oldest") => OverflowPolicy::KeepOldest,
            _ => {
                return Err(SerializationError::Malformed(
                    "channel create policy".to_string(),
                ))
            }
        };
        Ok(Self {
            capacity: capacity as usize,
            policy,
        })
    }
}

fn policy_name(policy: OverflowPolicy) -> &'static str {
    match policy {
        OverflowPolicy::Block => "block",
        OverflowPolicy::KeepNewest => "newest",
        OverflowPolicy::KeepOldest => "oldest",
    }
}

impl Routine for ChannelCreate {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        let chan = ctx.channel_create(self.capacity, self.policy);
        Ok(Step::Done(Value::Channel(chan)))
    }

    fn type_tag(&self) -> &'static str {
        CHANNEL_CREATE_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([
            ("capacity", Value::Int(self.capacity as i64)),
            ("policy", Value::str(policy_name(self.policy))),
        ]))
    }
}

/// Built-in routine behind [`read`]
#[derive(Debug)]
pub struct ChannelRead {
    chan: ChannelId,
    awaiting: bool,
}

impl ChannelRead {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let chan = state
            .field("chan")
            .and_then(Value::as_channel)
            .ok_or_else(|| SerializationError::Malformed("channel read state".to_string()))?;
        let awaiting = state
            .field("awaiting")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self { chan, awaiting })
    }
}

impl Routine for ChannelRead {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        if !self.awaiting {
            let ready = ctx.channel(self.chan)?.ready();
            if !ctx.sem_is_active(ready) {
                return Err(ChannelError::Closed.into());
            }
            self.awaiting = true;
            return Ok(Step::Yield(crate::effect::decrement(ready, 1)));
        }
        let value = ctx.channel_take(self.chan)?;
        Ok(Step::Done(value))
    }

    fn type_tag(&self) -> &'static str {
        CHANNEL_READ_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([
            ("chan", Value::Channel(self.chan)),
            ("awaiting", Value::Bool(self.awaiting)),
        ]))
    }
}

/// Built-in routine behind [`write`]
#[derive(Debug)]
pub struct ChannelWrite {
    chan: ChannelId,
    value: Option<Value>,
    awaiting: bool,
}

impl ChannelWrite {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let chan = state
            .field("chan")
            .and_then(Value::as_channel)
            .ok_or_else(|| SerializationError::Malformed("channel write state".to_string()))?;
        let value = state.field("value").cloned();
        let awaiting = state
            .field("awaiting")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            chan,
            value,
            awaiting,
        })
    }

    fn take_value(&mut self) -> Value {
        self.value.take().unwrap_or(Value::Null)
    }
}

impl Routine for ChannelWrite {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        if self.awaiting {
            let value = self.take_value();
            ctx.channel_store(self.chan, value)?;
            return Ok(Step::Done(Value::Bool(true)));
        }

        let (slots, policy) = {
            let chan = ctx.channel(self.chan)?;
            (chan.slots(), chan.policy())
        };
        if !ctx.sem_is_active(slots) {
            return Err(ChannelError::Closed.into());
        }

        match policy {
            OverflowPolicy::Block => {
                self.awaiting = true;
                Ok(Step::Yield(crate::effect::decrement(slots, 1)))
            }
            OverflowPolicy::KeepNewest | OverflowPolicy::KeepOldest => {
                if ctx.sem_try_decrement(slots, 1)? {
                    let value = self.take_value();
                    ctx.channel_store(self.chan, value)?;
                    return Ok(Step::Done(Value::Bool(true)));
                }
                if policy == OverflowPolicy::KeepNewest {
                    let value = self.take_value();
                    ctx.channel_evict_store(self.chan, value)?;
                }
                Ok(Step::Done(Value::Bool(false)))
            }
        }
    }

    fn type_tag(&self) -> &'static str {
        CHANNEL_WRITE_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([
            ("chan", Value::Channel(self.chan)),
            ("value", self.value.clone().unwrap_or(Value::Null)),
            ("awaiting", Value::Bool(self.awaiting)),
        ]))
    }
}

/// Built-in routine behind [`close`]
#[derive(Debug)]
pub struct ChannelClose {
    chan: ChannelId,
}

impl ChannelClose {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let chan = state
            .field("chan")
            .and_then(Value::as_channel)
            .ok_or_else(|| SerializationError::Malformed("channel close state".to_string()))?;
        Ok(Self { chan })
    }
}

impl Routine for ChannelClose {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        ctx.channel_close(self.chan)?;
        Ok(Step::Done(Value::Null))
    }

    fn type_tag(&self) -> &'static str {
        CHANNEL_CLOSE_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([("chan", Value::Channel(self.chan))]))
    }
}


#[cfg(test)]
mod scenario_tests {
    use super::*;
    use crate::effect;
    use crate::heap::Spawned;
    use crate::routine::Step;
    use crate::scheduler::{FifoQueue, Scheduler};
    use crate::test_util::{drive, step, Script, TestEnv};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn fifo() -> Scheduler<FifoQueue> {
        Scheduler::new(FifoQueue::default())
    }

    fn run_script(
        sched: &mut Scheduler<FifoQueue>,
        steps: Vec<crate::test_util::ScriptStep>,
    ) -> crate::scheduler::TaskId {
        sched.run(Spawned::Routine(Box::new(Script::new(steps))))
    }

    #[test]
    fn test_block_mode_interleaves_writer_and_reader() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let log = Rc::new(RefCell::new(Vec::<String>::new()));
        let chan_slot = Rc::new(Cell::new(None));

        let log_p = log.clone();
        let log_c1 = log.clone();
        let log_c2 = log.clone();
        let chan_in = chan_slot.clone();
        let chan_w2 = chan_slot.clone();
        run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = ctx.channel_create(1, OverflowPolicy::Block);
                    chan_in.set(Some(chan));
                    let log_first = log_c1.clone();
                    let log_second = log_c2.clone();
                    let reader = Script::new(vec![
                        step(move |_, input| {
                            input.into_result()?;
                            Ok(Step::Yield(read(chan)))
                        }),
                        step(move |_, input| {
                            let value = input.into_result()?;
                            log_first.borrow_mut().push(format!(
                                "read {}",
                                value.as_str().unwrap_or("?")
                            ));
                            Ok(Step::Yield(read(chan)))
                        }),
                        step(move |_, input| {
                            let value = input.into_result()?;
                            log_second.borrow_mut().push(format!(
                                "read {}",
                                value.as_str().unwrap_or("?")
                            ));
                            Ok(Step::Done(Value::Null))
                        }),
                    ]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(reader))))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(write(chan_w2.get().unwrap(), "one")))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(write(chan_slot.get().unwrap(), "two")))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    log_p.borrow_mut().push("finished writing".to_string());
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            *log.borrow(),
            vec!["read one", "finished writing", "read two"]
        );
    }

    #[test]
    fn test_second_write_stalls_until_a_read_drains() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let order = Rc::new(RefCell::new(Vec::<&str>::new()));

        let order_w = order.clone();
        let order_r = order.clone();
        let chan_slot = Rc::new(Cell::new(None));
        let chan_r = chan_slot.clone();
        let chan_w = chan_slot.clone();
        run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = ctx.channel_create(1, OverflowPolicy::Block);
                    chan_slot.set(Some(chan));
                    let order_done = order_r.clone();
                    let reader = Script::new(vec![
                        step(|_, input| {
                            input.into_result()?;
                            Ok(Step::Yield(effect::defer()))
                        }),
                        step(move |_, input| {
                            input.into_result()?;
                            Ok(Step::Yield(read(chan)))
                        }),
                        step(move |_, input| {
                            input.into_result()?;
                            order_done.borrow_mut().push("drained");
                            Ok(Step::Done(Value::Null))
                        }),
                    ]);
                    Ok(Step::Yield(effect::spawn_routine(Box::new(reader))))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(write(chan_r.get().unwrap(), "one")))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    // The buffer is full; this write parks until the reader
                    // frees the slot on a later tick.
                    Ok(Step::Yield(write(chan_w.get().unwrap(), "two")))
                }),
                step(move |_, input| {
                    assert_eq!(input.into_result()?, Value::Bool(true));
                    order_w.borrow_mut().push("second write landed");
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(*order.borrow(), vec!["drained", "second write landed"]);
    }

    #[test]
    fn test_keep_newest_evicts_oldest() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let result = Rc::new(RefCell::new(None));

        let result_in = result.clone();
        let chan_slot = Rc::new(Cell::new(None));
        let c1 = chan_slot.clone();
        let c2 = chan_slot.clone();
        run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = ctx.channel_create(1, OverflowPolicy::KeepNewest);
                    chan_slot.set(Some(chan));
                    Ok(Step::Yield(write(chan, "one")))
                }),
                step(move |_, input| {
                    assert_eq!(input.into_result()?, Value::Bool(true));
                    Ok(Step::Yield(write(c1.get().unwrap(), "two")))
                }),
                step(move |_, input| {
                    // The write was absorbed by evicting, not accepted.
                    assert_eq!(input.into_result()?, Value::Bool(false));
                    Ok(Step::Yield(read(c2.get().unwrap())))
                }),
                step(move |_, input| {
                    *result_in.borrow_mut() = Some(input.into_result()?);
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(*result.borrow(), Some(Value::str("two")));
    }

    #[test]
    fn test_keep_oldest_drops_new_item() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let result = Rc::new(RefCell::new(None));

        let result_in = result.clone();
        let chan_slot = Rc::new(Cell::new(None));
        let c1 = chan_slot.clone();
        let c2 = chan_slot.clone();
        run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = ctx.channel_create(1, OverflowPolicy::KeepOldest);
                    chan_slot.set(Some(chan));
                    Ok(Step::Yield(write(chan, "one")))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(write(c1.get().unwrap(), "two")))
                }),
                step(move |_, input| {
                    assert_eq!(input.into_result()?, Value::Bool(false));
                    Ok(Step::Yield(read(c2.get().unwrap())))
                }),
                step(move |_, input| {
                    *result_in.borrow_mut() = Some(input.into_result()?);
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(*result.borrow(), Some(Value::str("one")));
    }

    #[test]
    fn test_has_data_tracks_buffered_items() {
        let mut sched = fifo();
        let mut te = TestEnv::new();

        run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = ctx.channel_create(1, OverflowPolicy::Block);
                    assert!(!ctx.channel_has_data(chan));
                    assert!(ctx.channel_is_open(chan));
                    Ok(Step::Yield(write(chan, "one")))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = ChannelId::from_u64(0);
                    assert!(ctx.channel_has_data(chan));
                    Ok(Step::Done(Value::Null))
                }),
            ],
        );

        drive(&mut sched, &mut te);
    }

    #[test]
    fn test_write_after_close_fails_but_buffered_reads_drain() {
        let mut sched = fifo();
        let mut te = TestEnv::new();
        let chan_slot = Rc::new(Cell::new(None));

        let c1 = chan_slot.clone();
        let c2 = chan_slot.clone();
        let c3 = chan_slot.clone();
        let c4 = chan_slot.clone();
        let task = run_script(
            &mut sched,
            vec![
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = ctx.channel_create(2, OverflowPolicy::Block);
                    chan_slot.set(Some(chan));
                    Ok(Step::Yield(write(chan, "a")))
                }),
                step(move |_, input| {
                    input.into_result()?;
                    Ok(Step::Yield(write(c1.get().unwrap(), "b")))
                }),
                step(move |ctx, input| {
                    input.into_result()?;
                    let chan = c2.get().unwrap();
                    ctx.channel_close(chan)?;
                    assert!(!ctx.channel_is_open(chan));
                    assert!(ctx.channel_has_data(chan));
                    Ok(Step::Yield(read(chan)))
                }),
                step(move |_, input| {
                    assert_eq!(input.into_result()?, Value::str("a"));
                    Ok(Step::Yield(read(c3.get().unwrap())))
                }),
                step(move |ctx, input| {
                    assert_eq!(input.into_result()?, Value::str("b"));
                    // Fully drained: the ready side is gone too.
                    assert!(!ctx.channel_has_data(c4.get().unwrap()));
                    Ok(Step::Yield(write(c4.get().unwrap(), "c")))
                }),
                step(|_, input| match input {
                    crate::routine::Resume::Throw(err) => {
                        assert_eq!(err.message, "Channel has been closed");
                        Ok(Step::Done(Value::Bool(true)))
                    }
                    crate::routine::Resume::Next(other) => {
                        panic!("expected closed-channel error, got {other:?}")
                    }
                }),
            ],
        );

        drive(&mut sched, &mut te);
        assert_eq!(
            sched.core().outcome(task).unwrap().result(),
            Some(&Value::Bool(true))
        );
    }
}
