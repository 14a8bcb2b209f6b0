//! Suspendable computations
//!
//! A [`Routine`] is an explicit resumable state machine: each `resume` either
//! yields the next [`Effect`] or completes with a value. Resume is always
//! synchronous; suspension exists only between resumes, which is what makes
//! the whole execution graph serializable.
//!
//! Routines persist through the codec registry: `save_state` encodes the
//! machine's state as a [`Value`] and a registered decode function rebuilds
//! it. Routines that drive nested routines encode them with
//! [`crate::heap::encode_routine`] and decode them back through the registry,
//! so delegation chains survive a snapshot.

use crate::effect::Effect;
use crate::error::{SerializationError, TaskError};
use crate::scheduler::EffectContext;
use crate::value::Value;

/// Input handed to a routine on resume
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Resume {
    /// Resume normally with a value
    Next(Value),
    /// Throw an error into the routine at its suspension point
    Throw(TaskError),
}

impl Resume {
    /// The input used for a routine's very first resume
    pub fn start() -> Self {
        Resume::Next(Value::Null)
    }

    /// Unwrap the value, propagating a thrown error
    ///
    /// This is the default "don't catch" behavior: a routine that calls
    /// `input.into_result()?` re-raises whatever was thrown into it.
    pub fn into_result(self) -> Result<Value, TaskError> {
        match self {
            Resume::Next(value) => Ok(value),
            Resume::Throw(err) => Err(err),
        }
    }
}

/// Outcome of one resume
#[derive(Debug)]
pub enum Step {
    /// The routine suspended on an effect
    Yield(Effect),
    /// The routine completed with a value
    Done(Value),
}

/// A suspendable computation driven by the scheduler
pub trait Routine: std::fmt::Debug {
    /// Advance the routine with the given input until it yields or completes
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError>;

    /// Type tag naming this routine's registered codec
    fn type_tag(&self) -> &'static str;

    /// Encode the machine state for persistence
    fn save_state(&self) -> Result<Value, SerializationError>;
}

/// Wraps a plain value in an immediately-done routine
///
/// Spawning a non-suspendable result still produces a real task, so handles,
/// joining, and process accounting behave uniformly.
#[derive(Debug)]
pub struct Immediate {
    value: Option<Value>,
}

/// Type tag for [`Immediate`]
pub const IMMEDIATE_TAG: &str = "@immediate";

impl Immediate {
    /// Wrap a value
    pub fn new(value: Value) -> Self {
        Self { value: Some(value) }
    }

    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        Ok(Self {
            value: Some(state.clone()),
        })
    }
}

impl Routine for Immediate {
    fn resume(
        &mut self,
        _ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        Ok(Step::Done(self.value.take().unwrap_or(Value::Null)))
    }

    fn type_tag(&self) -> &'static str {
        IMMEDIATE_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(self.value.clone().unwrap_or(Value::Null))
    }
}

/// Defers for a fixed number of ticks, then resumes with `true`
///
/// The building block for timeouts: race the work against `delay(n)`.
#[derive(Debug)]
pub struct Delay {
    left: u64,
}

/// Type tag for [`Delay`]
pub const DELAY_TAG: &str = "@delay";

impl Delay {
    /// Wait for `ticks` scheduling steps
    pub fn new(ticks: u64) -> Self {
        Self { left: ticks }
    }

    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let left = state
            .field("left")
            .and_then(Value::as_int)
            .ok_or_else(|| SerializationError::Malformed("delay state".to_string()))?;
        Ok(Self { left: left as u64 })
    }
}

impl Routine for Delay {
    fn resume(
        &mut self,
        _ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        if self.left == 0 {
            return Ok(Step::Done(Value::Bool(true)));
        }
        self.left -= 1;
        Ok(Step::Yield(Effect::Defer))
    }

    fn type_tag(&self) -> &'static str {
        DELAY_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([("left", Value::Int(self.left as i64))]))
    }
}

/// Defer for `ticks` scheduling steps
pub fn delay(ticks: u64) -> Effect {
    crate::effect::call_routine(Box::new(Delay::new(ticks)))
}

/// Carrier task for a nested All/Race group
///
/// Group entries that are themselves groups run as an implicit child task
/// yielding the nested effect once; the parent then joins it like any other
/// entry. The effect is dispatched on the first resume, always within the
/// step that spawned the carrier, so a suspended carrier never holds one.
#[derive(Debug)]
pub struct GroupCarrier {
    effect: Option<Effect>,
}

/// Type tag for [`GroupCarrier`]
pub const GROUP_TAG: &str = "@group";

impl GroupCarrier {
    /// Wrap a nested group effect
    pub fn new(effect: Effect) -> Self {
        Self {
            effect: Some(effect),
        }
    }

    pub(crate) fn decode(_state: &Value) -> Result<Self, SerializationError> {
        Ok(Self { effect: None })
    }
}

impl Routine for GroupCarrier {
    fn resume(
        &mut self,
        _ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        match self.effect.take() {
            Some(effect) => Ok(Step::Yield(effect)),
            None => Ok(Step::Done(input.into_result()?)),
        }
    }

    fn type_tag(&self) -> &'static str {
        GROUP_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        if self.effect.is_some() {
            return Err(SerializationError::Malformed(
                "group carrier saved before dispatch".to_string(),
            ));
        }
        Ok(Value::Null)
    }
}
