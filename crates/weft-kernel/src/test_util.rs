//! Shared helpers for in-crate scheduler tests

use crate::conn::EndpointTable;
use crate::error::TaskError;
use crate::heap::{CodecRegistry, Heap, NoopResolver, ProgramRegistry};
use crate::routine::{Resume, Routine, Step};
use crate::scheduler::{EffectContext, KernelEnv, RunQueue, Scheduler};
use crate::value::Value;
use std::collections::VecDeque;

/// Owned kernel services backing a [`KernelEnv`] in tests
pub(crate) struct TestEnv {
    pub heap: Heap,
    pub endpoints: EndpointTable,
    pub programs: ProgramRegistry,
    pub codecs: CodecRegistry,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(Box::new(NoopResolver)),
            endpoints: EndpointTable::default(),
            programs: ProgramRegistry::new(),
            codecs: CodecRegistry::new(),
        }
    }

    pub fn env(&mut self) -> KernelEnv<'_> {
        KernelEnv {
            heap: &mut self.heap,
            endpoints: &mut self.endpoints,
            programs: &self.programs,
            codecs: &self.codecs,
        }
    }
}

/// Step until no task is live, panicking after 100 steps
pub(crate) fn drive<Q: RunQueue + 'static>(sched: &mut Scheduler<Q>, te: &mut TestEnv) {
    let mut steps = 0;
    while sched.is_active() {
        steps += 1;
        assert!(steps <= 100, "timed out after 100 steps");
        let mut env = te.env();
        sched.step(&mut env).expect("scheduler step failed");
    }
}

pub(crate) type ScriptStep =
    Box<dyn FnMut(&mut EffectContext<'_>, Resume) -> Result<Step, TaskError>>;

/// Test routine assembled from a linear sequence of resume closures
///
/// Each closure receives the input of one resume and yields or completes;
/// an exhausted script completes with `Null`. Not persistable.
pub(crate) struct Script {
    steps: VecDeque<ScriptStep>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("steps_left", &self.steps.len())
            .finish()
    }
}

impl Script {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

/// Box one script step
pub(crate) fn step(
    f: impl FnMut(&mut EffectContext<'_>, Resume) -> Result<Step, TaskError> + 'static,
) -> ScriptStep {
    Box::new(f)
}

impl Routine for Script {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        match self.steps.pop_front() {
            Some(mut f) => f(ctx, input),
            None => {
                // An exhausted script still propagates a thrown error.
                input.into_result()?;
                Ok(Step::Done(Value::Null))
            }
        }
    }

    fn type_tag(&self) -> &'static str {
        "@test.script"
    }

    fn save_state(&self) -> Result<Value, crate::error::SerializationError> {
        Err(crate::error::SerializationError::Malformed(
            "test scripts are not persistable".to_string(),
        ))
    }
}
