//! Cooperative coroutine (spec.md §4.7, component C7).
//!
//! Not grounded in the teacher (neither snapshot has a coroutine subsystem);
//! grounded instead on the architectural decision recorded in
//! SPEC_FULL.md's "Coroutine & Promise Executor" section: because this
//! crate's interpreter loop (`vm::Vm::run`) already keeps all per-call state
//! — operand stack, call frames — as plain fields rather than on the native
//! Rust call stack, a coroutine can suspend simply by having `run` return
//! early and resume by swapping its saved stack/frames back into the `Vm`.
//! No stack-switching crate (`may`, used by
//! `examples/navicore-cem3/crates/runtime`) or async runtime (`tokio`) is
//! needed or imported.

use crate::call_frame::CallFrame;
use crate::error::LocatedRuntimeError;
use crate::value::Value;

/// Identifies one coroutine inside an `Executor`'s arena. Stable across
/// suspend/resume; reused only after the slot is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    Suspended,
    Running,
    Completed,
    Failed,
}

/// One suspended or runnable coroutine's saved execution state. While a
/// coroutine is `Running`, its `stack`/`frames` are swapped into the `Vm`
/// (see `vm::Vm::resume_coroutine`) and these fields are left empty.
pub struct Coroutine {
    pub state: CoroutineState,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub result: Option<Result<Value, LocatedRuntimeError>>,
}

impl Coroutine {
    /// A coroutine ready to run: one frame over `closure`, with `args`
    /// already placed in its stack slots (spec.md §4.4's call convention:
    /// "the callee and argv live in-place on the stack").
    pub fn new(closure: *mut crate::objects::closure::ObjectClosure, args: Vec<Value>) -> Self {
        let mut stack = Vec::with_capacity(args.len() + 1);
        stack.push(Value::Closure(closure));
        stack.extend(args);
        let frame = CallFrame::new(closure, 0);
        Coroutine {
            state: CoroutineState::Suspended,
            stack,
            frames: vec![frame],
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            CoroutineState::Completed | CoroutineState::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_coroutine_starts_suspended_with_one_frame() {
        let coroutine = Coroutine::new(std::ptr::null_mut(), vec![Value::Integer(1)]);
        assert_eq!(coroutine.state, CoroutineState::Suspended);
        assert_eq!(coroutine.frames.len(), 1);
        assert_eq!(coroutine.stack.len(), 2);
        assert!(!coroutine.is_terminal());
    }
}
