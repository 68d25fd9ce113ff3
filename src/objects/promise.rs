//! Promise (spec.md §4.7's "A `Promise` has a state in `{Pending, Resolved,
//! Failed}`, a result value, and a list of waiting coroutines").
//!
//! Not grounded in the teacher, which has no coroutine/promise machinery at
//! all (component C7 is absent from both teacher snapshots) — modeled as a
//! GC-managed heap object like every other reference type in this crate
//! (`ObjectInstance`, `ObjectStructInstance`, ...) so it participates in
//! marking the same way: spec.md §4.6 root (vii) names "the currently
//! running coroutine and the ready queue" as GC roots, which only makes
//! sense if promises and coroutines are themselves reachable, traceable
//! heap values rather than VM-external bookkeeping.

use std::mem::size_of;

use crate::coroutine::CoroutineId;
use crate::objects::{GcHeader, GcSize, ObjectKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Resolved,
    Failed,
}

#[repr(C)]
pub struct ObjectPromise {
    pub header: GcHeader,
    pub state: PromiseState,
    pub result: Option<Value>,
    /// Coroutines suspended on this promise, in arrival order (spec.md
    /// §4.7's FIFO ordering guarantee (i)).
    pub waiters: Vec<CoroutineId>,
}

impl ObjectPromise {
    pub fn new_pending() -> Self {
        ObjectPromise {
            header: GcHeader::new(ObjectKind::Promise),
            state: PromiseState::Pending,
            result: None,
            waiters: Vec::new(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state != PromiseState::Pending
    }

    /// Resolves or rejects this promise, returning the waiters to reschedule
    /// (spec.md §4.7: "When the promise resolves, every waiter is
    /// rescheduled"), draining the waiter list in FIFO order.
    pub fn settle(&mut self, state: PromiseState, result: Value) -> Vec<CoroutineId> {
        debug_assert_ne!(state, PromiseState::Pending);
        self.state = state;
        self.result = Some(result);
        std::mem::take(&mut self.waiters)
    }

    pub fn add_waiter(&mut self, coroutine: CoroutineId) {
        self.waiters.push(coroutine);
    }
}

impl GcSize for ObjectPromise {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectPromise>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.waiters.capacity() * size_of::<CoroutineId>()
    }
}
