//! Cooperative single-threaded scheduler (spec.md §4.7's "Executor").
//!
//! Not grounded in the teacher (see `coroutine.rs`'s header); grounded on
//! spec.md §4.7 directly: "Owns a FIFO `ready_queue` and a set of suspended
//! coroutines. `tick()` dequeues the front coroutine and resumes it..."
//! This module owns the queue and the coroutine arena; actually resuming a
//! coroutine means running bytecode, which requires the `Vm`, so the
//! resume/tick driving loop lives on `Vm` in `vm.rs` and calls back into the
//! plain data structure here.

use std::collections::VecDeque;

use crate::coroutine::{Coroutine, CoroutineId, CoroutineState};

#[derive(Default)]
pub struct Executor {
    coroutines: Vec<Coroutine>,
    ready_queue: VecDeque<CoroutineId>,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            coroutines: Vec::new(),
            ready_queue: VecDeque::new(),
        }
    }

    /// Adds a coroutine to the arena and schedules it, returning its id.
    pub fn spawn(&mut self, coroutine: Coroutine) -> CoroutineId {
        let id = CoroutineId(self.coroutines.len());
        self.coroutines.push(coroutine);
        self.ready_queue.push_back(id);
        id
    }

    /// Dequeues the next coroutine to resume, FIFO (spec.md §4.7).
    pub fn pop_ready(&mut self) -> Option<CoroutineId> {
        self.ready_queue.pop_front()
    }

    /// Re-schedules a coroutine onto the back of the ready queue: used both
    /// for an explicit yield-and-continue and for spec.md §9 Open Question
    /// (ii)'s resolution ("reschedule onto the ready queue" for a waiter
    /// whose promise resolved while it was suspended), rather than the
    /// source's latent bug of leaving it `Suspended` forever.
    pub fn reschedule(&mut self, id: CoroutineId) {
        self.ready_queue.push_back(id);
    }

    pub fn get(&self, id: CoroutineId) -> &Coroutine {
        &self.coroutines[id.0]
    }

    pub fn get_mut(&mut self, id: CoroutineId) -> &mut Coroutine {
        &mut self.coroutines[id.0]
    }

    pub fn is_idle(&self) -> bool {
        self.ready_queue.is_empty()
    }

    /// Every live coroutine, for the GC root set (spec.md §4.6 root (vii)).
    pub fn coroutines(&self) -> impl Iterator<Item = &Coroutine> {
        self.coroutines.iter()
    }

    pub fn coroutine_count(&self) -> usize {
        self.coroutines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn dummy_coroutine() -> Coroutine {
        Coroutine::new(std::ptr::null_mut(), vec![])
    }

    #[test]
    fn spawn_enqueues_in_fifo_order() {
        let mut executor = Executor::new();
        let a = executor.spawn(dummy_coroutine());
        let b = executor.spawn(dummy_coroutine());
        assert_eq!(executor.pop_ready(), Some(a));
        assert_eq!(executor.pop_ready(), Some(b));
        assert_eq!(executor.pop_ready(), None);
    }

    #[test]
    fn reschedule_appends_to_the_back() {
        let mut executor = Executor::new();
        let a = executor.spawn(dummy_coroutine());
        let b = executor.spawn(dummy_coroutine());
        let popped_a = executor.pop_ready().unwrap();
        assert_eq!(popped_a, a);
        executor.reschedule(popped_a);
        assert_eq!(executor.pop_ready(), Some(b));
        assert_eq!(executor.pop_ready(), Some(a));
    }

    #[test]
    fn get_mut_reaches_the_right_coroutine() {
        let mut executor = Executor::new();
        let a = executor.spawn(dummy_coroutine());
        executor.get_mut(a).result = Some(Ok(Value::Integer(7)));
        match executor.get(a).result {
            Some(Ok(Value::Integer(7))) => {}
            _ => panic!("expected stored result"),
        }
    }
}
