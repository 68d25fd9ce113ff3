//! A function paired with its captured upvalues (spec.md §3's `Closure`).
//!
//! Grounded on `dynac/src/objects/object_closure.rs` (`function` +
//! `upvalues`). The teacher stored upvalues as `Vec<ObjectUpvalue>` (by
//! value) in one snapshot and `Vec<usize>` (indices) in another; spec.md
//! §4.4's `CLOSURE` semantics need the closure to hold live references to
//! shared `ObjectUpvalue` heap cells (so closing one upvalue is visible to
//! every closure that captured it), so this keeps raw pointers to
//! GC-managed upvalue objects, matching how the rest of this port threads
//! every other heap reference.

use std::mem::size_of;

use crate::objects::function::ObjectFunction;
use crate::objects::upvalue::ObjectUpvalue;
use crate::objects::{GcHeader, GcSize, ObjectKind};

#[repr(C)]
pub struct ObjectClosure {
    pub header: GcHeader,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction, upvalue_count: usize) -> Self {
        ObjectClosure {
            header: GcHeader::new(ObjectKind::Closure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }
}

impl GcSize for ObjectClosure {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClosure>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.upvalues.capacity() * size_of::<*mut ObjectUpvalue>()
    }
}
