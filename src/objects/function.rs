//! Compiled function object (spec.md §3's `Function`).
//!
//! Grounded on `dynac/src/objects/object_function.rs`: arity, an owned
//! `Chunk`, a name, and an upvalue count, unchanged from the teacher.

use std::mem::size_of;

use crate::chunk::Chunk;
use crate::objects::{GcHeader, GcSize, ObjectKind};

#[repr(C)]
pub struct ObjectFunction {
    pub header: GcHeader,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Box<Chunk>,
    pub name: String,
    /// Set for a function declared `async` (spec.md §4.7): calling it spawns
    /// a coroutine and returns a `Promise` immediately instead of running
    /// inline. Not present in the teacher, which has no coroutine subsystem.
    pub is_async: bool,
}

impl ObjectFunction {
    pub fn new(arity: u8, name: String) -> Self {
        ObjectFunction {
            header: GcHeader::new(ObjectKind::Function),
            arity,
            upvalue_count: 0,
            chunk: Box::new(Chunk::new()),
            name,
            is_async: false,
        }
    }
}

impl GcSize for ObjectFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectFunction>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size()
            + self.name.capacity()
            + self.chunk.code.capacity()
            + self.chunk.lines.capacity() * size_of::<u32>()
            + self.chunk.constants.capacity() * size_of::<crate::value::Value>()
    }
}
