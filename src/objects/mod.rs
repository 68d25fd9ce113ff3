//! Heap object kinds tracked by the GC (spec.md §3, §4.2, component C3).
//!
//! Grounded on `dynac/src/objects/object.rs` / `src/objects/object.rs`: the
//! teacher already has an `Object` GC header (`obj_type` + casting helpers)
//! shared by every concrete heap type. This module keeps that shape, renamed
//! to `GcHeader`/`ObjectKind` to leave the name `Object` free for spec.md's
//! own `Object` concept (the prototype-chained property bag, §4.2), which
//! lives in `objects::instance::ObjectInstance`.

pub mod closure;
pub mod function;
pub mod instance;
pub mod native;
pub mod promise;
pub mod struct_instance;
pub mod struct_type;
pub mod upvalue;

use std::cell::Cell;
use std::mem::size_of;

use closure::ObjectClosure;
use function::ObjectFunction;
use instance::ObjectInstance;
use native::ObjectNativeFunction;
use promise::ObjectPromise;
use struct_instance::ObjectStructInstance;
use struct_type::ObjectStructType;
use upvalue::ObjectUpvalue;

/// Discriminant for the concrete struct a `*mut GcHeader` actually points
/// at, mirroring `dynac/src/objects/object.rs`'s `ObjectType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Function,
    Closure,
    Upvalue,
    Instance,
    StructType,
    StructInstance,
    Native,
    Promise,
}

/// Header embedded as the first field of every concrete heap type, so a
/// `*mut GcHeader` can be cast back to the concrete type once `kind` is
/// known — the same layout trick `dynac/src/objects/object.rs` uses.
#[repr(C)]
pub struct GcHeader {
    pub kind: ObjectKind,
    marked: Cell<bool>,
}

impl GcHeader {
    pub fn new(kind: ObjectKind) -> Self {
        GcHeader {
            kind,
            marked: Cell::new(false),
        }
    }

    pub fn is_marked(&self) -> bool {
        self.marked.get()
    }

    pub fn mark(&self) {
        self.marked.set(true);
    }

    pub fn unmark(&self) {
        self.marked.set(false);
    }
}

/// Computes the heap footprint of a GC-managed value, for GC threshold
/// bookkeeping (spec.md §4.6). Grounded on `src/objects/object.rs`'s
/// `GcSize` trait (`shallow_size`/`deep_size`).
pub trait GcSize {
    /// Bytes for the struct itself.
    fn shallow_size(&self) -> usize;
    /// Bytes including owned heap allocations, not counting other GC objects
    /// reachable only by pointer (those are accounted for separately when
    /// they are themselves swept or kept).
    fn deep_size(&self) -> usize;
}

/// Dispatches to the concrete object's `GcSize::deep_size`, and exposes the
/// reference-graph edges the GC mark phase walks (spec.md §4.6's "blacken"
/// step), given only the type-erased header pointer the allocation list
/// stores.
///
/// # Safety
/// `header` must point at a live allocation whose first field is this
/// `GcHeader` and whose concrete type matches `header.kind`.
pub unsafe fn deep_size(header: *const GcHeader) -> usize {
    match (*header).kind {
        ObjectKind::Function => (*(header as *const ObjectFunction)).deep_size(),
        ObjectKind::Closure => (*(header as *const ObjectClosure)).deep_size(),
        ObjectKind::Upvalue => (*(header as *const ObjectUpvalue)).deep_size(),
        ObjectKind::Instance => (*(header as *const ObjectInstance)).deep_size(),
        ObjectKind::StructType => (*(header as *const ObjectStructType)).deep_size(),
        ObjectKind::StructInstance => (*(header as *const ObjectStructInstance)).deep_size(),
        ObjectKind::Native => (*(header as *const ObjectNativeFunction)).deep_size(),
        ObjectKind::Promise => (*(header as *const ObjectPromise)).deep_size(),
    }
}

pub(crate) fn header_size() -> usize {
    size_of::<GcHeader>()
}
