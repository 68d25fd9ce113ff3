//! Struct value (spec.md §4.2's `StructInstance` and "Structs have value
//! semantics").
//!
//! Grounded on
//! `examples/jimingmin-DynaC/src/objects/object_struct.rs`'s
//! `ObjectStructInstance` (a type pointer plus positional fields).

use std::mem::size_of;

use crate::objects::struct_type::ObjectStructType;
use crate::objects::{GcHeader, GcSize, ObjectKind};
use crate::value::Value;

#[repr(C)]
pub struct ObjectStructInstance {
    pub header: GcHeader,
    pub struct_type: *mut ObjectStructType,
    pub fields: Vec<Value>,
}

impl ObjectStructInstance {
    pub fn new(struct_type: *mut ObjectStructType, fields: Vec<Value>) -> Self {
        ObjectStructInstance {
            header: GcHeader::new(ObjectKind::StructInstance),
            struct_type,
            fields,
        }
    }

    /// Deep-copies this struct's fields for spec.md §4.2 "Struct copy": a
    /// `Str` field needs no work (strings are pool-deduplicated, so copying
    /// the `Value::Str` pointer already preserves identity — there is
    /// nothing to "re-intern"), a `Struct` field recurses, and every other
    /// field (including `Object`) is shared by reference, which a plain
    /// `Value` copy already gives since `Value` is `Copy`.
    ///
    /// Takes an allocator callback rather than allocating directly, since
    /// this module has no access to the GC-owning `ObjectManager` — the
    /// caller (the VM, via its object manager) supplies one.
    ///
    /// # Safety
    /// Every `Value::Struct` pointer reachable from `self.fields` must point
    /// at a live `ObjectStructInstance`.
    pub unsafe fn deep_copy<A>(&self, alloc: &mut A) -> *mut ObjectStructInstance
    where
        A: FnMut(*mut ObjectStructType, Vec<Value>) -> *mut ObjectStructInstance,
    {
        let copied_fields = self
            .fields
            .iter()
            .map(|field| match field {
                Value::Struct(inner) => Value::Struct((**inner).deep_copy(alloc)),
                other => *other,
            })
            .collect();
        alloc(self.struct_type, copied_fields)
    }
}

impl GcSize for ObjectStructInstance {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectStructInstance>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.fields.capacity() * size_of::<Value>()
    }
}
