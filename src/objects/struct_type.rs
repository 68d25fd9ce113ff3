//! Struct type descriptor (spec.md §4.2's `StructType`).
//!
//! Grounded on `examples/jimingmin-DynaC/src/objects/object_struct.rs`'s
//! `ObjectStructType` (name, `field_names`, a name→index table), with the
//! `methods` object added per spec.md §4.2: "a methods object (its
//! prototype)."

use std::mem::size_of;

use crate::intern::StringRef;
use crate::objects::instance::ObjectInstance;
use crate::objects::{GcHeader, GcSize, ObjectKind};
use crate::table::Table;

#[repr(C)]
pub struct ObjectStructType {
    pub header: GcHeader,
    pub name: String,
    pub field_names: Vec<StringRef>,
    /// Name → positional index into `ObjectStructInstance::fields`.
    field_index: Table<usize>,
    /// Methods, resolved via this type's methods object, which in turn is
    /// set as the prototype of the per-instance view object used for method
    /// dispatch (spec.md §4.2: "resolved via the type's methods object
    /// (prototype of the instance's view object)").
    pub methods: *mut ObjectInstance,
}

impl ObjectStructType {
    pub fn new(name: String, field_names: Vec<StringRef>, methods: *mut ObjectInstance) -> Self {
        let mut field_index = Table::new();
        for (i, &field) in field_names.iter().enumerate() {
            field_index.insert(field, i);
        }
        ObjectStructType {
            header: GcHeader::new(ObjectKind::StructType),
            name,
            field_names,
            field_index,
            methods,
        }
    }

    pub fn field_count(&self) -> usize {
        self.field_names.len()
    }

    pub fn field_slot(&self, name: StringRef) -> Option<usize> {
        self.field_index.find(name).copied()
    }
}

impl GcSize for ObjectStructType {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectStructType>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size()
            + self.name.capacity()
            + self.field_names.capacity() * size_of::<StringRef>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::StringInterner;
    use std::ptr;

    #[test]
    fn field_slot_resolves_declared_fields() {
        let mut pool = StringInterner::new();
        let x = pool.intern("x");
        let y = pool.intern("y");
        let ty = ObjectStructType::new("Point".to_string(), vec![x, y], ptr::null_mut());
        assert_eq!(ty.field_slot(x), Some(0));
        assert_eq!(ty.field_slot(y), Some(1));
        assert_eq!(ty.field_count(), 2);
    }

    #[test]
    fn field_slot_misses_unknown_name() {
        let mut pool = StringInterner::new();
        let x = pool.intern("x");
        let z = pool.intern("z");
        let ty = ObjectStructType::new("Point".to_string(), vec![x], ptr::null_mut());
        assert_eq!(ty.field_slot(z), None);
    }
}
