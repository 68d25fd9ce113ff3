//! The prototype-chained property bag (spec.md §4.2's `Object`/`Array`).
//!
//! Grounded on `dynac/src/objects/object.rs`'s heap-object shape and on
//! `src/table.rs`'s name-keyed table, combined into the single
//! representation spec.md §9 Open Question (iii) asks for: one storage
//! backend behind one API, not the two (linked-list and open-addressed
//! hash) that coexist in the source. Array literal/op support (spec.md
//! §4.2's "Array ops") is folded into the same type via an `is_array` flag
//! plus a dense/sparse storage enum, per spec.md's "two representations are
//! acceptable: contiguous vector ... or numeric-string properties".

use std::collections::HashMap;
use std::mem::size_of;

use crate::constants::MAX_PROTOTYPE_HOPS;
use crate::error::RuntimeError;
use crate::intern::StringRef;
use crate::objects::{GcHeader, GcSize, ObjectKind};
use crate::table::Table;
use crate::value::Value;

/// Array backing storage. Starts `Dense`; a non-sequential write (an index
/// that would leave a gap) demotes it to `Sparse`, per spec.md §4.2's "when
/// a non-dense pattern is detected (sparse writes), transition to the
/// hash-backed representation." The sparse map is keyed by the numeric
/// index directly rather than by an interned "numeric-string" key — the
/// property-bag `Table` is reserved for name-keyed properties (which require
/// a live `StringInterner` to produce keys); indexed storage has no such
/// dependency and keying it by `usize` keeps array access free of the
/// interner entirely.
enum ArrayStorage {
    Dense(Vec<Value>),
    Sparse(HashMap<usize, Value>),
}

#[repr(C)]
pub struct ObjectInstance {
    pub header: GcHeader,
    /// Own properties, keyed by interned name. For arrays this holds any
    /// non-index properties (e.g. user-added fields); indexed elements live
    /// in `array`.
    properties: Table<Value>,
    pub prototype: Option<*mut ObjectInstance>,
    pub is_array: bool,
    array: ArrayStorage,
}

impl ObjectInstance {
    pub fn new_object(prototype: Option<*mut ObjectInstance>) -> Self {
        ObjectInstance {
            header: GcHeader::new(ObjectKind::Instance),
            properties: Table::new(),
            prototype,
            is_array: false,
            array: ArrayStorage::Dense(Vec::new()),
        }
    }

    pub fn new_array(prototype: Option<*mut ObjectInstance>) -> Self {
        ObjectInstance {
            header: GcHeader::new(ObjectKind::Instance),
            properties: Table::new(),
            prototype,
            is_array: true,
            array: ArrayStorage::Dense(Vec::new()),
        }
    }

    /// `get(obj, key)` (spec.md §4.2): own properties first, then recurse
    /// into `prototype`, bounded by `MAX_PROTOTYPE_HOPS` so a malformed
    /// cycle errors instead of looping forever.
    ///
    /// # Safety
    /// Every `prototype` pointer reachable from `self` must point at a live
    /// `ObjectInstance`.
    pub unsafe fn get(&self, key: StringRef) -> Result<Option<Value>, RuntimeError> {
        let mut current: *const ObjectInstance = self;
        for _ in 0..=MAX_PROTOTYPE_HOPS {
            let obj = &*current;
            if let Some(value) = obj.properties.find(key) {
                return Ok(Some(*value));
            }
            match obj.prototype {
                Some(proto) => current = proto,
                None => return Ok(None),
            }
        }
        Err(RuntimeError::PrototypeChainTooLong(MAX_PROTOTYPE_HOPS))
    }

    /// `set` always writes to `self`, never the prototype (spec.md §4.2).
    pub fn set(&mut self, key: StringRef, value: Value) {
        self.properties.insert(key, value);
    }

    pub fn own_properties(&self) -> impl Iterator<Item = (StringRef, &Value)> {
        self.properties.iter()
    }

    /// spec.md §4.2: "`length` property kept consistent with the largest
    /// integer-keyed index plus one."
    pub fn length(&self) -> usize {
        match &self.array {
            ArrayStorage::Dense(v) => v.len(),
            ArrayStorage::Sparse(t) => t.keys().max().map_or(0, |&m| m + 1),
        }
    }

    pub fn push(&mut self, value: Value) {
        match &mut self.array {
            ArrayStorage::Dense(v) => v.push(value),
            ArrayStorage::Sparse(t) => {
                let index = self.length();
                t.insert(index, value);
            }
        }
    }

    pub fn pop(&mut self) -> Option<Value> {
        match &mut self.array {
            ArrayStorage::Dense(v) => v.pop(),
            ArrayStorage::Sparse(t) => {
                let last = *t.keys().max()?;
                t.remove(&last)
            }
        }
    }

    pub fn get_index(&self, index: usize) -> Option<Value> {
        match &self.array {
            ArrayStorage::Dense(v) => v.get(index).copied(),
            ArrayStorage::Sparse(t) => t.get(&index).copied(),
        }
    }

    /// Writes `value` at `index`. A write past the current length demotes a
    /// `Dense` array to `Sparse` rather than padding with holes, matching
    /// spec.md §4.2's "non-dense pattern" transition trigger.
    pub fn set_index(&mut self, index: usize, value: Value) {
        match &mut self.array {
            ArrayStorage::Dense(v) => {
                if index < v.len() {
                    v[index] = value;
                } else if index == v.len() {
                    v.push(value);
                } else {
                    let mut map = HashMap::new();
                    for (i, existing) in v.drain(..).enumerate() {
                        map.insert(i, existing);
                    }
                    map.insert(index, value);
                    self.array = ArrayStorage::Sparse(map);
                }
            }
            ArrayStorage::Sparse(t) => {
                t.insert(index, value);
            }
        }
    }
}

impl GcSize for ObjectInstance {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectInstance>()
    }

    fn deep_size(&self) -> usize {
        let array_size = match &self.array {
            ArrayStorage::Dense(v) => v.capacity() * size_of::<Value>(),
            ArrayStorage::Sparse(t) => t.len() * (size_of::<Value>() + size_of::<usize>()),
        };
        self.shallow_size()
            + array_size
            + self.properties.len() * (size_of::<Value>() + size_of::<StringRef>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::StringInterner;

    #[test]
    fn own_property_shadows_nothing_and_set_never_touches_prototype() {
        let mut pool = StringInterner::new();
        let key = pool.intern("x");
        let mut proto = ObjectInstance::new_object(None);
        proto.set(key, Value::Integer(1));

        let mut child = ObjectInstance::new_object(Some(&mut proto as *mut _));
        unsafe {
            assert_eq!(child.get(key).unwrap(), Some(Value::Integer(1)));
        }
        child.set(key, Value::Integer(2));
        unsafe {
            assert_eq!(child.get(key).unwrap(), Some(Value::Integer(2)));
        }
        // The prototype's own copy is untouched.
        assert_eq!(proto.properties.find(key), Some(&Value::Integer(1)));
    }

    #[test]
    fn missing_property_returns_none_not_nil() {
        let mut pool = StringInterner::new();
        let key = pool.intern("missing");
        let obj = ObjectInstance::new_object(None);
        unsafe {
            assert_eq!(obj.get(key).unwrap(), None);
        }
    }

    #[test]
    fn prototype_cycle_errors_instead_of_looping() {
        let mut pool = StringInterner::new();
        let key = pool.intern("x");
        let mut a = ObjectInstance::new_object(None);
        let mut b = ObjectInstance::new_object(None);
        a.prototype = Some(&mut b as *mut _);
        b.prototype = Some(&mut a as *mut _);
        unsafe {
            assert!(matches!(
                a.get(key),
                Err(RuntimeError::PrototypeChainTooLong(_))
            ));
        }
    }

    #[test]
    fn dense_array_push_pop_and_index() {
        let mut arr = ObjectInstance::new_array(None);
        arr.push(Value::Integer(1));
        arr.push(Value::Integer(2));
        arr.push(Value::Integer(3));
        assert_eq!(arr.length(), 3);
        assert_eq!(arr.get_index(1), Some(Value::Integer(2)));
        assert_eq!(arr.pop(), Some(Value::Integer(3)));
        assert_eq!(arr.length(), 2);
    }

    #[test]
    fn sparse_write_demotes_dense_array() {
        let mut arr = ObjectInstance::new_array(None);
        arr.push(Value::Integer(1));
        arr.set_index(5, Value::Integer(9));
        assert_eq!(arr.length(), 6);
        assert_eq!(arr.get_index(5), Some(Value::Integer(9)));
        assert_eq!(arr.get_index(2), None);
    }
}
