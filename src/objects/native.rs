//! Native (host) callable (spec.md §3's `Native`, §6's "Native functions
//! have the signature `fn(argc, argv[]) -> Value`").
//!
//! Grounded on `dynac/src/objects/object_native_function.rs`'s
//! `ObjectNativeFunction` (name, arity, boxed callable) and its
//! `NativeObject` trait. This keeps a plain function-pointer alias instead
//! of the teacher's `Box<dyn NativeObject>` trait object — the stdlib that
//! would populate these is out of scope (spec.md §1), so the only callers
//! are tests and the C9 glue layer, for which `NativeFn` is simpler to wire
//! up and matches spec.md §6's signature directly.

use std::mem::size_of;

use crate::error::RuntimeError;
use crate::objects::{GcHeader, GcSize, ObjectKind};
use crate::value::Value;
use crate::vm::Vm;

/// A host-provided callable, matching spec.md §6 exactly: receives the VM
/// (so it can call back into user code via `vm_call_value`, per spec.md
/// §6's stdlib interface) and the argument slice, returns a `Value`.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

#[repr(C)]
pub struct ObjectNativeFunction {
    pub header: GcHeader,
    pub name: String,
    pub arity: u8,
    pub function: NativeFn,
}

impl ObjectNativeFunction {
    pub fn new(name: String, arity: u8, function: NativeFn) -> Self {
        ObjectNativeFunction {
            header: GcHeader::new(ObjectKind::Native),
            name,
            arity,
            function,
        }
    }

    pub fn call(&self, vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
        if args.len() != self.arity as usize {
            return Err(RuntimeError::ArityMismatch {
                expected: self.arity as usize,
                got: args.len(),
            });
        }
        (self.function)(vm, args)
    }
}

impl GcSize for ObjectNativeFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectNativeFunction>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.name.capacity()
    }
}
