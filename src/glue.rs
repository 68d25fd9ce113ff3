//! External-collaborator glue (spec.md §6, component C9): the seams the VM
//! exposes to a module loader, a standard library, and an embedder's print
//! sink, without depending on any of their concrete implementations.
//!
//! Grounded on `dynac/src/std_mod/time.rs`'s `NativeObject` trait (a native
//! capability the VM calls through a narrow interface) generalized to the
//! three collaborators spec.md §6 names.

use crate::chunk::Chunk;
use crate::error::RuntimeError;

/// `print_hook` (spec.md §4.4): "A process-wide function slot consumed by
/// the `print` builtin; if unset, writes to standard output." Kept as a
/// per-`Vm` field rather than an actual process-wide global — spec.md's own
/// REDESIGN FLAGS ask implementers to "thread the VM through explicitly"
/// and avoid ambient globals, so "process-wide" here is realized as "one
/// slot per VM instance," not a `static`.
pub type PrintHook = Box<dyn FnMut(&str)>;

/// A compiled module plus whatever values it exports, returned by a
/// `ModuleLoader` (spec.md §6: "`load(module_path) -> Chunk + exports`").
pub struct LoadedModule {
    pub chunk: Chunk,
    pub exports: Vec<(String, crate::value::Value)>,
}

/// The module loader interface the VM consumes (spec.md §6). "The core
/// treats the loader as an opaque capability; its binary format is
/// specified by the loader, not by the VM" — hence a trait object rather
/// than a concrete archive reader, matching the lexer/parser/compiler/
/// module-loader exclusion from this crate's scope (spec.md §1).
pub trait ModuleLoader {
    fn load(&mut self, module_path: &str) -> Result<LoadedModule, RuntimeError>;
}
