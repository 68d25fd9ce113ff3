//! Runtime error taxonomy (spec.md §7).
//!
//! Grounded on `examples/cartman-fr-vitte/crates/vitte-runtime`'s
//! `thiserror`-based error style and on
//! `examples/other_examples/423824ee_letung3105-rox__src-vm.rs.rs`'s
//! `RuntimeError` enum, which lists almost the same variant set this crate
//! needs (`StackOverflow`, `UndefinedVariable`, `BadArgumentsCount`, ...).

use std::fmt;

/// The kinds of runtime error spec.md §7 enumerates.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    /// Operand(s) had a type that could not satisfy the operation.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A global name was read or assigned before being declared.
    #[error("undefined global '{0}'")]
    UndefinedGlobal(String),

    /// A property lookup found no entry anywhere in the prototype chain.
    #[error("undefined property '{0}'")]
    UndefinedProperty(String),

    /// A call supplied a different argument count than the callee's arity.
    #[error("expected {expected} arguments but got {got}")]
    ArityMismatch {
        /// Declared arity of the callee.
        expected: usize,
        /// Number of arguments actually passed.
        got: usize,
    },

    /// The call-frame stack grew past `constants::MAX_FRAME_DEPTH`.
    #[error("stack overflow")]
    StackOverflow,

    /// Integer or float division where the divisor was exactly zero in a
    /// context that must error rather than produce `inf`/`NaN` (spec.md
    /// §4.4: "MOD with a zero divisor errors").
    #[error("division by zero")]
    DivisionByZero,

    /// A value could not be coerced to the type an operation required.
    #[error("bad cast: {0}")]
    BadCast(String),

    /// Attempted to `CALL` a value that is neither a closure nor a native.
    #[error("value is not callable: {0}")]
    Uncallable(String),

    /// A struct literal/field access named a field the struct type lacks.
    #[error("struct '{struct_name}' has no field '{field}'")]
    StructFieldMissing {
        /// Name of the struct type.
        struct_name: String,
        /// Field name that was missing.
        field: String,
    },

    /// A coroutine's promise was rejected and the failure propagated to a
    /// dependent that did not handle it.
    #[error("coroutine failed: {0}")]
    CoroutineFailed(String),

    /// The prototype chain exceeded `constants::MAX_PROTOTYPE_HOPS` without
    /// terminating — most likely a malformed (non-DAG-respecting) cycle.
    #[error("prototype chain exceeded {0} hops")]
    PrototypeChainTooLong(usize),

    /// A struct type (or global) was declared twice under the same name.
    #[error("'{0}' is already declared")]
    AlreadyDeclared(String),
}

/// An opaque compile error. The compiler producing it is out of scope for
/// this crate (spec.md §1); the VM only needs to carry the message through
/// to `InterpretResult::CompileError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("compile error: {0}")]
pub struct CompileError(pub String);

/// A `RuntimeError` paired with the source line active when it was raised,
/// read from the erroring frame's chunk (spec.md §7: runtime errors unwind
/// "producing a structured error with source location (from the chunk's
/// line map)"). `line` is `0` for errors synthesized outside any running
/// frame (e.g. an executor deadlock with no single erroring instruction).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[line {line}] {error}")]
pub struct LocatedRuntimeError {
    pub error: RuntimeError,
    pub line: u32,
}

/// Outcome of `Vm::interpret` (spec.md §6's embedding interface).
#[derive(Debug, Clone, PartialEq)]
pub enum InterpretResult {
    /// Execution completed; the value is whatever remained on the stack.
    Ok,
    /// The supplied chunk could not be produced/validated upstream.
    CompileError(CompileError),
    /// Execution raised an unhandled `RuntimeError`, located by source line.
    RuntimeError(LocatedRuntimeError),
}

impl InterpretResult {
    /// Matches spec.md §6's embedder-visible exit codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::RuntimeError(_) => 1,
            InterpretResult::CompileError(_) => 2,
        }
    }
}

impl fmt::Display for InterpretResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretResult::Ok => write!(f, "ok"),
            InterpretResult::CompileError(e) => write!(f, "{e}"),
            InterpretResult::RuntimeError(e) => write!(f, "{e}"),
        }
    }
}

/// Raised when an internal invariant is violated. Per spec.md §7 this is a
/// `Bug` and terminates the process rather than unwinding to the interpret
/// entry point.
#[track_caller]
pub fn bug(message: &str) -> ! {
    panic!("internal VM bug: {message}");
}
