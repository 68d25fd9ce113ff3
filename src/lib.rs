//! `dynac` — the execution core of a Swift-flavored dynamic language
//! runtime: value model, prototype object system, bytecode chunk, a
//! mark-and-sweep garbage collector, a stack VM, and a cooperative
//! coroutine/promise executor.
//!
//! Lexing, parsing, compilation, the module/archive loader, the standard
//! library, and any CLI/REPL front-end are external collaborators this
//! crate only exposes seams for (see [`glue`]); none of them ship here.
//! A `Chunk` is the sole handoff format between a front end and [`vm::Vm`] —
//! this crate builds chunks itself only through [`chunk::ChunkBuilder`],
//! which performs no parsing of its own.

pub mod call_frame;
pub mod chunk;
pub mod constants;
pub mod coroutine;
pub mod error;
pub mod executor;
pub mod gc;
pub mod glue;
pub mod intern;
pub mod object_manager;
pub mod objects;
pub mod table;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, ChunkBuilder, OpCode};
pub use error::{CompileError, InterpretResult, LocatedRuntimeError, RuntimeError};
pub use value::Value;
pub use vm::Vm;
