//! Tunable limits shared across the VM, GC, and executor.
//!
//! Grounded on `dynac/src/call_frame.rs`'s `MAX_STACK_SIZE` import (the
//! teacher referenced `crate::constants::MAX_STACK_SIZE` from a module that
//! was never written); this file is that module, generalized to the rest of
//! the limits spec.md calls out by name.

/// Initial operand-stack capacity (spec.md §4.4: "grown by doubling").
pub const INITIAL_STACK_CAPACITY: usize = 256;

/// Default maximum call-frame depth (spec.md §4.4: "bounded, default 1024").
pub const MAX_FRAME_DEPTH: usize = 1024;

/// Hop limit when walking a prototype chain (spec.md §3 and §8 property 2:
/// "cycles of length ≤1000 terminate without stack overflow").
pub const MAX_PROTOTYPE_HOPS: usize = 1000;

/// Default GC byte threshold before the first collection (spec.md §4.6:
/// "starts at a configurable value, e.g., 1 MiB").
pub const DEFAULT_GC_THRESHOLD_BYTES: usize = 1024 * 1024;

/// Floor the GC threshold never shrinks below after a collection.
pub const MIN_GC_THRESHOLD_BYTES: usize = 64 * 1024;

/// `threshold = max(min_threshold, live_bytes * growth_factor)` (spec.md §4.6).
pub const GC_GROWTH_FACTOR: usize = 2;

/// Load factor the string intern pool grows past (spec.md §4.1: "≤0.75").
pub const INTERN_MAX_LOAD_FACTOR: f64 = 0.75;

/// Bytecode archive magic (spec.md §6: `SWBC`).
pub const BYTECODE_MAGIC: [u8; 4] = *b"SWBC";

/// Bytecode archive format version this crate writes and reads.
pub const BYTECODE_VERSION: u32 = 1;
