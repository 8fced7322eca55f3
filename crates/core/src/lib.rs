//! Shared infrastructure for the kenaf compiler and runtime.
//!
//! Both `kenaf-compiler` and `kenaf-runtime` need a handful of the same small
//! building blocks: an index-typed vector for IR/bytecode tables, a set of
//! wrapping integer operations that match kenaf's 32-bit-wraparound bitwise
//! semantics, and the error taxonomy that a thrown script value is mapped to
//! when it crosses into a `Result`.
//!
//! # Modules
//!
//! - `error`: the `ScriptError` taxonomy (argument/type/index/key/value/
//!   cothread/script errors) shared by the compiler's locally-recovered
//!   diagnostics and the runtime's unwind path.
//! - `index_vec`: `IndexVec<T, Idx>`, a `Vec<T>` indexed by a newtype rather
//!   than a bare `usize`, used throughout the IR for op/block/local indices.
//! - `imath`: floor division/modulo and 32-bit wrapping shift helpers shared
//!   by constant folding and the VM's arithmetic opcodes, so the two agree
//!   bit-for-bit.

pub mod error;
pub mod imath;
pub mod index_vec;

pub use error::ScriptError;
pub use index_vec::{Idx, IndexVec};
