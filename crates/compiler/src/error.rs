//! Compiler-local error types.
//!
//! `CompileError` covers failures that abort the pipeline outright (a
//! malformed AST, resolution failure, or a `foldk` table overflow).
//! Failures that the original treats as locally recovered -- "this op would
//! always throw at runtime" -- are not `CompileError`s; they are pushed to a
//! `Vec<Diagnostic>` on the pass that notices them (`ir_fold`) and do not
//! stop compilation (§7 "Locally recovered").

use std::fmt;

#[derive(Debug, Clone)]
pub enum CompileError {
    Resolve(String),
    Build(String),
    /// `foldk` ran out of inline-constant slots (>255) or total constant
    /// table slots (>65535).
    TableOverflow(String),
    Emit(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Resolve(s) => write!(f, "resolve error: {s}"),
            CompileError::Build(s) => write!(f, "ir build error: {s}"),
            CompileError::TableOverflow(s) => write!(f, "constant table overflow: {s}"),
            CompileError::Emit(s) => write!(f, "emit error: {s}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<String> for CompileError {
    fn from(s: String) -> Self {
        CompileError::Build(s)
    }
}

/// A non-fatal diagnostic raised by a pass that can locally recover, e.g.
/// folding an operation that will always throw at runtime.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub sloc: crate::ast::SrcLoc,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "warning: {}", self.message)
    }
}
