//! The error taxonomy shared by the compiler's locally-recovered diagnostics
//! and the runtime's unwind path.
//!
//! kenaf distinguishes a handful of error *kinds* that scripts can trigger
//! (bad argument, type mismatch, out-of-range index, missing key, bad value,
//! misused cothread) from the generic "a script value was thrown" case. The
//! kinds let a host catch `ArgumentError` without having to string-match a
//! message, the way the constructors in the original throw typed errors
//! rather than bare strings.

use std::fmt;

/// A thrown or raised error, typed by kind.
///
/// `ScriptError` does not carry a `kenaf_runtime::Value` directly -- this
/// crate sits below the runtime crate in the dependency graph -- so the
/// `Value` variant instead carries the value's opaque NaN-boxed bit pattern.
/// `kenaf_runtime::error` re-hydrates it back into a `Value` at the point
/// where it is caught.
#[derive(Debug, Clone)]
pub enum ScriptError {
    /// A host-callable or native function was called with a bad argument.
    Argument(String),
    /// An operation was applied to a value of the wrong type.
    Type(String),
    /// An array or string index was out of range.
    Index(String),
    /// A table lookup found no such key.
    Key(String),
    /// A value was otherwise unacceptable (e.g. NaN used as a table key).
    Value(String),
    /// A cothread was resumed, called, or yielded from in an invalid state.
    Cothread(String),
    /// A script explicitly threw a value via `THROW`.
    Thrown {
        message: String,
        bits: u64,
        trace: Vec<String>,
    },
}

impl ScriptError {
    pub fn argument(msg: impl Into<String>) -> Self {
        ScriptError::Argument(msg.into())
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        ScriptError::Type(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        ScriptError::Index(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        ScriptError::Key(msg.into())
    }

    pub fn value(msg: impl Into<String>) -> Self {
        ScriptError::Value(msg.into())
    }

    pub fn cothread(msg: impl Into<String>) -> Self {
        ScriptError::Cothread(msg.into())
    }

    /// Attach an unwind trace frame (`"script:line:col: funcname"`) to this
    /// error, building up the trace that `THROW` accumulates as it
    /// propagates back through `call_return`'s caller chain.
    pub fn with_frame(mut self, frame: String) -> Self {
        match &mut self {
            ScriptError::Thrown { trace, .. } => trace.push(frame),
            other => {
                let message = other.to_string();
                *other = ScriptError::Thrown {
                    message,
                    bits: 0,
                    trace: vec![frame],
                };
            }
        }
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Argument(s) => write!(f, "argument error: {s}"),
            ScriptError::Type(s) => write!(f, "type error: {s}"),
            ScriptError::Index(s) => write!(f, "index error: {s}"),
            ScriptError::Key(s) => write!(f, "key error: {s}"),
            ScriptError::Value(s) => write!(f, "value error: {s}"),
            ScriptError::Cothread(s) => write!(f, "cothread error: {s}"),
            ScriptError::Thrown { message, trace, .. } => {
                write!(f, "{message}")?;
                for frame in trace {
                    write!(f, "\n  at {frame}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<String> for ScriptError {
    fn from(s: String) -> Self {
        ScriptError::Thrown {
            message: s,
            bits: 0,
            trace: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_prefix() {
        assert_eq!(
            ScriptError::argument("bad arg").to_string(),
            "argument error: bad arg"
        );
    }

    #[test]
    fn with_frame_accumulates_trace() {
        let err = ScriptError::from("boom".to_string())
            .with_frame("script:3:1: f".to_string())
            .with_frame("script:9:4: g".to_string());
        let rendered = err.to_string();
        assert!(rendered.contains("script:3:1: f"));
        assert!(rendered.contains("script:9:4: g"));
    }
}
