//! The runtime's error taxonomy (§7): wraps [`kenaf_core::ScriptError`] with
//! re-hydration back into a `Value` for the `Thrown` case, since `ScriptError`
//! lives below this crate and can only carry the value's raw bit pattern.

pub use kenaf_core::ScriptError;

use crate::value::Value;

/// Build a `ScriptError::Thrown` from a script value (bytecode `THROW`,
/// §7 `value_error`). `message` is used only for `Display`/logging; the
/// value itself survives in `bits` until [`thrown_value`] re-hydrates it.
pub fn throw(value: Value) -> ScriptError {
    ScriptError::Thrown { message: format!("{value:?}"), bits: value.0, trace: Vec::new() }
}

/// Recover the thrown `Value` from a caught `ScriptError::Thrown`, or
/// `None` for every other kind (those never carried a script value).
pub fn thrown_value(err: &ScriptError) -> Option<Value> {
    match err {
        ScriptError::Thrown { bits, .. } => Some(Value(*bits)),
        _ => None,
    }
}

/// `"script:line:col: funcname"` (§4.10 `unwind`, §7 propagation).
pub fn trace_frame(script_name: &str, line: u32, col: u32, function_name: &str) -> String {
    format!("{script_name}:{line}:{col}: {function_name}")
}

/// `"[native]: <name>"` (§7, errors raised inside `call_native`).
pub fn native_frame(name: &str) -> String {
    format!("[native]: {name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thrown_value_round_trips_through_bits() {
        let v = Value::number(42.0);
        let err = throw(v);
        assert_eq!(thrown_value(&err).unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn non_thrown_errors_have_no_value() {
        assert!(thrown_value(&ScriptError::type_error("bad")).is_none());
    }
}
