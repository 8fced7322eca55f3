//! Integer-ish arithmetic helpers shared by constant folding and the VM.
//!
//! kenaf numbers are always `f64`; there is no separate integer type. Bitwise
//! and shift operators coerce their operands through a 32-bit wrapping
//! conversion (`number -> i32 -> operate -> f64`), and `//`/`%` use
//! floor division/modulo rather than truncating division/remainder, so that
//! `-7 // 2 == -4` and `-7 % 2 == 1` (the sign follows the divisor, not the
//! dividend). Both the folder and the interpreter call these so constant
//! folding a division produces bit-identical results to evaluating it at
//! runtime.

/// Coerce a kenaf number to the 32-bit wrapping integer used by bitwise ops.
///
/// Values outside `i32`'s range truncate; `NaN` and infinities become `0`,
/// matching the saturating-to-zero behaviour of a C `(int32_t)` cast from a
/// `double` that is out of range, as the original interpreter relies on.
pub fn to_i32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    // Truncate toward zero first (as the C cast does), wrapping into i32
    // range with the low 32 bits of the truncated magnitude.
    let truncated = n.trunc();
    if truncated >= -(2f64.powi(31)) && truncated < 2f64.powi(31) {
        truncated as i32
    } else {
        let wrapped = (truncated.rem_euclid(2f64.powi(32))) as u32;
        wrapped as i32
    }
}

/// Floor division: `a // b`. Panics-free; callers check `b == 0` separately
/// (that is a `Value` error, not an arithmetic one).
pub fn floor_div(a: f64, b: f64) -> f64 {
    (a / b).floor()
}

/// Floor modulo: `a % b`, with the result taking the sign of `b`.
pub fn floor_mod(a: f64, b: f64) -> f64 {
    let r = a - floor_div(a, b) * b;
    // Guard against floating point drift putting r on the wrong side of 0
    // when a/b is exact.
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

pub fn lshift(a: f64, b: f64) -> f64 {
    let shift = (to_i32(b) as u32) & 31;
    ((to_i32(a) as u32) << shift) as i32 as f64
}

/// Logical (unsigned) right shift.
pub fn rshift(a: f64, b: f64) -> f64 {
    let shift = (to_i32(b) as u32) & 31;
    ((to_i32(a) as u32) >> shift) as f64
}

/// Arithmetic (sign-extending) right shift.
pub fn ashift(a: f64, b: f64) -> f64 {
    let shift = (to_i32(b) as u32) & 31;
    (to_i32(a) >> shift) as f64
}

pub fn bitand(a: f64, b: f64) -> f64 {
    ((to_i32(a) as u32) & (to_i32(b) as u32)) as f64
}

pub fn bitor(a: f64, b: f64) -> f64 {
    ((to_i32(a) as u32) | (to_i32(b) as u32)) as f64
}

pub fn bitxor(a: f64, b: f64) -> f64 {
    ((to_i32(a) as u32) ^ (to_i32(b) as u32)) as f64
}

pub fn bitnot(a: f64) -> f64 {
    (!(to_i32(a) as u32)) as i32 as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_div_rounds_toward_negative_infinity() {
        assert_eq!(floor_div(-7.0, 2.0), -4.0);
        assert_eq!(floor_div(7.0, 2.0), 3.0);
    }

    #[test]
    fn floor_mod_takes_sign_of_divisor() {
        assert_eq!(floor_mod(-7.0, 2.0), 1.0);
        assert_eq!(floor_mod(7.0, -2.0), -1.0);
    }

    #[test]
    fn shifts_mask_to_5_bits() {
        assert_eq!(lshift(1.0, 33.0), lshift(1.0, 1.0));
    }

    #[test]
    fn bitnot_round_trips() {
        assert_eq!(bitnot(bitnot(5.0)), 5.0);
    }
}
