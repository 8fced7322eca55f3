//! Call frames (§4.10): one `StackFrame` per activation on a cothread's
//! frame stack, recording where to resume and how `call_return` should
//! behave when this frame finishes.

use std::ptr::NonNull;

use crate::heap::ObjectHeader;

/// `xr` sentinel meaning "collect every result the callee produces"
/// (host-initiated calls, §6.4) rather than a fixed arity.
pub const EXPECT_ALL: u32 = u32::MAX;

/// How a frame was entered, and therefore what `call_return`/`call_yield`
/// must do when it's this frame's turn to resume (§4.10).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResumeKind {
    /// A plain call: results replace the call's argument window.
    Call,
    /// Resuming a generator after a `yield`: results are handed to
    /// whichever `for` loop or explicit `resume` drove the cothread.
    Yield,
    /// A `new` expression: an omitted/non-object return keeps the
    /// freshly-constructed `self` instead of the callee's result.
    Construct,
    /// An implicit iterator call inside a `for` loop: on return, the loop
    /// either continues (truthy first result) or exits (falsey/no result).
    ForEach,
}

/// One activation record (§4.10): `{ function, bp, fp, ip, resume, xr, xb,
/// rr }`. `bp`/`fp` bound this frame's window on the cothread's value
/// stack; `ip` is the saved bytecode offset to resume at.
#[derive(Clone, Copy)]
pub struct StackFrame {
    pub function: NonNull<ObjectHeader>,
    /// Base pointer: index of this frame's first stack slot.
    pub bp: usize,
    /// Frame pointer: index one past this frame's last local slot, where
    /// the callee's own window begins.
    pub fp: usize,
    /// Saved bytecode offset, in units of `Instr` (§4.9).
    pub ip: u32,
    pub resume: ResumeKind,
    /// Where the caller's expected-results window begins (`xr` results
    /// requested, based at `xb`) so `call_return` can pad or truncate.
    pub xr: u32,
    pub xb: usize,
    /// The prototype currently being searched for `super`, if this frame
    /// is a method body (§4.1).
    pub rr: Option<NonNull<ObjectHeader>>,
    /// Count of extra arguments supplied beyond `param_count` to a varargs
    /// function, left in place at registers `param_count+1..` rather than
    /// physically rotated below `bp` the way §4.10's prose describes --
    /// `VARARG` reads them directly from there. A simplification of the
    /// spec's rotation scheme that avoids a memmove per call; see DESIGN.md.
    pub varargs: u8,
}

impl StackFrame {
    pub fn new(function: NonNull<ObjectHeader>, bp: usize, fp: usize, resume: ResumeKind, xr: u32, xb: usize) -> Self {
        StackFrame { function, bp, fp, ip: 0, resume, xr, xb, rr: None, varargs: 0 }
    }
}
