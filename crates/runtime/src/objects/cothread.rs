//! Cothread objects (§3.2, §4.10, §9): `{ stack, stack_frames, xp }`, a
//! stackful fiber with its own value stack and frame stack, resumed
//! synchronously by `CALL`/`YIELD` rather than scheduled by the OS.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::call_stack::StackFrame;
use crate::heap::{Heap, ObjectHeader, ObjectKind};
use crate::objects;
use crate::value::Value;

pub struct CothreadData {
    pub stack: RefCell<Vec<Value>>,
    pub frames: RefCell<Vec<StackFrame>>,
    /// Top-of-stack marker used across safepoints: `xp >= frames.back().fp`
    /// and `xp <= stack.len()` always hold while a frame is live (§3.2).
    pub xp: Cell<u32>,
}

fn data(ptr: NonNull<ObjectHeader>) -> &'static CothreadData {
    unsafe { objects::body::<CothreadData>(ptr).as_ref() }
}

pub fn new(heap: &Heap, color: u8) -> NonNull<ObjectHeader> {
    heap.alloc(
        ObjectKind::Cothread,
        color,
        CothreadData { stack: RefCell::new(Vec::new()), frames: RefCell::new(Vec::new()), xp: Cell::new(0) },
    )
}

/// A cothread is done once its frame stack has emptied (§3.5 "Cothreads ...
/// die when their frame stack empties").
pub fn is_done(ptr: NonNull<ObjectHeader>) -> bool {
    data(ptr).frames.borrow().is_empty()
}

pub fn frame_count(ptr: NonNull<ObjectHeader>) -> usize {
    data(ptr).frames.borrow().len()
}

pub fn push_frame(ptr: NonNull<ObjectHeader>, frame: StackFrame) {
    data(ptr).frames.borrow_mut().push(frame);
}

pub fn pop_frame(ptr: NonNull<ObjectHeader>) -> Option<StackFrame> {
    data(ptr).frames.borrow_mut().pop()
}

pub fn top_frame(ptr: NonNull<ObjectHeader>) -> Option<StackFrame> {
    data(ptr).frames.borrow().last().copied()
}

/// Write the top frame's saved `ip` back, e.g. before a safepoint or a
/// nested call (§4.10).
pub fn set_top_ip(ptr: NonNull<ObjectHeader>, ip: u32) {
    if let Some(f) = data(ptr).frames.borrow_mut().last_mut() {
        f.ip = ip;
    }
}

/// Replace the top frame outright, e.g. `YIELD` updating its own saved
/// `ip`/`xr`/`xb` for the next resume in one step.
pub fn set_top_frame(ptr: NonNull<ObjectHeader>, frame: StackFrame) {
    if let Some(f) = data(ptr).frames.borrow_mut().last_mut() {
        *f = frame;
    }
}

pub fn stack_len(ptr: NonNull<ObjectHeader>) -> usize {
    data(ptr).stack.borrow().len()
}

pub fn stack_get(ptr: NonNull<ObjectHeader>, index: usize) -> Value {
    data(ptr).stack.borrow()[index]
}

pub fn stack_set(ptr: NonNull<ObjectHeader>, index: usize, value: Value) {
    data(ptr).stack.borrow_mut()[index] = value;
}

/// Grow the stack so slots `0..len` are valid, padding new slots with null.
pub fn ensure_stack_len(ptr: NonNull<ObjectHeader>, len: usize) {
    let mut stack = data(ptr).stack.borrow_mut();
    if stack.len() < len {
        stack.resize(len, Value::null());
    }
}

pub fn stack_push(ptr: NonNull<ObjectHeader>, value: Value) {
    data(ptr).stack.borrow_mut().push(value);
}

pub fn stack_truncate(ptr: NonNull<ObjectHeader>, len: usize) {
    data(ptr).stack.borrow_mut().truncate(len);
}

pub fn xp(ptr: NonNull<ObjectHeader>) -> u32 {
    data(ptr).xp.get()
}

pub fn set_xp(ptr: NonNull<ObjectHeader>, xp: u32) {
    data(ptr).xp.set(xp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_stack::ResumeKind;
    use crate::heap::Heap;

    #[test]
    fn frame_push_pop_and_done() {
        let heap = Heap::new();
        let co = new(&heap, 0);
        assert!(is_done(co));

        let function = heap.alloc::<u64>(ObjectKind::Program, 0, 0);
        push_frame(co, StackFrame::new(function, 0, 0, ResumeKind::Yield, 0, 0));
        assert!(!is_done(co));
        assert_eq!(frame_count(co), 1);

        let popped = pop_frame(co).unwrap();
        assert_eq!(popped.resume, ResumeKind::Yield);
        assert!(is_done(co));
    }

    #[test]
    fn stack_grows_and_indexes() {
        let heap = Heap::new();
        let co = new(&heap, 0);
        ensure_stack_len(co, 4);
        stack_set(co, 2, Value::number(9.0));
        assert_eq!(stack_get(co, 2).as_number(), Some(9.0));
        assert_eq!(stack_len(co), 4);
    }
}
