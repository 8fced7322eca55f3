//! Function objects (§3.2): `{ program, omethod, outenvs }` for
//! script-defined functions, and `{ native_fn_ptr, cookie, param_count,
//! code_flags, name }` for host-provided natives (§6.4).

use std::cell::RefCell;
use std::ptr::NonNull;

use kenaf_core::ScriptError;

use crate::heap::{Heap, ObjectHeader, ObjectKind};
use crate::objects;
use crate::value::Value;

pub struct FunctionData {
    pub program: NonNull<ObjectHeader>,
    /// The enclosing lookup used to resolve `super` (§4.1's
    /// `implicit_super`), present only on methods. Bound either at
    /// construction (prototype `self` entries) or later by `F_METHOD`
    /// (§4.7), so this is write-once rather than fixed at birth.
    pub omethod: RefCell<Option<NonNull<ObjectHeader>>>,
    pub outenvs: RefCell<Vec<NonNull<ObjectHeader>>>,
}

/// A host callback (§6.4): `fn(cookie, frame, args) -> results`.
pub type NativeFn = fn(cookie: u64, args: &[Value]) -> Result<Vec<Value>, ScriptError>;

pub struct NativeFunctionData {
    pub native_fn: NativeFn,
    pub cookie: u64,
    pub param_count: u32,
    pub code_flags: u8,
    pub name: String,
}

fn function_data(ptr: NonNull<ObjectHeader>) -> &'static FunctionData {
    unsafe { objects::body::<FunctionData>(ptr).as_ref() }
}

fn native_data(ptr: NonNull<ObjectHeader>) -> &'static NativeFunctionData {
    unsafe { objects::body::<NativeFunctionData>(ptr).as_ref() }
}

pub fn new(
    heap: &Heap,
    color: u8,
    program: NonNull<ObjectHeader>,
    omethod: Option<NonNull<ObjectHeader>>,
    outenv_count: usize,
) -> NonNull<ObjectHeader> {
    heap.alloc(
        ObjectKind::Function,
        color,
        FunctionData {
            program,
            omethod: RefCell::new(omethod),
            outenvs: RefCell::new(Vec::with_capacity(outenv_count)),
        },
    )
}

pub fn new_native(heap: &Heap, color: u8, data: NativeFunctionData) -> NonNull<ObjectHeader> {
    heap.alloc(ObjectKind::NativeFunction, color, data)
}

pub fn program(ptr: NonNull<ObjectHeader>) -> NonNull<ObjectHeader> {
    function_data(ptr).program
}

pub fn omethod(ptr: NonNull<ObjectHeader>) -> Option<NonNull<ObjectHeader>> {
    *function_data(ptr).omethod.borrow()
}

/// Bind a closure's `omethod` after construction (`F_METHOD`, §4.7). Write-once:
/// a closure is bound to at most one enclosing lookup.
pub fn set_omethod(ptr: NonNull<ObjectHeader>, omethod: NonNull<ObjectHeader>) {
    *function_data(ptr).omethod.borrow_mut() = Some(omethod);
}

/// Bind the closure's `index`th outenv (§4.7's `F_OUTENV`/`F_VARENV`).
pub fn push_outenv(ptr: NonNull<ObjectHeader>, env: NonNull<ObjectHeader>) {
    function_data(ptr).outenvs.borrow_mut().push(env);
}

pub fn outenv(ptr: NonNull<ObjectHeader>, index: usize) -> NonNull<ObjectHeader> {
    function_data(ptr).outenvs.borrow()[index]
}

pub fn native_call(ptr: NonNull<ObjectHeader>, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
    let n = native_data(ptr);
    (n.native_fn)(n.cookie, args)
}

pub fn native_param_count(ptr: NonNull<ObjectHeader>) -> u32 {
    native_data(ptr).param_count
}

pub fn native_name(ptr: NonNull<ObjectHeader>) -> &'static str {
    &native_data(ptr).name
}
