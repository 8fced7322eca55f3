//! End-to-end tests driving `Kenaf` against hand-assembled bytecode
//! (source-level parsing is out of scope, so these build `ProgramData`
//! directly rather than compiling kenaf source text).

use std::cell::RefCell;
use std::ptr::NonNull;

use kenaf_compiler::bytecode::{Instr, OpCode};
use kenaf_runtime::heap::ObjectHeader;
use kenaf_runtime::objects::program::{self, ProgramData, CODE_FLAG_GENERATOR, CODE_FLAG_VARARGS};
use kenaf_runtime::objects::{function, lookup, script};
use kenaf_runtime::{Kenaf, Value};

fn new_script(k: &Kenaf) -> NonNull<ObjectHeader> {
    script::new(&k.vm().heap, k.vm().collector.new_color(), "test".into(), Vec::new())
}

#[allow(clippy::too_many_arguments)]
fn make_program(
    k: &Kenaf,
    script: NonNull<ObjectHeader>,
    ops: Vec<Instr>,
    constants: Vec<Value>,
    selector_keys: Vec<NonNull<ObjectHeader>>,
    param_count: u8,
    stack_size: u8,
    code_flags: u8,
    outenv_count: u8,
) -> NonNull<ObjectHeader> {
    let color = k.vm().collector.new_color();
    let slocs = vec![0u32; ops.len()].into_boxed_slice();
    let selectors = vec![lookup::Selector::empty(); selector_keys.len()].into_boxed_slice();
    program::new(
        &k.vm().heap,
        color,
        ProgramData {
            ops: ops.into_boxed_slice(),
            constants: constants.into_boxed_slice(),
            selectors: RefCell::new(selectors),
            functions: RefCell::new(Vec::new()),
            script,
            name: "test".into(),
            outenv_count,
            param_count,
            stack_size,
            code_flags,
            selector_keys: selector_keys.into_boxed_slice(),
            slocs,
        },
    )
}

fn make_function(k: &Kenaf, prog: NonNull<ObjectHeader>) -> Value {
    Value::object(function::new(&k.vm().heap, k.vm().collector.new_color(), prog, None, 0))
}

fn make_method(k: &Kenaf, prog: NonNull<ObjectHeader>, omethod: NonNull<ObjectHeader>) -> Value {
    Value::object(function::new(&k.vm().heap, k.vm().collector.new_color(), prog, Some(omethod), 0))
}

#[test]
fn arithmetic_evaluates_a_small_expression() {
    // 1 + 2 * 3
    let k = Kenaf::new();
    let script = new_script(&k);
    let ops = vec![
        Instr::c(OpCode::Ldk, 1, 0),
        Instr::c(OpCode::Ldk, 2, 1),
        Instr::ab(OpCode::Mul, 2, 1, 2),
        Instr::c(OpCode::Ldk, 3, 2),
        Instr::ab(OpCode::Add, 1, 3, 2),
        Instr::ab(OpCode::Return, 1, 1, 0),
    ];
    let constants = vec![Value::number(2.0), Value::number(3.0), Value::number(1.0)];
    let prog = make_program(&k, script, ops, constants, Vec::new(), 0, 4, 0, 0);
    let entry = make_function(&k, prog);

    let results = k.call(entry, &[]).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_number(), Some(7.0));
}

#[test]
fn closure_captures_an_enclosing_local() {
    let k = Kenaf::new();
    let script = new_script(&k);

    // nested: return the captured value
    let nested_ops = vec![Instr::ab(OpCode::GetOutenv, 1, 0, 0), Instr::ab(OpCode::Return, 1, 1, 0)];
    let nested = make_program(&k, script, nested_ops, Vec::new(), Vec::new(), 0, 2, 0, 1);

    // outer: box 99 into a varenv cell, capture that cell into the
    // closure via F_VARENV, call it, return the result.
    let outer_ops = vec![
        Instr::c(OpCode::Ldk, 0, 0),           // r0 = 99.0
        Instr::c(OpCode::NewEnv, 1, 1),        // r1 = new env, 1 slot
        Instr::ab(OpCode::SetVarenv, 0, 1, 0), // r1[0] = r0
        Instr::c(OpCode::Function, 2, 0),      // r2 = closure over nested
        Instr::ab(OpCode::FVarenv, 2, 0, 1),   // r2's outenv 0 <- r1
        Instr::ab(OpCode::Call, 2, 0, 3),      // r3 = r2()
        Instr::ab(OpCode::Return, 3, 1, 0),
    ];
    let outer = make_program(&k, script, outer_ops, vec![Value::number(99.0)], Vec::new(), 0, 4, 0, 0);
    program::set_functions(outer, vec![nested]);
    let entry = make_function(&k, outer);

    let results = k.call(entry, &[]).unwrap();
    assert_eq!(results[0].as_number(), Some(99.0));
}

#[test]
fn generator_yields_then_finishes() {
    let k = Kenaf::new();
    let script = new_script(&k);
    let ops = vec![
        Instr::c(OpCode::Ldk, 1, 0),
        Instr::ab(OpCode::Yield, 1, 1, 0),
        Instr::c(OpCode::Ldk, 1, 1),
        Instr::ab(OpCode::Yield, 1, 1, 0),
        Instr::c(OpCode::Ldk, 1, 2),
        Instr::ab(OpCode::Return, 1, 1, 0),
    ];
    let constants = vec![Value::number(1.0), Value::number(2.0), Value::number(3.0)];
    let prog = make_program(&k, script, ops, constants, Vec::new(), 0, 2, CODE_FLAG_GENERATOR, 0);
    let entry = make_function(&k, prog);

    let created = k.call(entry, &[]).unwrap();
    assert_eq!(created.len(), 1);
    let cothread = created[0];

    let (first, done) = k.resume(cothread, &[]).unwrap();
    assert_eq!(first[0].as_number(), Some(1.0));
    assert!(!done);

    let (second, done) = k.resume(cothread, &[]).unwrap();
    assert_eq!(second[0].as_number(), Some(2.0));
    assert!(!done);

    let (third, done) = k.resume(cothread, &[]).unwrap();
    assert_eq!(third[0].as_number(), Some(3.0));
    assert!(done);
}

#[test]
fn prototype_construction_sets_a_field_on_a_fresh_instance() {
    let k = Kenaf::new();
    let script = new_script(&k);

    let value_key = k.vm().intern_string(b"value");
    // self(self, x): self.value = x
    let ctor_ops = vec![Instr::ab(OpCode::SetKey, 2, 1, 0), Instr::ab(OpCode::Return, 0, 0, 0)];
    let ctor_prog = make_program(&k, script, ctor_ops, Vec::new(), vec![value_key], 2, 3, 0, 0);
    let ctor = make_function(&k, ctor_prog);

    let proto = k.new_object(None).unwrap();
    k.set_key(proto, "self", ctor).unwrap();
    k.seal(proto).unwrap();

    let results = k.call(proto, &[Value::number(42.0)]).unwrap();
    assert_eq!(results.len(), 1);
    let instance = results[0];
    assert!(instance.is_object());
    assert_eq!(k.get_key(instance, "value").unwrap().as_number(), Some(42.0));
}

#[test]
fn varargs_and_array_unpack_round_trip_through_registers() {
    // fn(a, ...): (a) + ([...][0] + [...][1])
    let k = Kenaf::new();
    let script = new_script(&k);
    let ops = vec![
        Instr::ab(OpCode::Vararg, 2, 2, 0),
        Instr::ab(OpCode::NewArray, 4, 0, 0),
        Instr::ab(OpCode::Append, 2, 4, 0),
        Instr::ab(OpCode::Append, 3, 4, 0),
        Instr::ab(OpCode::Unpack, 5, 4, 2),
        Instr::ab(OpCode::Add, 7, 5, 6),
        Instr::ab(OpCode::Add, 8, 1, 7),
        Instr::ab(OpCode::Return, 8, 1, 0),
    ];
    let prog = make_program(&k, script, ops, Vec::new(), Vec::new(), 1, 9, CODE_FLAG_VARARGS, 0);
    let entry = make_function(&k, prog);

    let results = k.call(entry, &[Value::number(10.0), Value::number(5.0), Value::number(7.0)]).unwrap();
    assert_eq!(results[0].as_number(), Some(22.0));
}

#[test]
fn super_dispatch_reaches_the_parent_prototype() {
    let k = Kenaf::new();
    let script = new_script(&k);

    let parent = k.new_object(None).unwrap();
    k.set_key(parent, "greeting", Value::number(42.0)).unwrap();
    k.seal(parent).unwrap();

    let child = k.new_object(Some(parent)).unwrap();
    k.seal(child).unwrap();

    let greeting_key = k.vm().intern_string(b"greeting");
    // method(self): return super.greeting
    let method_ops = vec![
        Instr::ab(OpCode::Super, 1, 0, 0),
        Instr::ab(OpCode::GetKey, 2, 1, 0),
        Instr::ab(OpCode::Return, 2, 1, 0),
    ];
    let method_prog = make_program(&k, script, method_ops, Vec::new(), vec![greeting_key], 1, 3, 0, 0);
    let child_object = child.as_object().unwrap();
    let method = make_method(&k, method_prog, child_object);

    let results = k.call(method, &[child]).unwrap();
    assert_eq!(results[0].as_number(), Some(42.0));
}

#[test]
fn table_index_assignment_and_length() {
    let k = Kenaf::new();
    let script = new_script(&k);
    let ops = vec![
        Instr::ab(OpCode::NewTable, 1, 0, 0),
        Instr::c(OpCode::Ldk, 2, 0),
        Instr::c(OpCode::Ldk, 3, 1),
        Instr::ab(OpCode::SetIndex, 3, 1, 2),
        Instr::ab(OpCode::GetIndex, 4, 1, 2),
        Instr::ab(OpCode::Len, 5, 1, 0),
        Instr::ab(OpCode::Add, 6, 4, 5),
        Instr::ab(OpCode::Return, 6, 1, 0),
    ];
    let constants = vec![Value::number(1.0), Value::number(77.0)];
    let prog = make_program(&k, script, ops, constants, Vec::new(), 0, 7, 0, 0);
    let entry = make_function(&k, prog);

    let results = k.call(entry, &[]).unwrap();
    assert_eq!(results[0].as_number(), Some(78.0));
}
