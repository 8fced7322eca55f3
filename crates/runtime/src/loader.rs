//! The `code_script` reader (§6.1): the counterpart to `kenaf-compiler`'s
//! `code_unit::pack_script`. Agrees byte-for-byte with that module's
//! choices, in particular the 12-byte `constants[]` entry layout
//! (`text: u32` then either a little-endian `f64` or a `size: u32` left-
//! aligned in the remaining 8 bytes).

use std::ptr::NonNull;

use kenaf_compiler::bytecode::Instr;

use crate::error::ScriptError;
use crate::heap::{Heap, ObjectHeader};
use crate::objects::lookup::Selector;
use crate::objects::{program, script};
use crate::value::Value;

const MAGIC: u32 = 0x5D2A_2A5B;

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32, ScriptError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn u16(&mut self) -> Result<u16, ScriptError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    fn u8(&mut self) -> Result<u8, ScriptError> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ScriptError> {
        let end = self.pos.checked_add(n).ok_or_else(|| ScriptError::value("truncated code_script"))?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| ScriptError::value("truncated code_script"))?;
        self.pos = end;
        Ok(slice)
    }

}

struct RawConstant {
    is_number: bool,
    number: f64,
    str_offset: u32,
    str_size: u32,
}

struct RawFunction {
    ops: Vec<Instr>,
    constants: Vec<RawConstant>,
    selector_names: Vec<(u32, u32)>,
    nested: Vec<u32>,
    outenv_count: u8,
    param_count: u8,
    stack_size: u8,
    code_flags: u8,
    name_offset: u32,
    slocs: Vec<u32>,
}

fn read_function(r: &mut Reader) -> Result<RawFunction, ScriptError> {
    let _code_size = r.u32()?;
    let op_count = r.u16()? as usize;
    let constant_count = r.u16()? as usize;
    let selector_count = r.u16()? as usize;
    let function_count = r.u16()? as usize;
    let outenv_count = r.u8()?;
    let param_count = r.u8()?;
    let stack_size = r.u8()?;
    let code_flags = r.u8()?;

    let mut ops = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        let word = r.u32()?;
        ops.push(Instr::from_u32(word).map_err(|tag| ScriptError::value(format!("bad opcode byte {tag}")))?);
    }

    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        let text = r.u32()?;
        let payload = r.take(8)?;
        if text == u32::MAX {
            let number = f64::from_le_bytes(payload[..8].try_into().unwrap());
            constants.push(RawConstant { is_number: true, number, str_offset: 0, str_size: 0 });
        } else {
            let size = u32::from_le_bytes(payload[..4].try_into().unwrap());
            constants.push(RawConstant { is_number: false, number: 0.0, str_offset: text, str_size: size });
        }
    }

    let mut selector_names = Vec::with_capacity(selector_count);
    for _ in 0..selector_count {
        let text = r.u32()?;
        let size = r.u32()?;
        selector_names.push((text, size));
    }

    let mut nested = Vec::with_capacity(function_count);
    for _ in 0..function_count {
        nested.push(r.u32()?);
    }

    // code_debug_function
    let _debug_code_size = r.u32()?;
    let name_offset = r.u32()?;
    let sloc_count = r.u32()? as usize;
    let variable_count = r.u32()? as usize;
    let var_span_count = r.u32()? as usize;
    let mut slocs = Vec::with_capacity(sloc_count);
    for _ in 0..sloc_count {
        slocs.push(r.u32()?);
    }
    for _ in 0..variable_count {
        r.take(4)?; // { name: u24, r: u8 }
    }
    for _ in 0..var_span_count {
        r.take(12)?; // { variable_index u32; lower u32; upper u32 }
    }

    Ok(RawFunction {
        ops,
        constants,
        selector_names,
        nested,
        outenv_count,
        param_count,
        stack_size,
        code_flags,
        name_offset,
        slocs,
    })
}

/// Load a packed `code_script` blob (§6.1) into a script object plus one
/// program object per `code_function` record, wiring up each program's
/// nested-function table once every program exists.
pub fn load_script(
    heap: &Heap,
    color: u8,
    intern_string: &mut dyn FnMut(&[u8]) -> NonNull<ObjectHeader>,
    bytes: &[u8],
) -> Result<NonNull<ObjectHeader>, ScriptError> {
    let mut r = Reader::new(bytes);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(ScriptError::value("not a kenaf code_script (bad magic)"));
    }
    let _code_size = r.u32()?;
    let _function_size = r.u32()?;
    let function_count = r.u32()? as usize;
    let heap_size = r.u32()?;
    let debug_script_name = r.u32()?;
    let debug_newline_count = r.u32()? as usize;
    let debug_heap_size = r.u32()?;

    let mut raw_functions = Vec::with_capacity(function_count);
    for _ in 0..function_count {
        raw_functions.push(read_function(&mut r)?);
    }

    let heap_pool = r.take(heap_size as usize)?;
    let mut newlines = Vec::with_capacity(debug_newline_count);
    for _ in 0..debug_newline_count {
        newlines.push(r.u32()?);
    }
    let debug_heap_pool = r.take(debug_heap_size as usize)?;

    let script_name = name_at(debug_heap_pool, debug_script_name)?;
    let script_obj = script::new(heap, color, script_name, newlines);

    let mut programs = Vec::with_capacity(raw_functions.len());
    for f in &raw_functions {
        let mut constants = Vec::with_capacity(f.constants.len());
        for c in &f.constants {
            if c.is_number {
                constants.push(Value::number(c.number));
            } else {
                let bytes = heap_pool
                    .get(c.str_offset as usize..c.str_offset as usize + c.str_size as usize)
                    .ok_or_else(|| ScriptError::value("bad constant string offset"))?;
                constants.push(Value::string(intern_string(bytes)));
            }
        }

        let selectors: Vec<Selector> = f.selector_names.iter().map(|_| Selector::empty()).collect();
        let mut selector_keys = Vec::with_capacity(f.selector_names.len());
        for &(offset, size) in &f.selector_names {
            let bytes = heap_pool
                .get(offset as usize..offset as usize + size as usize)
                .ok_or_else(|| ScriptError::value("bad selector name offset"))?;
            selector_keys.push(intern_string(bytes));
        }
        let name = name_at(debug_heap_pool, f.name_offset)?;

        let program = program::new(
            heap,
            color,
            crate::objects::ProgramData {
                ops: f.ops.clone().into_boxed_slice(),
                constants: constants.into_boxed_slice(),
                selectors: std::cell::RefCell::new(selectors.into_boxed_slice()),
                functions: std::cell::RefCell::new(Vec::new()),
                script: script_obj,
                name,
                outenv_count: f.outenv_count,
                param_count: f.param_count,
                stack_size: f.stack_size,
                code_flags: f.code_flags,
                selector_keys: selector_keys.into_boxed_slice(),
                slocs: f.slocs.clone().into_boxed_slice(),
            },
        );
        programs.push(program);
    }

    for (i, f) in raw_functions.iter().enumerate() {
        let nested: Vec<NonNull<ObjectHeader>> = f
            .nested
            .iter()
            .map(|&idx| {
                programs
                    .get(idx as usize)
                    .copied()
                    .ok_or_else(|| ScriptError::value("nested function index out of range"))
            })
            .collect::<Result<_, _>>()?;
        program::set_functions(programs[i], nested);
    }

    programs
        .first()
        .copied()
        .ok_or_else(|| ScriptError::value("code_script has no functions"))
}

/// Read one `debug_heap`-pooled name: a little-endian `u32` length at
/// `offset`, followed immediately by that many UTF-8 bytes
/// (`code_unit::Heap::intern_prefixed`'s format). Used for both
/// `debug_script_name` and `code_debug_function.function_name`, neither of
/// which carries a sibling length field of its own.
fn name_at(pool: &[u8], offset: u32) -> Result<String, ScriptError> {
    let start = offset as usize;
    let len_bytes = pool.get(start..start + 4).ok_or_else(|| ScriptError::value("bad debug name offset"))?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    let name_start = start + 4;
    let slice = pool
        .get(name_start..name_start + len)
        .ok_or_else(|| ScriptError::value("bad debug name offset"))?;
    std::str::from_utf8(slice).map(|s| s.to_string()).map_err(|_| ScriptError::value("non-utf8 debug name"))
}
