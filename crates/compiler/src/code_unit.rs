//! `code_unit`: binary packing of compiled IR into the `code_script` wire
//! format (§6.1).
//!
//! Two byte pools span the whole script: `heap` holds every string
//! constant's raw bytes (each function's `constants[]` entries reference
//! it by offset) and `debug_heap` holds every debug name (the script
//! name, each function's name). Everything else -- instructions, the
//! constant/selector tables, nested-function indices, debug slocs -- is
//! scoped per function, matching `code_function`'s layout; `ir_foldk`
//! builds a fresh `ConstTable`/`SelectorTable` for each function rather
//! than sharing one across the script, for exactly this reason.
//!
//! Two gaps against a from-source pipeline, left as genuine gaps rather
//! than papered over with fabricated data: this compiler has no lexer of
//! its own (callers hand it an already-built `AstModule`), so the
//! script-level newline table (`debug_newline_count`/`debug_newlines`) is
//! always empty; and `ir_build` doesn't thread per-local debug names or
//! lexical spans through to the IR, so every function's `variable_count`/
//! `var_span_count` are zero.
//!
//! Byte layout for the one place the prose spec leaves a union's padding
//! unspecified: a `constants[]` entry is fixed at 12 bytes -- `text: u32`
//! then an 8-byte slot that is either a little-endian `f64` (number) or a
//! `size: u32` left-aligned in that slot with the remaining 4 bytes zero
//! (string, `text != u32::MAX` in that case). No other reader depends on
//! this format; `loader.rs` in the runtime crate is the only consumer and
//! agrees with this choice.
//!
//! A second implicit-format choice: `debug_script_name` and
//! `code_debug_function.function_name` are bare offsets into `debug_heap`
//! with no accompanying length field, so `debug_heap.intern_prefixed`
//! writes a little-endian `u32` length immediately before each name's
//! bytes rather than packing names back-to-back with no delimiter.
//! `loader.rs` reads that length first.

use crate::ir::{ConstValue, IrFunction};
use crate::ir_emit::Emitted;
use crate::ir_foldk::{ConstTable, SelectorTable};

const MAGIC: u32 = 0x5D2A_2A5B;
const FLAG_VARARGS: u8 = 1 << 0;
const FLAG_GENERATOR: u8 = 1 << 1;

/// An append-only byte pool; `intern` always appends (no dedup -- the
/// dedup already happened one level up, in `ConstTable`/`SelectorTable`).
#[derive(Default)]
struct Heap {
    bytes: Vec<u8>,
}

impl Heap {
    fn intern(&mut self, s: &str) -> (u32, u32) {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        (offset, s.len() as u32)
    }

    /// Like `intern`, but self-describing: a `u32` length precedes the
    /// bytes, so a reader holding only the returned offset (as
    /// `debug_script_name`/`code_debug_function.function_name` are, with
    /// no sibling length field) can still recover the name.
    fn intern_prefixed(&mut self, s: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(s.as_bytes());
        offset
    }
}

/// Everything the compiler pipeline produced for one function, ready to
/// pack into a `code_function` record.
pub struct CompiledFunction<'a> {
    pub ir: &'a IrFunction,
    pub emitted: &'a Emitted,
    pub constants: &'a ConstTable,
    pub selectors: &'a SelectorTable,
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn pack_debug_function(cf: &CompiledFunction, debug_heap: &mut Heap) -> Vec<u8> {
    let name_off = debug_heap.intern_prefixed(&cf.ir.name);
    let sloc_count = cf.emitted.slocs.len() as u32;

    let mut body = Vec::new();
    push_u32(&mut body, name_off);
    push_u32(&mut body, sloc_count);
    push_u32(&mut body, 0); // variable_count (no per-local debug tracking)
    push_u32(&mut body, 0); // var_span_count
    for &sloc in &cf.emitted.slocs {
        push_u32(&mut body, sloc);
    }

    let code_size = (4 + body.len()) as u32; // own `code_size` field included
    let mut out = Vec::with_capacity(body.len() + 4);
    push_u32(&mut out, code_size);
    out.extend_from_slice(&body);
    out
}

fn pack_function(
    cf: &CompiledFunction,
    heap: &mut Heap,
    debug_heap: &mut Heap,
) -> Result<Vec<u8>, crate::error::CompileError> {
    let mut body = Vec::new();

    for instr in &cf.emitted.instrs {
        push_u32(&mut body, instr.to_u32());
    }

    for value in &cf.constants.values {
        match value {
            ConstValue::Number(bits) => {
                push_u32(&mut body, u32::MAX);
                body.extend_from_slice(&bits.to_le_bytes());
            }
            ConstValue::Str(sidx) => {
                let s = &cf.constants.strings[*sidx as usize];
                let (offset, size) = heap.intern(s);
                push_u32(&mut body, offset);
                push_u32(&mut body, size);
                body.extend_from_slice(&[0u8; 4]);
            }
        }
    }

    for name in &cf.selectors.names {
        let (offset, size) = heap.intern(name);
        push_u32(&mut body, offset);
        push_u32(&mut body, size);
    }

    for nested in &cf.ir.functions {
        push_u32(&mut body, nested.0);
    }

    body.extend_from_slice(&pack_debug_function(cf, debug_heap));

    let op_count: u16 = cf.emitted.instrs.len().try_into().map_err(|_| {
        crate::error::CompileError::Emit(format!(
            "function {} has more than 65535 instructions",
            cf.ir.name
        ))
    })?;
    let constant_count: u16 = cf.constants.values.len().try_into().map_err(|_| {
        crate::error::CompileError::TableOverflow(format!(
            "function {} constant table exceeds 65535 entries",
            cf.ir.name
        ))
    })?;
    let selector_count: u16 = cf.selectors.names.len().try_into().map_err(|_| {
        crate::error::CompileError::TableOverflow(format!(
            "function {} selector table exceeds 65535 entries",
            cf.ir.name
        ))
    })?;
    let function_count: u16 = cf.ir.functions.len().try_into().map_err(|_| {
        crate::error::CompileError::Emit(format!(
            "function {} references more than 65535 nested functions",
            cf.ir.name
        ))
    })?;

    let mut flags = 0u8;
    if cf.ir.is_varargs {
        flags |= FLAG_VARARGS;
    }
    if cf.ir.is_generator {
        flags |= FLAG_GENERATOR;
    }

    let mut header = Vec::new();
    push_u16(&mut header, op_count);
    push_u16(&mut header, constant_count);
    push_u16(&mut header, selector_count);
    push_u16(&mut header, function_count);
    header.push(cf.ir.outenv_count.min(u8::MAX as u32) as u8);
    header.push(cf.ir.param_count.min(u8::MAX as u32) as u8);
    header.push(cf.ir.stack_size.min(u8::MAX as u32) as u8);
    header.push(flags);

    let code_size = (4 + header.len() + body.len()) as u32; // own `code_size` field included
    let mut out = Vec::with_capacity(4 + header.len() + body.len());
    push_u32(&mut out, code_size);
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Pack a whole module's compiled functions into a `code_script` blob.
/// `functions` must be in the same order as the originating `AstModule`'s
/// flat function table, since each `code_function`'s nested-function
/// indices and `NewFunction` operands both assume that ordering.
pub fn pack_script(
    script_name: &str,
    functions: &[CompiledFunction],
) -> Result<Vec<u8>, crate::error::CompileError> {
    let mut heap = Heap::default();
    let mut debug_heap = Heap::default();

    let mut function_records = Vec::with_capacity(functions.len());
    for cf in functions {
        function_records.push(pack_function(cf, &mut heap, &mut debug_heap)?);
    }
    let function_size: u32 = function_records.iter().map(|r| r.len() as u32).sum();

    let debug_script_name = debug_heap.intern_prefixed(script_name);

    let mut out = Vec::new();
    push_u32(&mut out, MAGIC);

    let code_size = 7 * 4 // the code_script header fields below `code_size` itself, plus itself
        + function_size
        + heap.bytes.len() as u32
        + 0 // debug_newline_count entries
        + debug_heap.bytes.len() as u32;
    push_u32(&mut out, code_size);
    push_u32(&mut out, function_size);
    push_u32(&mut out, functions.len() as u32);
    push_u32(&mut out, heap.bytes.len() as u32);
    push_u32(&mut out, debug_script_name);
    push_u32(&mut out, 0); // debug_newline_count: no lexer stage in this pipeline
    push_u32(&mut out, debug_heap.bytes.len() as u32);

    for record in function_records {
        out.extend_from_slice(&record);
    }
    out.extend_from_slice(&heap.bytes);
    // debug_newlines[0] -- empty
    out.extend_from_slice(&debug_heap.bytes);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SrcLoc;
    use crate::bytecode::{Instr, OpCode};
    use crate::ir::{Block, BlockIndex, BlockKind, Op, Opcode, Operand};

    fn trivial_function(name: &str) -> (IrFunction, Emitted, ConstTable, SelectorTable) {
        let mut f = IrFunction::new(name);
        f.blocks.push(Block::new(BlockKind::Basic, crate::ir::OpIndex(0)));
        let c = f.const_number(7.0);
        let mut op = Op::new(Opcode::Const, SrcLoc(0)).with_operands(vec![Operand::Number(c)]);
        op.r = Some(0);
        op.use_count = 1;
        f.push_op(op);
        let mut ret = Op::new(Opcode::Return, SrcLoc(0));
        ret.unpack = Some(1);
        ret.operands = vec![Operand::Pin(crate::ir::OpIndex(0))];
        ret.s = Some(0);
        f.push_op(ret);
        f.blocks[BlockIndex(0)].upper = crate::ir::OpIndex(f.ops.len() as u32);
        f.blocks[BlockIndex(0)].reachable = true;
        f.stack_size = 1;

        let mut constants = ConstTable::default();
        let mut selectors = SelectorTable::default();
        crate::ir_foldk::fold_constants_and_build_tables(&mut f, &mut constants, &mut selectors)
            .unwrap();

        let emitted = Emitted {
            instrs: vec![
                Instr::c(OpCode::Ldk, 0, 0),
                Instr::ab(OpCode::Return, 0, 1, 0),
            ],
            slocs: vec![0, 0],
        };
        (f, emitted, constants, selectors)
    }

    #[test]
    fn packed_script_starts_with_magic_and_reports_function_count() {
        let (f, emitted, constants, selectors) = trivial_function("main");
        let cf = CompiledFunction { ir: &f, emitted: &emitted, constants: &constants, selectors: &selectors };
        let bytes = pack_script("script", &[cf]).unwrap();

        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), MAGIC);
        let function_count = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(function_count, 1);
    }

    #[test]
    fn constant_table_number_entries_use_max_sentinel_for_text() {
        let (f, emitted, constants, selectors) = trivial_function("main");
        let cf = CompiledFunction { ir: &f, emitted: &emitted, constants: &constants, selectors: &selectors };
        let record = pack_function(&cf, &mut Heap::default(), &mut Heap::default()).unwrap();

        // code_size(4) + [op/constant/selector/function_count u16 x4 (8) +
        // outenv/param/stack/flags u8 x4 (4)] (12) + ops
        let ops_bytes = emitted.instrs.len() * 4;
        let const_entry_off = 4 + 12 + ops_bytes;
        let text = u32::from_le_bytes(record[const_entry_off..const_entry_off + 4].try_into().unwrap());
        assert_eq!(text, u32::MAX);
    }
}
