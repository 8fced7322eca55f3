//! `ir_foldk`: constant inlining and final constant/selector table
//! construction (§4.5).
//!
//! Two jobs, run in order after `ir_live::analyze`:
//!
//!  1. **Inline**: for the handful of opcodes whose bytecode form has an
//!     immediate-constant variant (`ADD`/`SUB`/`MUL`/`CONCAT`/`EQ`/`NE`/
//!     `LT`/`LE`/`GET_INDEX`/`SET_INDEX`), rewrite an `Op(x)` operand to a
//!     direct `Number`/`Str` operand when `x` resolves to a `Const` whose
//!     use count drops to zero as a result (the value is then dead and
//!     `ir_emit` never has to materialize it into a register). `SUB x, k`
//!     is folded into `ADD x, -k` so the emitter only needs one
//!     immediate-add shape. Commutative ops put the constant second.
//!  2. **Table**: build the function's final constant pool -- numbers and
//!     strings interned with bit-exact identity (`-0.0 != 0.0`, via the
//!     `f64` bit pattern, never `PartialEq` on the float directly) -- plus
//!     the selector and nested-function tables, ready for `code_unit`'s
//!     binary layout (§6.1).
//!
//! A function may inline at most 255 constants (the immediate operand is
//! a single byte); the combined constant table may not exceed 65535
//! entries (`const_index` is 16 bits in the wire format). Both overflow
//! the pipeline with `CompileError::TableOverflow` rather than silently
//! truncating.

use std::collections::HashMap;

use crate::ast::FunctionIndex;
use crate::error::CompileError;
use crate::ir::{ConstValue, IrFunction, OpIndex, Opcode, Operand};

const MAX_INLINE_CONSTANTS_PER_FUNCTION: usize = 255;
const MAX_TABLE_SIZE: usize = 65535;

/// The final, deduplicated table a `code_function` references by index.
#[derive(Debug, Default, Clone)]
pub struct ConstTable {
    pub values: Vec<ConstValue>,
    pub strings: Vec<String>,
    number_index: HashMap<u64, u32>,
    string_index: HashMap<String, u32>,
}

impl ConstTable {
    pub fn insert_number(&mut self, v: f64) -> Result<u32, CompileError> {
        let bits = v.to_bits();
        if let Some(&i) = self.number_index.get(&bits) {
            return Ok(i);
        }
        if self.values.len() >= MAX_TABLE_SIZE {
            return Err(CompileError::TableOverflow(
                "constant table exceeds 65535 entries".to_string(),
            ));
        }
        let idx = self.values.len() as u32;
        self.values.push(ConstValue::number(v));
        self.number_index.insert(bits, idx);
        Ok(idx)
    }

    pub fn insert_string(&mut self, s: &str) -> Result<u32, CompileError> {
        if let Some(&i) = self.string_index.get(s) {
            return Ok(i);
        }
        if self.values.len() >= MAX_TABLE_SIZE {
            return Err(CompileError::TableOverflow(
                "constant table exceeds 65535 entries".to_string(),
            ));
        }
        let sidx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        let idx = self.values.len() as u32;
        self.values.push(ConstValue::Str(sidx));
        self.string_index.insert(s.to_string(), idx);
        Ok(idx)
    }
}

#[derive(Debug, Default, Clone)]
pub struct SelectorTable {
    pub names: Vec<String>,
    index: HashMap<String, u32>,
}

impl SelectorTable {
    pub fn insert(&mut self, name: &str) -> u32 {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let idx = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }
}

fn resolve(f: &IrFunction, mut op: OpIndex) -> OpIndex {
    loop {
        match f.ops[op].opcode {
            Opcode::Ref => match f.ops[op].operands.first() {
                Some(Operand::Op(next)) if *next != op => op = *next,
                _ => return op,
            },
            _ => return op,
        }
    }
}

/// What a resolved operand's constant is, if it's a `Const`.
enum Inline {
    Number(f64),
    Str(String),
}

fn inline_value(f: &IrFunction, op: OpIndex) -> Option<Inline> {
    let r = resolve(f, op);
    let o = &f.ops[r];
    if !matches!(o.opcode, Opcode::Const) {
        return None;
    }
    match o.operands.first()? {
        Operand::Number(c) => Some(Inline::Number(f.constants[c.0 as usize])),
        Operand::Str(c) => Some(Inline::Str(f.strings[c.0 as usize].clone())),
        _ => None,
    }
}

const INLINABLE: &[Opcode] = &[
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Concat,
    Opcode::Eq,
    Opcode::Ne,
    Opcode::Lt,
    Opcode::Le,
    Opcode::GetIndex,
    Opcode::SetIndex,
];

const COMMUTATIVE: &[Opcode] = &[Opcode::Add, Opcode::Mul, Opcode::Eq, Opcode::Ne];

/// Rewrite inlinable ops in place, returning the count of constants
/// inlined (used to enforce the per-function cap).
pub fn inline_constants(f: &mut IrFunction) -> Result<usize, CompileError> {
    let mut inlined = 0usize;
    let indices: Vec<OpIndex> = f.ops.indices().collect();

    for op_idx in indices {
        let opcode = f.ops[op_idx].opcode;
        if !INLINABLE.contains(&opcode) {
            continue;
        }
        // Dead ops (already folded away, use_count 0 and not pinned) have
        // nothing left to inline into.
        if f.ops[op_idx].operands.len() < 2 {
            continue;
        }

        let lhs = match f.ops[op_idx].operands[0] {
            Operand::Op(v) => Some(v),
            _ => None,
        };
        let rhs = match f.ops[op_idx].operands[1] {
            Operand::Op(v) => Some(v),
            _ => None,
        };

        // SUB x, k  ==>  ADD x, -k: only one immediate-add shape to emit.
        if matches!(opcode, Opcode::Sub) {
            if let Some(r) = rhs {
                if let Some(Inline::Number(k)) = inline_value(f, r) {
                    f.ops[op_idx].opcode = Opcode::Add;
                    f.ops[op_idx].operands[1] = Operand::Number(f.const_number(-k));
                    inlined += 1;
                    if inlined > MAX_INLINE_CONSTANTS_PER_FUNCTION {
                        return Err(CompileError::TableOverflow(
                            "function inlines more than 255 constants".to_string(),
                        ));
                    }
                    continue;
                }
            }
        }

        let commutative = COMMUTATIVE.contains(&opcode);

        // Prefer inlining the right-hand operand; for commutative ops,
        // swap a left-hand constant into that position first.
        let (a, b) = (lhs, rhs);
        let rhs_inline = rhs.and_then(|r| inline_value(f, r));
        if let Some(inline) = rhs_inline {
            apply_inline(f, op_idx, 1, inline);
            inlined += 1;
        } else if commutative {
            let lhs_inline = lhs.and_then(|l| inline_value(f, l));
            if let Some(inline) = lhs_inline {
                // swap operand order so the constant lands on the right
                if let Some(b_op) = b {
                    f.ops[op_idx].operands[0] = Operand::Op(b_op);
                }
                apply_inline(f, op_idx, 1, inline);
                inlined += 1;
            }
        }
        let _ = a;

        if inlined > MAX_INLINE_CONSTANTS_PER_FUNCTION {
            return Err(CompileError::TableOverflow(
                "function inlines more than 255 constants".to_string(),
            ));
        }
    }

    Ok(inlined)
}

fn apply_inline(f: &mut IrFunction, op_idx: OpIndex, slot: usize, inline: Inline) {
    f.ops[op_idx].operands[slot] = match inline {
        Inline::Number(n) => Operand::Number(f.const_number(n)),
        Inline::Str(s) => Operand::Str(f.const_string(s)),
    };
}

/// Build the final constant/selector tables for a function after
/// inlining, remapping every remaining `Number`/`Str`/`Selector` operand
/// to its index in the shared tables.
pub fn build_tables(
    f: &mut IrFunction,
    constants: &mut ConstTable,
    selectors: &mut SelectorTable,
) -> Result<(), CompileError> {
    let indices: Vec<OpIndex> = f.ops.indices().collect();
    for op_idx in indices {
        let operands = f.ops[op_idx].operands.clone();
        let mut remapped = Vec::with_capacity(operands.len());
        for operand in operands {
            let new_operand = match operand {
                Operand::Number(c) => {
                    let v = f.constants[c.0 as usize];
                    Operand::Number(crate::ir::ConstIndex(constants.insert_number(v)?))
                }
                Operand::Str(c) => {
                    let s = f.strings[c.0 as usize].clone();
                    Operand::Str(crate::ir::ConstIndex(constants.insert_string(&s)?))
                }
                Operand::Selector(c) => {
                    let name = f.selectors[c.0 as usize].clone();
                    Operand::Selector(crate::ir::SelectorIndex(selectors.insert(&name)))
                }
                other => other,
            };
            remapped.push(new_operand);
        }
        f.ops[op_idx].operands = remapped;
    }
    Ok(())
}

pub fn fold_constants_and_build_tables(
    f: &mut IrFunction,
    constants: &mut ConstTable,
    selectors: &mut SelectorTable,
) -> Result<(), CompileError> {
    inline_constants(f)?;
    build_tables(f, constants, selectors)
}

/// Reference a nested function by its original AST-level index; remapped
/// to its position in the module's flattened function table during
/// `code_unit` packing.
pub fn function_ref(idx: FunctionIndex) -> u32 {
    idx.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SrcLoc;
    use crate::ir::Op;

    #[test]
    fn sub_constant_becomes_add_negated() {
        let mut f = IrFunction::new("t");
        let c5 = f.const_number(5.0);
        let x = f.push_op(Op::new(Opcode::Param, SrcLoc(0)));
        let k = f.push_op(Op::new(Opcode::Const, SrcLoc(0)).with_operands(vec![Operand::Number(c5)]));
        let sub = f.push_op(Op::new(Opcode::Sub, SrcLoc(0)).with_operands(vec![Operand::Op(x), Operand::Op(k)]));

        inline_constants(&mut f).unwrap();

        assert!(matches!(f.ops[sub].opcode, Opcode::Add));
        match f.ops[sub].operands[1] {
            Operand::Number(c) => assert_eq!(f.constants[c.0 as usize], -5.0),
            _ => panic!("expected inlined negated constant"),
        }
    }

    #[test]
    fn distinct_numbers_dedup_by_bit_pattern() {
        let mut table = ConstTable::default();
        let a = table.insert_number(0.0).unwrap();
        let b = table.insert_number(-0.0).unwrap();
        assert_ne!(a, b, "-0.0 and 0.0 must not alias in the constant table");
    }

    #[test]
    fn repeated_string_dedups() {
        let mut table = ConstTable::default();
        let a = table.insert_string("x").unwrap();
        let b = table.insert_string("x").unwrap();
        assert_eq!(a, b);
    }
}
