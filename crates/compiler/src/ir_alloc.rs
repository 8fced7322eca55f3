//! `ir_alloc`: register allocation over the already-live-analyzed IR
//! (§4.6).
//!
//! A linear-scan allocator driven by `RegMap`: ops are visited in
//! ascending program order (an op never needs a register before it is
//! defined, and `ir_live` has already computed each value's `live_range`
//! as the last op index that uses it), and each value-producing op claims
//! the lowest-numbered register free across its
//! `[def_index, live_range + 1)` interval. `Param`s are pinned to the
//! register matching their parameter position, since the calling
//! convention passes arguments in the low registers (§4.1). Stacked ops
//! (`CALL`/`RETURN`/`YIELD`/.../`FOR_EACH_ITEMS`) additionally reserve a
//! contiguous register block sized to their operand count -- `ir_emit`
//! fills that block via MOVs (with `OP_SWP` cycle-breaking where two
//! operands would otherwise clobber each other) before lowering the op
//! itself.
//!
//! The function's final `stack_size` (§6.1) is the high-water mark
//! reported by `RegMap::top`.

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::ir::{IrFunction, LocalIndex, Opcode, Operand};
use crate::regmap::RegMap;

/// Opcodes that never produce an addressable result register.
fn has_no_result(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Nop
            | Opcode::Jump
            | Opcode::JumpTest
            | Opcode::JumpForSgen
            | Opcode::JumpForEgen
            | Opcode::SetKey
            | Opcode::SetIndex
            | Opcode::SetOutenv
            | Opcode::SetEnv
            | Opcode::Return
            | Opcode::Throw
            | Opcode::Append
            | Opcode::Extend
            | Opcode::ForStepIndex
            | Opcode::PhiOpen
            | Opcode::BAnd
            | Opcode::BCut
    )
}

pub fn allocate(f: &mut IrFunction, config: &CompilerConfig) -> Result<(), CompileError> {
    let mut map = RegMap::new();

    // Parameters occupy the low registers in declaration order for the
    // whole function body, matching the call site's argument layout.
    for idx in f.ops.indices() {
        let op = &f.ops[idx];
        if matches!(op.opcode, Opcode::Param) {
            if let Some(local) = op.local {
                let r = local.0 as u8;
                let upper = if op.live_range == crate::ir::LIVE_RANGE_INVALID {
                    idx.0 + 1
                } else {
                    op.live_range + 1
                };
                map.allocate(r, idx.0, upper);
                f.ops[idx].r = Some(r);
            }
        }
    }

    let indices: Vec<_> = f.ops.indices().collect();
    for idx in indices {
        let op = &f.ops[idx];
        if matches!(op.opcode, Opcode::Param) || op.r.is_some() {
            continue;
        }
        let is_live = op.use_count > 0;
        if is_live && !has_no_result(op.opcode) {
            let upper = if op.live_range == crate::ir::LIVE_RANGE_INVALID {
                idx.0 + 1
            } else {
                op.live_range + 1
            };
            let r = map.lowest(idx.0, upper).ok_or_else(|| {
                CompileError::Emit(format!(
                    "function {} exceeds the configured register limit of {}",
                    f.name, config.max_registers
                ))
            })?;
            map.allocate(r, idx.0, upper);
            f.ops[idx].r = Some(r);
        }

        if f.ops[idx].opcode.is_stacked() {
            let len = f.ops[idx].operands.len().min(255) as u8;
            let base = map.lowest_contiguous(len, idx.0, idx.0 + 1).ok_or_else(|| {
                CompileError::Emit(format!(
                    "function {} needs a contiguous block of {} registers and none is free",
                    f.name, len
                ))
            })?;
            map.allocate_contiguous(base, len, idx.0, idx.0 + 1);
            f.ops[idx].s = Some(base);
        }
    }

    f.stack_size = map.top();
    if f.stack_size > config.max_registers as u32 {
        return Err(CompileError::Emit(format!(
            "function {} needs {} registers, exceeding the configured limit of {}",
            f.name, f.stack_size, config.max_registers
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SrcLoc;
    use crate::ir::{Block, BlockIndex, BlockKind, Op, OpIndex};
    use crate::ir_live;

    #[test]
    fn params_get_distinct_fixed_registers() {
        let mut f = IrFunction::new("t");
        f.param_count = 2;
        f.blocks.push(Block::new(BlockKind::Basic, OpIndex(0)));
        let p0 = f.push_op(Op::new(Opcode::Param, SrcLoc(0)).with_local(LocalIndex(0)));
        let p1 = f.push_op(Op::new(Opcode::Param, SrcLoc(0)).with_local(LocalIndex(1)));
        let add = f.push_op(
            Op::new(Opcode::Add, SrcLoc(0)).with_operands(vec![Operand::Op(p0), Operand::Op(p1)]),
        );
        let mut ret = Op::new(Opcode::Return, SrcLoc(0));
        ret.unpack = Some(1);
        ret.operands = vec![Operand::Pin(add)];
        f.push_op(ret);
        f.blocks[BlockIndex(0)].upper = OpIndex(f.ops.len() as u32);
        f.blocks[BlockIndex(0)].reachable = true;

        ir_live::analyze(&mut f);
        let config = CompilerConfig::new();
        allocate(&mut f, &config).unwrap();

        assert_eq!(f.ops[p0].r, Some(0));
        assert_eq!(f.ops[p1].r, Some(1));
        assert!(f.ops[add].r.is_some());
        assert_ne!(f.ops[add].r, f.ops[p0].r);
    }
}
