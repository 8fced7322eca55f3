//! `ir_live`: saturating-use-count liveness (§4.4).
//!
//! Run twice by the pipeline: once before `ir_foldk` so folding can see
//! which values are already dead (and skip materializing them as
//! constants), and again after, since folding changes use counts. Each run
//! is a two-pass sweep per block:
//!
//!  - `live_body`: walk a block's ops upper-to-lower, incrementing each
//!    operand's use count (saturating at 254; side-effecting ops are
//!    pinned to `USE_COUNT_STICKY` so they are never folded away) and
//!    setting `live_range` to the highest op index that uses the value.
//!  - `live_head`: walk a block's phi list, pushing liveness into each
//!    predecessor at the point of the branch that enters this block.
//!
//! A block worklist re-visits predecessors whose live-out set grew, the
//! same fixpoint shape as a classic backward dataflow liveness pass.

use std::collections::VecDeque;

use crate::ir::{BlockIndex, IrFunction, OpIndex, Opcode, Operand, LIVE_RANGE_INVALID, USE_COUNT_STICKY};

pub fn analyze(f: &mut IrFunction) {
    for op in f.ops.iter_mut() {
        op.use_count = 0;
        op.live_range = LIVE_RANGE_INVALID;
    }

    let mut worklist: VecDeque<BlockIndex> = (0..f.blocks.len() as u32).rev().map(BlockIndex).collect();
    let mut in_worklist = vec![true; f.blocks.len()];

    while let Some(idx) = worklist.pop_front() {
        in_worklist[idx.0 as usize] = false;
        if !f.blocks[idx].reachable {
            continue;
        }
        let changed = live_body(f, idx) | live_head(f, idx);
        if changed {
            for pred in f.blocks[idx].preceding.clone() {
                if !in_worklist[pred.0 as usize] {
                    in_worklist[pred.0 as usize] = true;
                    worklist.push_back(pred);
                }
            }
        }
    }
}

fn touch(f: &mut IrFunction, user: OpIndex, used: OpIndex) -> bool {
    let op = &mut f.ops[used];
    let before = op.use_count;
    let before_range = op.live_range;
    if op.use_count != USE_COUNT_STICKY {
        op.use_count = op.use_count.saturating_add(1).min(USE_COUNT_STICKY - 1);
    }
    if op.live_range == LIVE_RANGE_INVALID || user.0 > op.live_range {
        op.live_range = user.0;
    }
    op.use_count != before || op.live_range != before_range
}

fn pin(f: &mut IrFunction, op: OpIndex) {
    f.ops[op].use_count = USE_COUNT_STICKY;
}

/// Sweep one block's ops from its last op down to its first, recording
/// uses. Returns whether anything changed (for the worklist fixpoint).
fn live_body(f: &mut IrFunction, block: BlockIndex) -> bool {
    let lower = f.blocks[block].lower.0;
    let upper = f.blocks[block].upper.0;
    let mut changed = false;

    let mut i = upper;
    while i > lower {
        i -= 1;
        let op_idx = OpIndex(i);
        let opcode = f.ops[op_idx].opcode;

        if opcode.is_side_effecting() {
            pin(f, op_idx);
        }

        let operands = f.ops[op_idx].operands.clone();
        let pins_all = opcode.always_pins() || (opcode.is_stacked() && operands.len() > 1);

        for operand in operands {
            match operand {
                Operand::Op(used) | Operand::Select(used, _) => {
                    changed |= touch(f, op_idx, used);
                }
                Operand::Pin(used) => {
                    changed |= touch(f, op_idx, used);
                    pin(f, used);
                }
                _ => {}
            }
            if pins_all {
                if let Operand::Op(used) = operand {
                    pin(f, used);
                }
            }
        }
    }
    changed
}

/// Propagate liveness for phi operands into their originating predecessor
/// blocks: a phi operand is a use that happens "at the end of" the
/// predecessor, not inside the current block's own op range.
fn live_head(f: &mut IrFunction, block: BlockIndex) -> bool {
    let mut changed = false;
    let mut phi = f.blocks[block].phi_head;
    while let Some(p) = phi {
        let operands = f.ops[p].operands.clone();
        for operand in operands {
            if let Operand::Op(used) = operand {
                changed |= touch(f, p, used);
            }
        }
        phi = f.ops[p].phi_next;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SrcLoc;
    use crate::ir::{Block, BlockKind, Op};

    #[test]
    fn unused_pure_op_has_zero_use_count() {
        let mut f = IrFunction::new("t");
        f.blocks.push(Block::new(BlockKind::Basic, OpIndex(0)));
        let c = f.const_number(1.0);
        let op = f.push_op(Op::new(Opcode::Const, SrcLoc(0)).with_operands(vec![Operand::Number(c)]));
        f.blocks[BlockIndex(0)].upper = OpIndex(f.ops.len() as u32);
        f.blocks[BlockIndex(0)].reachable = true;

        analyze(&mut f);

        assert_eq!(f.ops[op].use_count, 0);
    }

    #[test]
    fn operand_use_increments_count_and_sets_live_range() {
        let mut f = IrFunction::new("t");
        f.blocks.push(Block::new(BlockKind::Basic, OpIndex(0)));
        let c1 = f.const_number(1.0);
        let a = f.push_op(Op::new(Opcode::Const, SrcLoc(0)).with_operands(vec![Operand::Number(c1)]));
        let c2 = f.const_number(2.0);
        let b = f.push_op(Op::new(Opcode::Const, SrcLoc(0)).with_operands(vec![Operand::Number(c2)]));
        let add = f.push_op(Op::new(Opcode::Add, SrcLoc(0)).with_operands(vec![Operand::Op(a), Operand::Op(b)]));
        let ret = {
            let mut op = Op::new(Opcode::Return, SrcLoc(0));
            op.unpack = Some(1);
            op.operands = vec![Operand::Pin(add)];
            f.push_op(op)
        };
        f.blocks[BlockIndex(0)].upper = OpIndex(f.ops.len() as u32);
        f.blocks[BlockIndex(0)].reachable = true;

        analyze(&mut f);

        assert_eq!(f.ops[a].use_count, 1);
        assert_eq!(f.ops[b].use_count, 1);
        assert_eq!(f.ops[add].live_range, ret.0);
        assert_eq!(f.ops[ret].use_count, USE_COUNT_STICKY);
    }
}
