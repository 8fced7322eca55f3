//! `ir_build`: lowers a resolved AST function into SSA IR (§4.2).
//!
//! Implements on-the-fly SSA construction in the "browser paper" style
//! (Braun et al., *Simple and Efficient Construction of SSA Form*):
//! sealed/unsealed blocks, phi insertion via `search_def`, and phi
//! collapsing via `close_phi`. Also builds the shortcut-branch mini-CFG for
//! `and`/`or`/ternary/chained-compare expressions (§4.2.4) and emits
//! `rval_list` sequences for multi-assignment (§4.2.5).

use std::collections::HashMap;

use crate::ast::{AstFunction, AstModule, BinOp, FunctionIndex, NodeIndex, NodeKind, OutenvSource, SrcLoc, UnOp};
use crate::error::CompileError;
use crate::ir::{Block, BlockIndex, BlockKind, IrFunction, LocalIndex, Op, OpIndex, Operand, Opcode};

/// Per-goto-kind fixup stack: pending `(block, operand_index)` jump
/// targets waiting to be bound to a future block (§4.2.2).
#[derive(Default)]
struct GotoStacks {
    brk: Vec<(OpIndex, usize)>,
    cont: Vec<(OpIndex, usize)>,
    els: Vec<(OpIndex, usize)>,
    endif: Vec<(OpIndex, usize)>,
}

pub struct IrBuilder<'a> {
    module: &'a AstModule,
    ast: &'a AstFunction,
    pub f: IrFunction,
    /// `defs[(block, local)] = op_index`: most recent definition of `local`
    /// visible at the end of `block`.
    defs: HashMap<(BlockIndex, LocalIndex), OpIndex>,
    current: BlockIndex,
    gotos: GotoStacks,
    /// Outstanding loop headers (UNSEALED blocks) awaiting `end_loop`.
    loop_stack: Vec<BlockIndex>,
}

impl<'a> IrBuilder<'a> {
    pub fn new(module: &'a AstModule, func: FunctionIndex) -> Self {
        let ast = &module.functions[func];
        let mut f = IrFunction::new(ast.name.clone());
        f.param_count = ast.param_count;
        f.is_varargs = ast.is_varargs;
        f.is_generator = ast.is_generator;
        f.local_count = ast.param_count;
        f.outenv_count = ast.outenvs.len() as u32;

        let entry = f.blocks.push(Block::new(BlockKind::Basic, OpIndex(0)));
        IrBuilder {
            module,
            ast,
            f,
            defs: HashMap::new(),
            current: entry,
            gotos: GotoStacks::default(),
            loop_stack: Vec::new(),
        }
    }

    pub fn build(mut self) -> Result<IrFunction, CompileError> {
        let mut params = Vec::with_capacity(self.ast.param_count as usize);
        for i in 0..self.ast.param_count {
            let op = Op::new(Opcode::Param, SrcLoc(0)).with_local(LocalIndex(i));
            let idx = self.f.push_op(op);
            params.push(idx);
        }

        // The function body's own block may need a varenv for captured
        // parameters, which must exist before the params are `def`d into it
        // (§4.2.1's function-scope handling: NEW_ENV precedes the param
        // defs, which precede the body).
        let mut body_children = None;
        if let Some(root) = self.ast.root {
            let sloc = self.ast.nodes[root].sloc;
            if let NodeKind::Block { varenv_index, .. } = self.ast.nodes[root].kind {
                self.emit_block_varenv(varenv_index, sloc);
                body_children = Some(self.ast.children(root));
            }
        }

        for (i, idx) in params.into_iter().enumerate() {
            self.def(LocalIndex(i as u32), idx);
        }

        match (self.ast.root, body_children) {
            (Some(_), Some(children)) => {
                for c in children {
                    self.lower_stmt(c)?;
                }
            }
            (Some(root), None) => self.lower_stmt(root)?,
            (None, _) => {}
        }

        self.close_block();
        Ok(self.f)
    }

    /// Allocate this block's shared `$varenv` (§4.2.1), sized to the number
    /// of distinct locals captured into it, and bind it as a plain local
    /// def so nested uses can `search_def` their way to it.
    fn emit_block_varenv(&mut self, varenv_index: Option<u32>, sloc: SrcLoc) {
        if let Some(local) = varenv_index {
            let size = self.ast.captured_locals.values().filter(|(v, _)| *v == local).count();
            let new_env = self
                .f
                .push_op(Op::new(Opcode::NewEnv, sloc).with_operands(vec![Operand::Immediate(size as i8)]));
            self.def(LocalIndex(local), new_env);
        }
    }

    // --- block management -------------------------------------------------

    fn close_block(&mut self) {
        self.f.blocks[self.current].upper = OpIndex(self.f.ops.len() as u32);
    }

    fn new_block(&mut self, kind: BlockKind) -> BlockIndex {
        self.close_block();
        let lower = OpIndex(self.f.ops.len() as u32);
        let idx = self.f.blocks.push(Block::new(kind, lower));
        idx
    }

    fn switch_to(&mut self, block: BlockIndex, preceding: Vec<BlockIndex>) {
        self.current = block;
        self.f.blocks[block].preceding.extend(preceding);
    }

    fn emit_jump_to(&mut self, target_goto: &str, op_idx: OpIndex, operand_idx: usize) {
        let entry = (op_idx, operand_idx);
        match target_goto {
            "break" => self.gotos.brk.push(entry),
            "continue" => self.gotos.cont.push(entry),
            "else" => self.gotos.els.push(entry),
            "endif" => self.gotos.endif.push(entry),
            _ => {}
        }
    }

    /// Bind every fixup recorded under `kind` to jump at `target` (the
    /// block about to begin), as preceding edges of that block.
    fn bind_gotos(&mut self, kind: &str, target: BlockIndex) {
        let entries: Vec<(OpIndex, usize)> = match kind {
            "break" => std::mem::take(&mut self.gotos.brk),
            "continue" => std::mem::take(&mut self.gotos.cont),
            "else" => std::mem::take(&mut self.gotos.els),
            "endif" => std::mem::take(&mut self.gotos.endif),
            _ => Vec::new(),
        };
        for (op_idx, _) in &entries {
            self.f.blocks[target].preceding.push(self.block_of(*op_idx));
        }
    }

    fn block_of(&self, op: OpIndex) -> BlockIndex {
        for idx in self.f.blocks.indices() {
            let b = &self.f.blocks[idx];
            if op.0 >= b.lower.0 && op.0 < b.upper.0.max(b.lower.0 + 1) {
                return idx;
            }
        }
        self.current
    }

    // --- SSA def/use (§4.2.3) ----------------------------------------------

    fn def(&mut self, local: LocalIndex, op: OpIndex) {
        // A local captured by an inner closure has no SSA home of its own;
        // every def instead writes through the block's shared varenv
        // (§4.1, §4.2.1).
        if let Some(&(varenv_local, slot)) = self.ast.captured_locals.get(&local.0) {
            let sloc = self.f.ops[op].sloc;
            let env = self.use_local(LocalIndex(varenv_local));
            let set =
                Op::new(Opcode::SetEnv, sloc).with_operands(vec![Operand::Op(env), Operand::Envslot(slot), Operand::Op(op)]);
            self.f.push_op(set);
            return;
        }
        self.defs.insert((self.current, local), op);
        self.f.ops[op].local = Some(local);
    }

    /// `use()`: resolve the current live definition of `local`, inserting
    /// phis as needed. A captured local is read back out of its varenv
    /// instead of through ordinary SSA search.
    fn use_local(&mut self, local: LocalIndex) -> OpIndex {
        if let Some(&(varenv_local, slot)) = self.ast.captured_locals.get(&local.0) {
            let env = self.search_def(self.current, LocalIndex(varenv_local));
            return self
                .f
                .push_op(Op::new(Opcode::GetEnv, SrcLoc(0)).with_operands(vec![Operand::Op(env), Operand::Envslot(slot)]));
        }
        self.search_def(self.current, local)
    }

    fn search_def(&mut self, block: BlockIndex, local: LocalIndex) -> OpIndex {
        if let Some(&op) = self.defs.get(&(block, local)) {
            return op;
        }

        // Insert a tentative PHI_OPEN and record it before recursing, so a
        // cyclic search (loop back-edges) terminates instead of
        // recursing forever.
        let phi = Op::new(Opcode::PhiOpen, SrcLoc(0));
        let phi_idx = self.f.ops.push(phi);
        self.defs.insert((block, local), phi_idx);
        self.link_phi(block, phi_idx);

        let sealed = !matches!(self.f.blocks[block].kind, BlockKind::Unsealed);
        if sealed {
            self.close_phi(block, local, phi_idx);
        }
        // Else: stays open until `seal_loop` runs on this header.
        phi_idx
    }

    fn link_phi(&mut self, block: BlockIndex, phi: OpIndex) {
        let b = &mut self.f.blocks[block];
        if b.phi_head.is_none() {
            b.phi_head = Some(phi);
            b.phi_tail = Some(phi);
        } else {
            let tail = b.phi_tail.unwrap();
            self.f.ops[tail].phi_next = Some(phi);
            b.phi_tail = Some(phi);
        }
    }

    fn close_phi(&mut self, block: BlockIndex, local: LocalIndex, phi_idx: OpIndex) {
        let preds = self.f.blocks[block].preceding.clone();
        let mut operands = Vec::with_capacity(preds.len());
        let mut distinct: Vec<OpIndex> = Vec::new();
        for pred in &preds {
            let def = self.search_def(*pred, local);
            let resolved = self.resolve_ref(def);
            operands.push(Operand::Op(resolved));
            if resolved != phi_idx && !distinct.contains(&resolved) {
                distinct.push(resolved);
            }
        }

        if distinct.len() <= 1 {
            let value = distinct.first().copied().unwrap_or(phi_idx);
            self.f.ops[phi_idx].opcode = Opcode::Ref;
            self.f.ops[phi_idx].operands = vec![Operand::Op(value)];
            self.defs.insert((block, local), value);
        } else {
            self.f.ops[phi_idx].opcode = Opcode::Phi;
            self.f.ops[phi_idx].operands = operands;
            self.defs.insert((block, local), phi_idx);
        }
    }

    /// Follow a chain of `REF`s to the op it ultimately resolves to.
    fn resolve_ref(&self, mut op: OpIndex) -> OpIndex {
        loop {
            match &self.f.ops[op].opcode {
                Opcode::Ref => match self.f.ops[op].operands.first() {
                    Some(Operand::Op(next)) if *next != op => op = *next,
                    _ => return op,
                },
                _ => return op,
            }
        }
    }

    /// Seal a loop header once its back edge(s) are known, closing any
    /// phis left open by `search_def`.
    fn seal_loop(&mut self, header: BlockIndex) {
        self.f.blocks[header].kind = BlockKind::Loop;
        let mut phi = self.f.blocks[header].phi_head;
        while let Some(p) = phi {
            if matches!(self.f.ops[p].opcode, Opcode::PhiOpen) {
                // Recover which local this placeholder was tracking.
                if let Some((&(b, l), _)) = self
                    .defs
                    .iter()
                    .find(|(&(b, _), &v)| b == header && v == p)
                {
                    self.close_phi(b, l, p);
                }
            }
            phi = self.f.ops[p].phi_next;
        }
    }

    // --- statement lowering -------------------------------------------------

    fn lower_stmt(&mut self, idx: NodeIndex) -> Result<(), CompileError> {
        let kind = self.ast.nodes[idx].kind.clone();
        let children = self.ast.children(idx);
        let sloc = self.ast.nodes[idx].sloc;

        match kind {
            NodeKind::Block { varenv_index, .. } => {
                self.emit_block_varenv(varenv_index, sloc);
                for c in children {
                    self.lower_stmt(c)?;
                }
            }
            NodeKind::ExprStmt { .. } => {
                if let Some(c) = children.first() {
                    self.lower_expr(*c)?;
                }
            }
            NodeKind::RvalAssign { arity } => {
                self.lower_rval_assign(&children, arity as usize, sloc)?;
            }
            NodeKind::RvalOpAssign { op, .. } => {
                let target = children[0];
                let rhs = children[1];
                let rhs_val = self.lower_expr(rhs)?;
                self.assign_to(target, |b| {
                    let lhs_val = b.lower_expr(target).unwrap();
                    b.binop(op, lhs_val, rhs_val, sloc)
                })?;
            }
            NodeKind::IfStmt { .. } => {
                self.lower_if(&children, sloc)?;
            }
            NodeKind::While { .. } => {
                self.lower_while(children[0], children[1], sloc)?;
            }
            NodeKind::RepeatUntil { .. } => {
                self.lower_repeat_until(children[0], children[1], sloc)?;
            }
            NodeKind::Break => {
                let op = Op::new(Opcode::Jump, sloc).with_operands(vec![Operand::Jump(OpIndex(0))]);
                let idx = self.f.push_op(op);
                self.emit_jump_to("break", idx, 0);
            }
            NodeKind::Continue => {
                let op = Op::new(Opcode::Jump, sloc).with_operands(vec![Operand::Jump(OpIndex(0))]);
                let idx = self.f.push_op(op);
                self.emit_jump_to("continue", idx, 0);
            }
            NodeKind::Return { .. } => {
                let mut operands = Vec::new();
                for c in &children {
                    let v = self.lower_expr(*c)?;
                    operands.push(Operand::Pin(v));
                }
                let mut op = Op::new(Opcode::Return, sloc);
                op.unpack = Some(operands.len() as u8);
                op.operands = operands;
                self.f.push_op(op);
            }
            NodeKind::Yield { .. } => {
                let mut operands = Vec::new();
                for c in &children {
                    let v = self.lower_expr(*c)?;
                    operands.push(Operand::Pin(v));
                }
                let mut op = Op::new(Opcode::Yield, sloc);
                op.unpack = Some(operands.len() as u8);
                op.operands = operands;
                self.f.push_op(op);
            }
            NodeKind::Throw { .. } => {
                let v = self.lower_expr(children[0])?;
                let op = Op::new(Opcode::Throw, sloc).with_operands(vec![Operand::Op(v)]);
                self.f.push_op(op);
            }
            NodeKind::ForStep { local, .. } => {
                self.lower_for_step(local, &children, sloc)?;
            }
            NodeKind::ForEach { locals, .. } => {
                self.lower_for_each(&locals, &children, sloc)?;
            }
            _ => {
                // Any other node reached in statement position is an
                // expression used for effect.
                self.lower_expr(idx)?;
            }
        }
        Ok(())
    }

    fn lower_if(&mut self, children: &[NodeIndex], sloc: SrcLoc) -> Result<(), CompileError> {
        // children: cond, then-block[, else-block]
        let cond = self.lower_expr(children[0])?;
        let jf = Op::new(Opcode::JumpTest, sloc)
            .with_operands(vec![Operand::Op(cond), Operand::Immediate(0), Operand::Jump(OpIndex(0))]);
        let jf_idx = self.f.push_op(jf);
        let jf_block = self.current;

        let then_block = self.new_block(BlockKind::Basic);
        self.switch_to(then_block, vec![jf_block]);
        self.lower_stmt(children[1])?;

        let jmp_end = Op::new(Opcode::Jump, sloc).with_operands(vec![Operand::Jump(OpIndex(0))]);
        let jmp_idx = self.f.push_op(jmp_end);
        let then_end_block = self.current;

        let else_block = self.new_block(BlockKind::Basic);
        self.switch_to(else_block, vec![jf_block]);
        let _ = jf_idx;
        if let Some(else_node) = children.get(2) {
            self.lower_stmt(*else_node)?;
        }
        let else_end_block = self.current;

        let merge = self.new_block(BlockKind::Basic);
        self.switch_to(merge, vec![then_end_block, else_end_block]);
        let _ = jmp_idx;
        Ok(())
    }

    fn lower_while(&mut self, cond: NodeIndex, body: NodeIndex, sloc: SrcLoc) -> Result<(), CompileError> {
        let preheader = self.current;
        let header = self.new_block(BlockKind::Unsealed);
        self.f.blocks[header].preceding.push(preheader);
        self.switch_to(header, vec![]);
        self.loop_stack.push(header);

        let cond_val = self.lower_expr(cond)?;
        let jf = Op::new(Opcode::JumpTest, sloc)
            .with_operands(vec![Operand::Op(cond_val), Operand::Immediate(0), Operand::Jump(OpIndex(0))]);
        let jf_idx = self.f.push_op(jf);

        let body_block = self.new_block(BlockKind::Basic);
        self.switch_to(body_block, vec![header]);
        self.lower_stmt(body)?;
        self.bind_gotos("continue", header);

        let back_jump = Op::new(Opcode::Jump, sloc).with_operands(vec![Operand::Jump(OpIndex(0))]);
        self.f.push_op(back_jump);
        let body_end = self.current;
        self.f.blocks[header].preceding.push(body_end);
        self.seal_loop(header);

        let after = self.new_block(BlockKind::Basic);
        let _ = jf_idx;
        self.switch_to(after, vec![header]);
        self.bind_gotos("break", after);
        self.loop_stack.pop();
        Ok(())
    }

    fn lower_repeat_until(&mut self, body: NodeIndex, cond: NodeIndex, sloc: SrcLoc) -> Result<(), CompileError> {
        let preheader = self.current;
        let header = self.new_block(BlockKind::Unsealed);
        self.f.blocks[header].preceding.push(preheader);
        self.switch_to(header, vec![]);
        self.loop_stack.push(header);

        self.lower_stmt(body)?;
        self.bind_gotos("continue", self.current);

        let cond_val = self.lower_expr(cond)?;
        let jt = Op::new(Opcode::JumpTest, sloc)
            .with_operands(vec![Operand::Op(cond_val), Operand::Immediate(1), Operand::Jump(OpIndex(0))]);
        self.f.push_op(jt);
        let body_end = self.current;
        self.f.blocks[header].preceding.push(body_end);
        self.seal_loop(header);

        let after = self.new_block(BlockKind::Basic);
        self.switch_to(after, vec![header]);
        self.bind_gotos("break", after);
        self.loop_stack.pop();
        Ok(())
    }

    /// `for i = start, stop, step do body end`: hidden `$for_step` local
    /// already allocated by the resolver holds the loop counter.
    fn lower_for_step(
        &mut self,
        local: u32,
        children: &[NodeIndex],
        sloc: SrcLoc,
    ) -> Result<(), CompileError> {
        let start = self.lower_expr(children[0])?;
        let stop = self.lower_expr(children[1])?;
        let step = self.lower_expr(children[2])?;
        self.def(LocalIndex(local), start);

        let preheader = self.current;
        let header = self.new_block(BlockKind::Unsealed);
        self.f.blocks[header].preceding.push(preheader);
        self.switch_to(header, vec![]);
        self.loop_stack.push(header);

        let cur = self.use_local(LocalIndex(local));
        let test = Op::new(Opcode::ForStepIndex, sloc)
            .with_operands(vec![Operand::Op(cur), Operand::Op(stop), Operand::Op(step), Operand::Jump(OpIndex(0))]);
        self.f.push_op(test);

        let body_block = self.new_block(BlockKind::Basic);
        self.switch_to(body_block, vec![header]);
        if let Some(body) = children.get(3) {
            self.lower_stmt(*body)?;
        }
        self.bind_gotos("continue", header);

        let next = self.binop(BinOp::Add, cur, step, sloc);
        self.def(LocalIndex(local), next);
        let back = Op::new(Opcode::Jump, sloc).with_operands(vec![Operand::Jump(OpIndex(0))]);
        self.f.push_op(back);
        let body_end = self.current;
        self.f.blocks[header].preceding.push(body_end);
        self.seal_loop(header);

        let after = self.new_block(BlockKind::Basic);
        self.switch_to(after, vec![header]);
        self.bind_gotos("break", after);
        self.loop_stack.pop();
        Ok(())
    }

    /// `for k, v in expr do body end`: hidden `$for_each` generator state.
    fn lower_for_each(
        &mut self,
        locals: &[u32],
        children: &[NodeIndex],
        sloc: SrcLoc,
    ) -> Result<(), CompileError> {
        let last = children.len().saturating_sub(1);
        let gen_idx = self.lower_expr(children[0])?;

        let preheader = self.current;
        let header = self.new_block(BlockKind::Unsealed);
        self.f.blocks[header].preceding.push(preheader);
        self.switch_to(header, vec![]);
        self.loop_stack.push(header);

        let mut items = Op::new(Opcode::ForEachItems, sloc)
            .with_operands(vec![Operand::Op(gen_idx), Operand::Jump(OpIndex(0))]);
        items.unpack = Some(locals.len() as u8);
        let items_idx = self.f.push_op(items);
        for (i, local) in locals.iter().enumerate() {
            let sel = Op::new(Opcode::Mov, sloc).with_operands(vec![Operand::Select(items_idx, i as u8)]);
            let sel_idx = self.f.push_op(sel);
            self.def(LocalIndex(*local), sel_idx);
        }

        let body_block = self.new_block(BlockKind::Basic);
        self.switch_to(body_block, vec![header]);
        if let Some(body) = children.get(last) {
            if last > 0 {
                self.lower_stmt(*body)?;
            }
        }
        self.bind_gotos("continue", header);

        let back = Op::new(Opcode::Jump, sloc).with_operands(vec![Operand::Jump(OpIndex(0))]);
        self.f.push_op(back);
        let body_end = self.current;
        self.f.blocks[header].preceding.push(body_end);
        self.seal_loop(header);

        let after = self.new_block(BlockKind::Basic);
        self.switch_to(after, vec![header]);
        self.bind_gotos("break", after);
        self.loop_stack.pop();
        Ok(())
    }

    fn lower_rval_assign(
        &mut self,
        children: &[NodeIndex],
        arity: usize,
        sloc: SrcLoc,
    ) -> Result<(), CompileError> {
        let target_count = arity.saturating_sub(1);
        let targets = &children[..target_count];
        let rhs = children[target_count];
        let values = self.rval_list(rhs, target_count)?;

        // Assign back-to-front (§4.2.5) so that a local reassigned here
        // but still pending as an operand-stack use elsewhere was already
        // snapshotted via MOV by `rval_list`.
        for (target, value) in targets.iter().zip(values.iter()).rev() {
            self.assign_to(*target, |_| *value)?;
        }
        let _ = sloc;
        Ok(())
    }

    /// `rval_list(node, unpack)`: produce exactly `unpack` values.
    fn rval_list(&mut self, node: NodeIndex, unpack: usize) -> Result<Vec<OpIndex>, CompileError> {
        let kind = self.ast.nodes[node].kind.clone();
        if let NodeKind::RvalList { .. } = kind {
            let children = self.ast.children(node);
            let mut values = Vec::with_capacity(children.len());
            for c in children {
                values.push(self.lower_expr(c)?);
            }
            while values.len() < unpack {
                let nullv = self
                    .f
                    .push_op(Op::new(Opcode::Const, SrcLoc(0)).with_operands(vec![Operand::Null]));
                values.push(nullv);
            }
            return Ok(values);
        }
        let v = self.lower_expr(node)?;
        Ok(vec![v; unpack.max(1)])
    }

    fn assign_to(
        &mut self,
        target: NodeIndex,
        value_of: impl FnOnce(&mut Self) -> OpIndex,
    ) -> Result<(), CompileError> {
        let kind = self.ast.nodes[target].kind.clone();
        match kind {
            NodeKind::LocalName { local } => {
                let v = value_of(self);
                let v = self.snapshot_if_has_local(v);
                self.def(LocalIndex(local), v);
            }
            NodeKind::OutenvName { varenv_index, varenv_slot } => {
                let v = value_of(self);
                let op = Op::new(Opcode::SetOutenv, target_sloc(self.ast, target))
                    .with_operands(vec![Operand::Outenv(varenv_index), Operand::Envslot(varenv_slot), Operand::Op(v)]);
                self.f.push_op(op);
            }
            NodeKind::GlobalName(name) => {
                let v = value_of(self);
                let sel = self.f.intern_selector(&name);
                let op = Op::new(Opcode::SetKey, target_sloc(self.ast, target))
                    .with_operands(vec![Operand::Selector(sel), Operand::Op(v)]);
                self.f.push_op(op);
            }
            NodeKind::Index { .. } => {
                let children = self.ast.children(target);
                let obj = self.lower_expr(children[0])?;
                let idx = self.lower_expr(children[1])?;
                let v = value_of(self);
                let op = Op::new(Opcode::SetIndex, target_sloc(self.ast, target))
                    .with_operands(vec![Operand::Op(obj), Operand::Op(idx), Operand::Op(v)]);
                self.f.push_op(op);
            }
            NodeKind::Key { key, .. } => {
                let children = self.ast.children(target);
                let obj = self.lower_expr(children[0])?;
                let v = value_of(self);
                let sel = self.f.intern_selector(&key);
                let op = Op::new(Opcode::SetKey, target_sloc(self.ast, target))
                    .with_operands(vec![Operand::Op(obj), Operand::Selector(sel), Operand::Op(v)]);
                self.f.push_op(op);
            }
            _ => {
                return Err(CompileError::Build(
                    "invalid assignment target".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// If `v` already defines a local, wrap it in an explicit MOV so the
    /// freshly assigned local gets its own SSA value (§4.2.3).
    fn snapshot_if_has_local(&mut self, v: OpIndex) -> OpIndex {
        if self.f.ops[v].local.is_some() {
            let mov = Op::new(Opcode::Mov, self.f.ops[v].sloc).with_operands(vec![Operand::Op(v)]);
            self.f.push_op(mov)
        } else {
            v
        }
    }

    fn binop(&mut self, op: BinOp, lhs: OpIndex, rhs: OpIndex, sloc: SrcLoc) -> OpIndex {
        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::IntDiv => Opcode::IntDiv,
            BinOp::Mod => Opcode::Mod,
            BinOp::LShift => Opcode::LShift,
            BinOp::RShift => Opcode::RShift,
            BinOp::AShift => Opcode::AShift,
            BinOp::BitAnd => Opcode::BitAnd,
            BinOp::BitOr => Opcode::BitOr,
            BinOp::BitXor => Opcode::BitXor,
            BinOp::Concat => Opcode::Concat,
            BinOp::Eq => Opcode::Eq,
            BinOp::Ne => Opcode::Ne,
            BinOp::Lt => Opcode::Lt,
            BinOp::Le => Opcode::Le,
            BinOp::Gt => Opcode::Lt, // a > b  ==  b < a
            BinOp::Ge => Opcode::Le, // a >= b ==  b <= a
            BinOp::Is => Opcode::Is,
        };
        let (a, b) = match op {
            BinOp::Gt | BinOp::Ge => (rhs, lhs),
            _ => (lhs, rhs),
        };
        let op = Op::new(opcode, sloc).with_operands(vec![Operand::Op(a), Operand::Op(b)]);
        self.f.push_op(op)
    }

    // --- expression lowering -------------------------------------------------

    fn lower_expr(&mut self, idx: NodeIndex) -> Result<OpIndex, CompileError> {
        let kind = self.ast.nodes[idx].kind.clone();
        let sloc = self.ast.nodes[idx].sloc;
        let children = self.ast.children(idx);

        let result = match kind {
            NodeKind::Null => self.f.push_op(Op::new(Opcode::Const, sloc).with_operands(vec![Operand::Null])),
            NodeKind::True => self.f.push_op(Op::new(Opcode::Const, sloc).with_operands(vec![Operand::True])),
            NodeKind::False => self.f.push_op(Op::new(Opcode::Const, sloc).with_operands(vec![Operand::False])),
            NodeKind::Number(n) => {
                let c = self.f.const_number(n);
                self.f.push_op(Op::new(Opcode::Const, sloc).with_operands(vec![Operand::Number(c)]))
            }
            NodeKind::String(s) => {
                let c = self.f.const_string(s);
                self.f.push_op(Op::new(Opcode::Const, sloc).with_operands(vec![Operand::Str(c)]))
            }
            NodeKind::LocalName { local } => self.use_local(LocalIndex(local)),
            NodeKind::OutenvName { varenv_index, varenv_slot } => self.f.push_op(
                Op::new(Opcode::GetOutenv, sloc)
                    .with_operands(vec![Operand::Outenv(varenv_index), Operand::Envslot(varenv_slot)]),
            ),
            NodeKind::GlobalName(name) => {
                let sel = self.f.intern_selector(&name);
                self.f
                    .push_op(Op::new(Opcode::GetGlobal, sloc).with_operands(vec![Operand::Selector(sel)]))
            }
            NodeKind::SuperName => self.f.push_op(Op::new(Opcode::Super, sloc)),
            NodeKind::Unop { op, .. } => {
                let v = self.lower_expr(children[0])?;
                let opcode = match op {
                    UnOp::Neg => Opcode::Neg,
                    UnOp::Pos => Opcode::Pos,
                    UnOp::BitNot => Opcode::BitNot,
                    UnOp::Len => Opcode::Len,
                };
                self.f.push_op(Op::new(opcode, sloc).with_operands(vec![Operand::Op(v)]))
            }
            NodeKind::Binop { op, .. } => {
                let lhs = self.lower_expr(children[0])?;
                let rhs = self.lower_expr(children[1])?;
                self.binop(op, lhs, rhs, sloc)
            }
            NodeKind::Not { .. } => {
                let v = self.lower_expr(children[0])?;
                self.f.push_op(Op::new(Opcode::Not, sloc).with_operands(vec![Operand::Op(v)]))
            }
            NodeKind::And { .. } => self.lower_shortcut_and_or(&children, sloc, true)?,
            NodeKind::Or { .. } => self.lower_shortcut_and_or(&children, sloc, false)?,
            NodeKind::If { .. } => self.lower_shortcut_ternary(&children, sloc)?,
            NodeKind::Call { .. } => {
                let callee = self.lower_expr(children[0])?;
                let mut operands = vec![Operand::Pin(callee)];
                for c in &children[1..] {
                    let v = self.lower_expr(*c)?;
                    operands.push(Operand::Pin(v));
                }
                let mut op = Op::new(Opcode::Call, sloc);
                op.unpack = Some(1);
                op.operands = operands;
                self.f.push_op(op)
            }
            NodeKind::Index { .. } => {
                let obj = self.lower_expr(children[0])?;
                let i = self.lower_expr(children[1])?;
                self.f
                    .push_op(Op::new(Opcode::GetIndex, sloc).with_operands(vec![Operand::Op(obj), Operand::Op(i)]))
            }
            NodeKind::Key { key, .. } => {
                let obj = self.lower_expr(children[0])?;
                let sel = self.f.intern_selector(&key);
                self.f.push_op(
                    Op::new(Opcode::GetKey, sloc).with_operands(vec![Operand::Op(obj), Operand::Selector(sel)]),
                )
            }
            NodeKind::NewArray { .. } => {
                let new_arr = self.f.push_op(Op::new(Opcode::NewArray, sloc));
                for c in &children {
                    let v = self.lower_expr(*c)?;
                    let op = Op::new(Opcode::Append, sloc).with_operands(vec![Operand::Op(new_arr), Operand::Op(v)]);
                    self.f.push_op(op);
                }
                new_arr
            }
            NodeKind::NewTable { .. } => {
                let new_tab = self.f.push_op(Op::new(Opcode::NewTable, sloc));
                let mut it = children.iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    let kv = self.lower_expr(*k)?;
                    let vv = self.lower_expr(*v)?;
                    let op = Op::new(Opcode::SetIndex, sloc)
                        .with_operands(vec![Operand::Op(new_tab), Operand::Op(kv), Operand::Op(vv)]);
                    self.f.push_op(op);
                }
                new_tab
            }
            NodeKind::Unpack { .. } => {
                let v = self.lower_expr(children[0])?;
                let mut op = Op::new(Opcode::Unpack, sloc).with_operands(vec![Operand::Pin(v)]);
                op.unpack = Some(crate::ir::UNPACK_ALL);
                self.f.push_op(op)
            }
            NodeKind::Varargs => {
                let mut op = Op::new(Opcode::Vararg, sloc);
                op.unpack = Some(crate::ir::UNPACK_ALL);
                self.f.push_op(op)
            }
            NodeKind::Object { prototype_arity } => {
                let proto = if prototype_arity > 0 {
                    Some(self.lower_expr(children[0])?)
                } else {
                    None
                };
                let mut operands = Vec::new();
                if let Some(p) = proto {
                    operands.push(Operand::Op(p));
                }
                self.f.push_op(Op::new(Opcode::NewObject, sloc).with_operands(operands))
            }
            NodeKind::Function(func_idx) => {
                let mut operands = vec![Operand::Function(func_idx)];
                let outenvs = self.module.functions[func_idx].outenvs.clone();
                for source in outenvs {
                    let operand = match source {
                        OutenvSource::Local(local) => Operand::Op(self.use_local(LocalIndex(local))),
                        OutenvSource::Outer(outenv) => Operand::Outenv(outenv),
                    };
                    operands.push(operand);
                }
                self.f.push_op(Op::new(Opcode::NewFunction, sloc).with_operands(operands))
            }
            _ => {
                return Err(CompileError::Build(format!(
                    "node kind not valid in expression position: {idx:?}"
                )))
            }
        };
        Ok(result)
    }

    /// `a and b` / `a or b` as a shortcut-branch mini-CFG (§4.2.4): no new
    /// basic blocks, just `B_AND`/`B_CUT`/`B_DEF`/`B_PHI` ops threaded
    /// through the current block.
    fn lower_shortcut_and_or(
        &mut self,
        children: &[NodeIndex],
        sloc: SrcLoc,
        is_and: bool,
    ) -> Result<OpIndex, CompileError> {
        let lhs = self.lower_expr(children[0])?;
        // `and` only needs the rhs when lhs is truthy; `or` only needs it
        // when lhs is falsy -- that's the one difference between B_AND and
        // B_CUT, both of which jump *past* the B_DEF short-circuit to the
        // start of the second operand's evaluation.
        let test_opcode = if is_and { Opcode::BAnd } else { Opcode::BCut };
        let test = Op::new(test_opcode, sloc).with_operands(vec![Operand::Op(lhs), Operand::Jump(OpIndex(0))]);
        let test_idx = self.f.push_op(test);

        let def_lhs = Op::new(Opcode::BDef, sloc)
            .with_operands(vec![Operand::Op(test_idx), Operand::Op(lhs), Operand::Jump(OpIndex(0))]);
        let def_lhs_idx = self.f.push_op(def_lhs);

        let rhs_start = OpIndex(self.f.ops.len() as u32);
        self.f.ops[test_idx].operands[1] = Operand::Jump(rhs_start);

        let rhs = self.lower_expr(children[1])?;
        let phi = Op::new(Opcode::BPhi, sloc).with_operands(vec![Operand::Op(def_lhs_idx), Operand::Op(rhs)]);
        let phi_idx = self.f.push_op(phi);
        self.f.ops[def_lhs_idx].operands[2] = Operand::Jump(phi_idx);
        Ok(phi_idx)
    }

    fn lower_shortcut_ternary(
        &mut self,
        children: &[NodeIndex],
        sloc: SrcLoc,
    ) -> Result<OpIndex, CompileError> {
        let cond = self.lower_expr(children[0])?;
        let test = Op::new(Opcode::BCut, sloc).with_operands(vec![Operand::Op(cond), Operand::Jump(OpIndex(0))]);
        let test_idx = self.f.push_op(test);

        let then_val = self.lower_expr(children[1])?;
        let def_then = Op::new(Opcode::BDef, sloc)
            .with_operands(vec![Operand::Op(test_idx), Operand::Op(then_val), Operand::Jump(OpIndex(0))]);
        let def_then_idx = self.f.push_op(def_then);

        let else_start = OpIndex(self.f.ops.len() as u32);
        self.f.ops[test_idx].operands[1] = Operand::Jump(else_start);

        let else_val = self.lower_expr(children[2])?;
        let phi =
            Op::new(Opcode::BPhi, sloc).with_operands(vec![Operand::Op(def_then_idx), Operand::Op(else_val)]);
        let phi_idx = self.f.push_op(phi);
        self.f.ops[def_then_idx].operands[2] = Operand::Jump(phi_idx);
        Ok(phi_idx)
    }
}

fn target_sloc(ast: &AstFunction, idx: NodeIndex) -> SrcLoc {
    ast.nodes[idx].sloc
}

pub fn build_function(ast_module: &AstModule, func: FunctionIndex) -> Result<IrFunction, CompileError> {
    IrBuilder::new(ast_module, func).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstFunction, AstModule};

    #[test]
    fn builds_arithmetic_return() {
        // return 1 + 2 * 3
        let mut module = AstModule::new();
        let mut f = AstFunction::new("main");
        let one = f.push(NodeKind::Number(1.0), SrcLoc(0));
        let two = f.push(NodeKind::Number(2.0), SrcLoc(0));
        let three = f.push(NodeKind::Number(3.0), SrcLoc(0));
        let _ = (one, two, three);
        f.push(NodeKind::Binop { op: BinOp::Mul, arity: 2 }, SrcLoc(0));
        f.push(NodeKind::Binop { op: BinOp::Add, arity: 2 }, SrcLoc(0));
        f.push(NodeKind::Return { arity: 1 }, SrcLoc(0));
        let func = module.push_function(f);

        let ir = build_function(&module, func).unwrap();
        assert!(ir.ops.iter().any(|op| matches!(op.opcode, Opcode::Add)));
        assert!(ir.ops.iter().any(|op| matches!(op.opcode, Opcode::Mul)));
        assert!(ir.ops.iter().any(|op| matches!(op.opcode, Opcode::Return)));
    }

    #[test]
    fn lower_if_merges_through_a_nested_elseif_branch() {
        // local x = 1
        // if true then
        //   x = 4
        // else
        //   if true then x = 2 else x = 3 end
        // end
        // return x
        //
        // The outer if's else-branch is itself an if/else, so the outer
        // merge block's second predecessor is the *inner* if's own merge
        // block, not the block the else-branch started in. A reassigned
        // local crossing that edge is exactly what `lower_if` got wrong
        // before it tracked `self.current` post-lowering.
        let mut module = AstModule::new();
        let mut f = AstFunction::new("main");

        let t0 = f.push(NodeKind::LocalName { local: 0 }, SrcLoc(0));
        let v0 = f.push(NodeKind::Number(1.0), SrcLoc(0));
        f.push(NodeKind::RvalAssign { arity: 2 }, SrcLoc(0));
        let _ = (t0, v0);

        let c1 = f.push(NodeKind::Number(1.0), SrcLoc(0));
        let t1 = f.push(NodeKind::LocalName { local: 0 }, SrcLoc(0));
        let v1 = f.push(NodeKind::Number(4.0), SrcLoc(0));
        f.push(NodeKind::RvalAssign { arity: 2 }, SrcLoc(0));
        let _ = (c1, t1, v1);

        let c2 = f.push(NodeKind::Number(1.0), SrcLoc(0));
        let t2a = f.push(NodeKind::LocalName { local: 0 }, SrcLoc(0));
        let v2a = f.push(NodeKind::Number(2.0), SrcLoc(0));
        f.push(NodeKind::RvalAssign { arity: 2 }, SrcLoc(0));
        let t2b = f.push(NodeKind::LocalName { local: 0 }, SrcLoc(0));
        let v2b = f.push(NodeKind::Number(3.0), SrcLoc(0));
        f.push(NodeKind::RvalAssign { arity: 2 }, SrcLoc(0));
        f.push(NodeKind::IfStmt { arity: 3 }, SrcLoc(0));
        let _ = (c2, t2a, v2a, t2b, v2b);

        f.push(NodeKind::IfStmt { arity: 3 }, SrcLoc(0));

        f.push(NodeKind::LocalName { local: 0 }, SrcLoc(0));
        f.push(NodeKind::Return { arity: 1 }, SrcLoc(0));

        f.push(NodeKind::Block { varenv_index: None, arity: 3 }, SrcLoc(0));
        let func = module.push_function(f);

        let ir = build_function(&module, func).unwrap();

        // The first op built is the `x = 1` initializer's Const(1.0).
        let init_value = OpIndex(0);
        assert!(matches!(ir.ops[init_value].opcode, Opcode::Const));
        assert_eq!(ir.constants.first().copied(), Some(1.0));

        let phis: Vec<OpIndex> =
            ir.ops.indices().filter(|&i| matches!(ir.ops[i].opcode, Opcode::Phi)).collect();
        assert_eq!(phis.len(), 2, "expected one phi for the inner if and one for the outer merge");

        for phi in &phis {
            for operand in &ir.ops[*phi].operands {
                assert_ne!(
                    *operand,
                    Operand::Op(init_value),
                    "outer merge must not see the pre-if initializer as a reaching definition"
                );
            }
        }

        let ret = ir.ops.iter().find(|op| matches!(op.opcode, Opcode::Return)).unwrap();
        let returned = match ret.operands.first() {
            Some(Operand::Pin(v)) => *v,
            other => panic!("unexpected return operand: {other:?}"),
        };
        assert!(
            matches!(ir.ops[returned].opcode, Opcode::Phi),
            "returned value should resolve to the outer merge's phi"
        );
    }

    #[test]
    fn closure_capture_lowers_allocates_and_emits_outenv_seeding() {
        // local x = 10
        // return function() return x end
        //
        // `x` is captured, so the outer function's block carries a shared
        // $varenv (local 1) and redirects all access to `x` (local 0)
        // through it; the inner function's only outenv seeds from that
        // varenv directly (one hop, `OutenvSource::Local`).
        let mut module = AstModule::new();

        let mut inner_f = AstFunction::new("inner");
        inner_f.outenvs = vec![OutenvSource::Local(1)];
        inner_f.push(NodeKind::OutenvName { varenv_index: 0, varenv_slot: 0 }, SrcLoc(0));
        inner_f.push(NodeKind::Return { arity: 1 }, SrcLoc(0));
        let inner_idx = module.push_function(inner_f);

        let mut outer_f = AstFunction::new("outer");
        outer_f.captured_locals.insert(0, (1, 0));

        let t0 = outer_f.push(NodeKind::LocalName { local: 0 }, SrcLoc(0));
        let v0 = outer_f.push(NodeKind::Number(10.0), SrcLoc(0));
        outer_f.push(NodeKind::RvalAssign { arity: 2 }, SrcLoc(0));
        let _ = (t0, v0);

        outer_f.push(NodeKind::Function(inner_idx), SrcLoc(0));
        outer_f.push(NodeKind::Return { arity: 1 }, SrcLoc(0));

        outer_f.push(NodeKind::Block { varenv_index: Some(1), arity: 2 }, SrcLoc(0));
        let outer_idx = module.push_function(outer_f);

        let mut ir = build_function(&module, outer_idx).unwrap();

        assert!(ir.ops.iter().any(|op| op.opcode == Opcode::NewEnv), "block needs its shared varenv");
        assert!(ir.ops.iter().any(|op| op.opcode == Opcode::SetEnv), "x's def redirects through the varenv");
        assert!(
            !ir.ops.iter().any(|op| op.local == Some(LocalIndex(0))),
            "captured x is never given a plain SSA home"
        );

        let new_function =
            ir.ops.iter().find(|op| op.opcode == Opcode::NewFunction).expect("a NewFunction op for the closure");
        assert_eq!(new_function.operands.len(), 2, "Function operand plus one outenv seed");
        assert!(
            matches!(new_function.operands[1], Operand::Op(_)),
            "inner's only outenv is seeded from a local varenv, not a passthrough"
        );

        crate::ir_live::analyze(&mut ir);
        let mut constants = crate::ir_foldk::ConstTable::default();
        let mut selectors = crate::ir_foldk::SelectorTable::default();
        crate::ir_foldk::fold_constants_and_build_tables(&mut ir, &mut constants, &mut selectors).unwrap();
        crate::ir_alloc::allocate(&mut ir, &crate::config::CompilerConfig::new()).unwrap();
        let emitted = crate::ir_emit::emit(&ir).unwrap();

        let new_env_instr = emitted
            .instrs
            .iter()
            .find(|i| i.opcode == crate::bytecode::OpCode::NewEnv)
            .expect("a NEW_ENV instruction");
        assert_eq!(new_env_instr.c_value(), 1, "the varenv holds exactly the one captured local");

        let function_pos = emitted
            .instrs
            .iter()
            .position(|i| i.opcode == crate::bytecode::OpCode::Function)
            .expect("a FUNCTION instruction");
        assert_eq!(
            emitted.instrs[function_pos + 1].opcode,
            crate::bytecode::OpCode::FVarenv,
            "FUNCTION is immediately followed by its outenv seed"
        );
    }
}
