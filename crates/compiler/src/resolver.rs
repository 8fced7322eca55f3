//! `ast_resolve`: the lexical-scope resolution pass (§4.1).
//!
//! Walks a function's scopes, rewriting every `Name` node into one of
//! `LocalDecl`, `LocalName`, `SuperName`, `OutenvName`, `GlobalName`, or
//! `ObjkeyDecl`, and threading captured locals through outenv allocation on
//! the way. Ported from `ast_resolve.h`'s variable/scope shapes.

use std::collections::HashMap;

use crate::ast::{AstFunction, AstModule, FunctionIndex, NodeIndex, NodeKind, OutenvSource};
use crate::error::CompileError;

/// A resolved local variable's bookkeeping, mirroring `ast_resolve.h`'s
/// `variable` struct.
#[derive(Clone, Debug)]
pub struct Variable {
    pub index: u32,
    pub after_continue: bool,
    pub is_outenv: bool,
    pub outenv_slot: Option<u32>,
}

/// One lexical scope: a function body, a block, a loop body, or an
/// until-clause.
struct Scope {
    function: FunctionIndex,
    /// Varenv local index, allocated lazily the first time a local in this
    /// scope is captured by an inner function.
    varenv_index: Option<u32>,
    /// Next free slot in this scope's shared varenv.
    next_varenv_slot: u32,
    after_continue: bool,
    repeat_until: bool,
    names: HashMap<String, Variable>,
}

impl Scope {
    fn new(function: FunctionIndex) -> Self {
        Scope {
            function,
            varenv_index: None,
            next_varenv_slot: 0,
            after_continue: false,
            repeat_until: false,
            names: HashMap::new(),
        }
    }
}

/// Per-function resolver state: next local slot, and the synthetic captures
/// inserted so repeat lookups of an already-captured name in this function
/// are fast (and reuse the same outenv slot rather than appending a
/// duplicate).
struct FuncState {
    next_local: u32,
    synthetic: HashMap<String, Variable>,
}

pub struct Resolver<'m> {
    module: &'m mut AstModule,
    scopes: Vec<Scope>,
    func_states: HashMap<FunctionIndex, FuncState>,
}

impl<'m> Resolver<'m> {
    pub fn new(module: &'m mut AstModule) -> Self {
        Resolver {
            module,
            scopes: Vec::new(),
            func_states: HashMap::new(),
        }
    }

    pub fn resolve_function(&mut self, func: FunctionIndex) -> Result<(), CompileError> {
        self.func_states.insert(
            func,
            FuncState { next_local: self.module.functions[func].param_count, synthetic: HashMap::new() },
        );
        self.scopes.push(Scope::new(func));
        if let Some(root) = self.module.functions[func].root {
            self.resolve_node(func, root)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn resolve_node(&mut self, func: FunctionIndex, idx: NodeIndex) -> Result<(), CompileError> {
        let children = self.module.functions[func].children(idx);
        let kind = self.module.functions[func].nodes[idx].kind.clone();

        match &kind {
            NodeKind::Function(inner) => {
                self.resolve_function(*inner)?;
                return Ok(());
            }
            NodeKind::Block { .. } => {
                self.scopes.push(Scope::new(func));
                for child in &children {
                    self.resolve_node(func, *child)?;
                }
                let scope = self.scopes.pop().unwrap();
                if let NodeKind::Block { varenv_index, .. } =
                    &mut self.module.functions[func].nodes[idx].kind
                {
                    *varenv_index = scope.varenv_index;
                }
                return Ok(());
            }
            NodeKind::RepeatUntil { .. } => {
                self.scopes.push(Scope {
                    repeat_until: true,
                    ..Scope::new(func)
                });
                for child in &children {
                    self.resolve_node(func, *child)?;
                }
                self.scopes.pop();
                return Ok(());
            }
            NodeKind::ForStep { local, .. } => {
                let mut scope = Scope::new(func);
                let index = self.alloc_local(func);
                scope.names.insert(
                    format!("$for_step_local_{idx}"),
                    Variable {
                        index,
                        after_continue: false,
                        is_outenv: false,
                        outenv_slot: None,
                    },
                );
                self.scopes.push(scope);
                for child in &children {
                    self.resolve_node(func, *child)?;
                }
                self.scopes.pop();
                if let NodeKind::ForStep { local: l, .. } =
                    &mut self.module.functions[func].nodes[idx].kind
                {
                    *l = index;
                }
                let _ = local;
                return Ok(());
            }
            NodeKind::ForEach { locals, .. } => {
                let mut scope = Scope::new(func);
                let mut resolved = Vec::with_capacity(locals.len());
                for _ in locals {
                    resolved.push(self.alloc_local(func));
                }
                for (i, idx) in resolved.iter().enumerate() {
                    scope
                        .names
                        .insert(format!("$for_each_{i}"), Variable {
                            index: *idx,
                            after_continue: false,
                            is_outenv: false,
                            outenv_slot: None,
                        });
                }
                self.scopes.push(scope);
                for child in &children {
                    self.resolve_node(func, *child)?;
                }
                self.scopes.pop();
                if let NodeKind::ForEach { locals: l, .. } =
                    &mut self.module.functions[func].nodes[idx].kind
                {
                    *l = resolved;
                }
                return Ok(());
            }
            NodeKind::Continue => {
                if let Some(scope) = self.scopes.last_mut() {
                    scope.after_continue = true;
                }
                return Ok(());
            }
            NodeKind::RvalAssign { arity } => {
                // Last child is the rvalue; earlier children are
                // assignment targets.
                let target_count = (*arity as usize).saturating_sub(1);
                for (i, child) in children.iter().enumerate() {
                    if i < target_count {
                        self.resolve_assign_target(func, *child)?;
                    } else {
                        self.resolve_node(func, *child)?;
                    }
                }
                return Ok(());
            }
            NodeKind::RvalOpAssign { .. } => {
                if let Some((target, rest)) = children.split_first() {
                    self.resolve_assign_target(func, *target)?;
                    for child in rest {
                        self.resolve_node(func, *child)?;
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        for child in &children {
            self.resolve_node(func, *child)?;
        }

        if let NodeKind::Name(name) = &kind {
            self.resolve_name(func, idx, name, false)?;
        }
        if let NodeKind::Varargs = &kind {
            if !self.module.functions[func].is_varargs {
                return Err(CompileError::Resolve(
                    "'...' used outside a varargs function".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// A `Name` node used as an assignment target: declares a fresh local
    /// if undeclared in the innermost scope (`var`-style binding semantics
    /// are the parser's job; here a bare assignment target that isn't
    /// already a known name falls back to the "undeclared global" error),
    /// otherwise behaves like `resolve_name` with `is_assign_target = true`.
    fn resolve_assign_target(
        &mut self,
        func: FunctionIndex,
        idx: NodeIndex,
    ) -> Result<(), CompileError> {
        let kind = self.module.functions[func].nodes[idx].kind.clone();
        match kind {
            NodeKind::Name(name) => self.resolve_name(func, idx, &name, true),
            _ => self.resolve_node(func, idx),
        }
    }

    /// Declare a new local in the innermost scope. Shadowing an existing
    /// local in the *same* scope is an error (§4.1 constraints).
    pub fn declare_local(&mut self, func: FunctionIndex, name: &str) -> Result<u32, CompileError> {
        if self
            .scopes
            .last()
            .expect("scope stack not empty")
            .names
            .contains_key(name)
        {
            return Err(CompileError::Resolve(format!(
                "redeclaration of '{name}' in the same scope"
            )));
        }
        let index = self.alloc_local(func);
        let after_continue = self.scopes.last().unwrap().after_continue;
        self.scopes.last_mut().unwrap().names.insert(
            name.to_string(),
            Variable {
                index,
                after_continue,
                is_outenv: false,
                outenv_slot: None,
            },
        );
        Ok(index)
    }

    fn alloc_local(&mut self, func: FunctionIndex) -> u32 {
        let state = self.func_states.get_mut(&func).unwrap();
        let index = state.next_local;
        state.next_local += 1;
        index
    }

    fn resolve_name(
        &mut self,
        func: FunctionIndex,
        idx: NodeIndex,
        name: &str,
        is_assign_target: bool,
    ) -> Result<(), CompileError> {
        if name == "super" {
            if is_assign_target {
                return Err(CompileError::Resolve("cannot assign to 'super'".to_string()));
            }
            self.module.functions[func].nodes[idx].kind = NodeKind::SuperName;
            return Ok(());
        }

        // Fast path: this function already captured `name` from an outer
        // scope earlier in its own body.
        if let Some(var) = self
            .func_states
            .get(&func)
            .and_then(|s| s.synthetic.get(name))
            .cloned()
        {
            self.module.functions[func].nodes[idx].kind = NodeKind::OutenvName {
                varenv_index: var.index,
                varenv_slot: var.outenv_slot.unwrap(),
            };
            return Ok(());
        }

        let mut defining_func: Option<FunctionIndex> = None;
        for scope in self.scopes.iter().rev() {
            if let Some(var) = scope.names.get(name) {
                if scope.function == func {
                    if scope.repeat_until && var.after_continue && !is_assign_target {
                        return Err(CompileError::Resolve(format!(
                            "'{name}' used before its declaration in an until-clause"
                        )));
                    }
                    let kind = if var.is_outenv {
                        NodeKind::OutenvName {
                            varenv_index: var.index,
                            varenv_slot: var.outenv_slot.unwrap_or(0),
                        }
                    } else {
                        NodeKind::LocalName { local: var.index }
                    };
                    self.module.functions[func].nodes[idx].kind = kind;
                    return Ok(());
                } else {
                    defining_func = Some(scope.function);
                    break;
                }
            }
        }

        let defining_func = match defining_func {
            Some(f) => f,
            None => {
                if is_assign_target {
                    return Err(CompileError::Resolve(format!(
                        "cannot assign to undeclared identifier '{name}'"
                    )));
                }
                self.module.functions[func].nodes[idx].kind =
                    NodeKind::GlobalName(name.to_string());
                return Ok(());
            }
        };

        let (varenv_index, varenv_slot) = self.capture_chain(defining_func, func, name)?;
        self.module.functions[func].nodes[idx].kind = NodeKind::OutenvName { varenv_index, varenv_slot };
        Ok(())
    }

    /// Allocate (or reuse) the shared varenv slot `name` occupies in its
    /// declaring block, without yet threading it through any capturing
    /// function. Returns `(varenv local index, slot within it)`. Idempotent:
    /// repeat captures of the same name reuse the slot assigned on first
    /// capture.
    fn capture_local(&mut self, defining_func: FunctionIndex, name: &str) -> (u32, u32) {
        let scope_pos = self
            .scopes
            .iter()
            .rposition(|s| s.function == defining_func && s.names.contains_key(name))
            .expect("defining scope must be on the stack");

        if self.scopes[scope_pos].varenv_index.is_none() {
            let varenv_local = self.alloc_local(defining_func);
            self.scopes[scope_pos].varenv_index = Some(varenv_local);
        }
        let varenv_index = self.scopes[scope_pos].varenv_index.unwrap();

        let existing_slot = self.scopes[scope_pos].names[name].outenv_slot;
        let slot = existing_slot.unwrap_or_else(|| {
            let slot = self.scopes[scope_pos].next_varenv_slot;
            self.scopes[scope_pos].next_varenv_slot += 1;
            slot
        });

        let var = self.scopes[scope_pos].names.get_mut(name).unwrap();
        var.outenv_slot = Some(slot);

        let local_index = var.index;
        self.module.functions[defining_func]
            .captured_locals
            .entry(local_index)
            .or_insert((varenv_index, slot));

        (varenv_index, slot)
    }

    /// Thread `name`, declared in `defining_func`'s scope, into `user_func`
    /// through every intervening function's outenv array, allocating (or
    /// reusing) one outenv slot per hop. Returns `(outenv index, slot)` as
    /// seen from `user_func` -- the value an `OutenvName` node in `user_func`
    /// should carry. Mirrors the walk `ast_resolve`'s name lookup performs
    /// when a captured variable crosses more than one function boundary.
    fn capture_chain(
        &mut self,
        defining_func: FunctionIndex,
        user_func: FunctionIndex,
        name: &str,
    ) -> Result<(u32, u32), CompileError> {
        // The chain of distinct enclosing functions from `defining_func` to
        // `user_func`, outermost first. Scopes belonging to the same
        // function are always pushed back-to-back as blocks nest inside it,
        // so deduping consecutive entries recovers the function nesting.
        let mut chain: Vec<FunctionIndex> = Vec::new();
        for scope in &self.scopes {
            if chain.last() != Some(&scope.function) {
                chain.push(scope.function);
            }
        }
        let start = chain
            .iter()
            .position(|f| *f == defining_func)
            .expect("defining function must be on the scope stack");
        let hops: Vec<FunctionIndex> = chain[start + 1..].to_vec();

        let (varenv_index, slot) = self.capture_local(defining_func, name);

        let mut source_index = varenv_index;
        let mut source_is_outenv = false;

        for hop in &hops {
            if let Some(existing) = self
                .func_states
                .get(hop)
                .and_then(|s| s.synthetic.get(name))
                .cloned()
            {
                source_index = existing.index;
                source_is_outenv = true;
                continue;
            }

            let entry =
                if source_is_outenv { OutenvSource::Outer(source_index) } else { OutenvSource::Local(source_index) };
            let outenv_index = self.module.functions[*hop].outenvs.len() as u32;
            self.module.functions[*hop].outenvs.push(entry);

            self.func_states.get_mut(hop).unwrap().synthetic.insert(
                name.to_string(),
                Variable {
                    index: outenv_index,
                    after_continue: false,
                    is_outenv: true,
                    outenv_slot: Some(slot),
                },
            );

            source_index = outenv_index;
            source_is_outenv = true;
        }

        Ok((source_index, slot))
    }
}

#[allow(dead_code)]
fn unused(_: &AstFunction) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstFunction, AstModule, SrcLoc};

    #[test]
    fn undeclared_name_becomes_global() {
        let mut module = AstModule::new();
        let mut f = AstFunction::new("main");
        f.push(NodeKind::Name("x".to_string()), SrcLoc(0));
        let func = module.push_function(f);

        let mut r = Resolver::new(&mut module);
        r.resolve_function(func).unwrap();
        match &module.functions[func].nodes[NodeIndex(0)].kind {
            NodeKind::GlobalName(name) => assert_eq!(name, "x"),
            other => panic!("expected GlobalName, got {other:?}"),
        }
    }

    #[test]
    fn assigning_to_undeclared_identifier_is_an_error() {
        let mut module = AstModule::new();
        let mut f = AstFunction::new("main");
        f.push(NodeKind::Name("x".to_string()), SrcLoc(0));
        f.push(NodeKind::Number(1.0), SrcLoc(0));
        f.push(NodeKind::RvalAssign { arity: 2 }, SrcLoc(0));
        let func = module.push_function(f);

        let mut r = Resolver::new(&mut module);
        let err = r.resolve_function(func).unwrap_err();
        assert!(matches!(err, CompileError::Resolve(_)));
    }

    #[test]
    fn declared_local_resolves_to_local_name() {
        let mut module = AstModule::new();
        let mut f = AstFunction::new("main");
        f.push(NodeKind::Name("x".to_string()), SrcLoc(0));
        let func = module.push_function(f);

        let mut r = Resolver::new(&mut module);
        r.func_states.insert(func, FuncState { next_local: 0, synthetic: HashMap::new() });
        r.scopes.push(Scope::new(func));
        r.declare_local(func, "x").unwrap();
        r.resolve_node(func, NodeIndex(0)).unwrap();
        r.scopes.pop();

        match &module.functions[func].nodes[NodeIndex(0)].kind {
            NodeKind::LocalName { local } => assert_eq!(*local, 0),
            other => panic!("expected LocalName, got {other:?}"),
        }
    }

    #[test]
    fn capture_two_levels_deep_threads_a_passthrough_outenv() {
        // outer declares `x`; `middle` merely encloses `inner`, which is the
        // one that actually reads `x`. `middle` never names `x` itself, so
        // its own outenv slot exists purely to forward outer's varenv down
        // to `inner`.
        let mut module = AstModule::new();

        let mut inner_f = AstFunction::new("inner");
        inner_f.push(NodeKind::Name("x".to_string()), SrcLoc(0));
        let inner_idx = module.push_function(inner_f);

        let mut middle_f = AstFunction::new("middle");
        middle_f.push(NodeKind::Function(inner_idx), SrcLoc(0));
        let middle_idx = module.push_function(middle_f);

        let mut outer_f = AstFunction::new("outer");
        outer_f.push(NodeKind::Function(middle_idx), SrcLoc(0));
        let outer_idx = module.push_function(outer_f);

        let mut r = Resolver::new(&mut module);
        r.func_states.insert(outer_idx, FuncState { next_local: 0, synthetic: HashMap::new() });
        r.scopes.push(Scope::new(outer_idx));
        r.declare_local(outer_idx, "x").unwrap();
        r.resolve_node(outer_idx, NodeIndex(0)).unwrap();
        r.scopes.pop();

        // outer's `x` (local 0) got a fresh varenv local (index 1, since
        // `x` already took local 0) at slot 0.
        assert_eq!(module.functions[outer_idx].captured_locals.get(&0), Some(&(1, 0)));

        // middle forwards outer's varenv local as a plain local capture.
        assert_eq!(module.functions[middle_idx].outenvs, vec![OutenvSource::Local(1)]);

        // inner forwards middle's own outenv slot 0, not a local of its own.
        assert_eq!(module.functions[inner_idx].outenvs, vec![OutenvSource::Outer(0)]);

        match &module.functions[inner_idx].nodes[NodeIndex(0)].kind {
            NodeKind::OutenvName { varenv_index, varenv_slot } => {
                assert_eq!(*varenv_index, 0);
                assert_eq!(*varenv_slot, 0);
            }
            other => panic!("expected OutenvName, got {other:?}"),
        }
    }
}
