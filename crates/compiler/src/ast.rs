//! The AST node contract consumed by the resolver and IR builder.
//!
//! kenaf's lexer and recursive-descent parser are out of scope (§1); what
//! they hand the rest of the pipeline is a flat, post-order array of nodes
//! per function (parents after children, §4.1). This module defines that
//! contract so the resolver and `ir_build` have something concrete to walk,
//! and so tests can hand-build small programs without a parser.

use std::collections::HashMap;

use kenaf_core::{define_index, IndexVec};

define_index!(NodeIndex);
define_index!(FunctionIndex);

/// A source location: byte offset into the originating script's source
/// text. Only the offset is carried here -- mapping it to `(line, column)`
/// is the job of the out-of-scope error-message formatter, which consults
/// the `Script` object's newline table (`code_unit.rs`/runtime).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SrcLoc(pub u32);

/// The kind of an AST node, restricted to what the resolver and `ir_build`
/// actually need to see. `Name` nodes exist only up to the resolver; after
/// `ast_resolve` runs every `Name` is rewritten to one of `LocalDecl`,
/// `LocalName`, `SuperName`, `OutenvName`, `GlobalName`, or `ObjkeyDecl`
/// (§4.1).
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    // Names, pre- and post-resolution.
    Name(String),
    LocalDecl { local: u32 },
    LocalName { local: u32 },
    SuperName,
    OutenvName { varenv_index: u32, varenv_slot: u32 },
    GlobalName(String),
    ObjkeyDecl { local: u32 },

    /// `...`: only valid inside an unpack expression, and only within its
    /// defining (varargs) function (§4.1 constraints).
    Varargs,

    // Expressions. A node's direct children are the `arity` nodes
    // immediately preceding it in the post-order array.
    Unop { op: UnOp, arity: u32 },
    Binop { op: BinOp, arity: u32 },
    And { arity: u32 },
    Or { arity: u32 },
    Not { arity: u32 },
    If { arity: u32 }, // a ? b : c  (arity == 3)
    Call { arity: u32 },
    Index { arity: u32 },            // a[b]
    Key { key: String, arity: u32 }, // a.key
    NewArray { arity: u32 },
    NewTable { arity: u32 }, // arity pairs, flattened key,value,key,value,...
    Unpack { arity: u32 },

    // Rvalue / assignment forms (§4.2.5)
    RvalList { arity: u32 },
    RvalAssign { arity: u32 },        // lhs-list (arity-1 targets), rhs last
    RvalOpAssign { op: BinOp, arity: u32 }, // lhs, rhs

    // Statements
    Block { varenv_index: Option<u32>, arity: u32 },
    IfStmt { arity: u32 },     // cond, then-block[, else-block]
    While { arity: u32 },      // cond, body
    RepeatUntil { arity: u32 }, // body, cond
    ForStep { local: u32, arity: u32 }, // start, stop, step, body
    ForEach { locals: Vec<u32>, arity: u32 }, // expr-list, body
    Break,
    Continue,
    Return { arity: u32 },
    Yield { arity: u32 },
    Throw { arity: u32 },
    ExprStmt { arity: u32 },

    // Function / object definitions
    Function(FunctionIndex),
    Object { prototype_arity: u32 }, // `is <expr>`: 0 or 1 prototype child
}

/// How a function's outenv slot is seeded from its immediately-enclosing
/// function when a closure instance is created (`F_VARENV`/`F_OUTENV`,
/// §4.7): either a plain local in the creating function (the `$varenv`
/// holding a captured block's locals) or one of the creating function's
/// own outenv slots, forwarded through for captures nested two or more
/// function levels deep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutenvSource {
    Local(u32),
    Outer(u32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Pos,
    BitNot,
    Len,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    LShift,
    RShift,
    AShift,
    BitAnd,
    BitOr,
    BitXor,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub sloc: SrcLoc,
}

/// One function's flat post-order node array, plus the declarative
/// metadata a parser gathers up front (parameter count, vararg-ness).
#[derive(Clone, Debug, Default)]
pub struct AstFunction {
    pub name: String,
    pub param_count: u32,
    pub is_varargs: bool,
    pub is_generator: bool,
    pub nodes: IndexVec<Node, NodeIndex>,
    /// Index of the root node (the function body block); the last node
    /// pushed, since the array is post-order.
    pub root: Option<NodeIndex>,
    /// Locals of this function captured by an inner closure: local index ->
    /// `(varenv local holding the shared $varenv cell, slot within it)`.
    /// Populated by the resolver; consulted by `ir_build` to redirect plain
    /// SSA local access through `GET_ENV`/`SET_ENV` (§4.1, §4.7).
    pub captured_locals: HashMap<u32, (u32, u32)>,
    /// How each of this function's own outenv slots is seeded by its
    /// creating function, in order (§4.7).
    pub outenvs: Vec<OutenvSource>,
}

impl AstFunction {
    pub fn new(name: impl Into<String>) -> Self {
        AstFunction {
            name: name.into(),
            param_count: 0,
            is_varargs: false,
            is_generator: false,
            nodes: IndexVec::new(),
            root: None,
            captured_locals: HashMap::new(),
            outenvs: Vec::new(),
        }
    }

    pub fn push(&mut self, kind: NodeKind, sloc: SrcLoc) -> NodeIndex {
        let idx = self.nodes.push(Node { kind, sloc });
        self.root = Some(idx);
        idx
    }
}

impl NodeKind {
    /// Number of direct children this node consumes from the post-order
    /// array immediately preceding it.
    pub fn arity(&self) -> usize {
        use NodeKind::*;
        match self {
            Null | True | False | Number(_) | String(_) | Name(_) | LocalDecl { .. }
            | LocalName { .. } | SuperName | OutenvName { .. } | GlobalName(_)
            | ObjkeyDecl { .. } | Varargs | Break | Continue => 0,
            Unop { arity, .. }
            | Binop { arity, .. }
            | And { arity, .. }
            | Or { arity, .. }
            | Not { arity, .. }
            | If { arity, .. }
            | Call { arity, .. }
            | Index { arity, .. }
            | Key { arity, .. }
            | NewArray { arity, .. }
            | NewTable { arity, .. }
            | Unpack { arity, .. }
            | RvalList { arity, .. }
            | RvalAssign { arity, .. }
            | RvalOpAssign { arity, .. }
            | Block { arity, .. }
            | IfStmt { arity, .. }
            | While { arity, .. }
            | RepeatUntil { arity, .. }
            | ForStep { arity, .. }
            | ForEach { arity, .. }
            | Return { arity, .. }
            | Yield { arity, .. }
            | Throw { arity, .. }
            | ExprStmt { arity, .. } => *arity as usize,
            Function(_) => 0,
            Object { prototype_arity } => *prototype_arity as usize,
        }
    }
}

impl AstFunction {
    /// Size (node count) of the subtree rooted at `idx`, walking backward
    /// through its children.
    pub fn subtree_len(&self, idx: NodeIndex) -> usize {
        let arity = self.nodes[idx].kind.arity();
        let mut end = idx.0;
        let mut total = 1;
        for _ in 0..arity {
            let child_end = NodeIndex(end - 1);
            let len = self.subtree_len(child_end);
            total += len;
            end -= len as u32;
        }
        total
    }

    /// The direct children of `idx`, in left-to-right (original) order.
    pub fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let arity = self.nodes[idx].kind.arity();
        let mut ends = Vec::with_capacity(arity);
        let mut end = idx.0;
        for _ in 0..arity {
            let child_end = NodeIndex(end - 1);
            ends.push(child_end);
            end -= self.subtree_len(child_end) as u32;
        }
        ends.reverse();
        ends
    }
}

/// A whole compilation unit: the forest of functions the parser produced,
/// in the order `Function(FunctionIndex)` nodes reference them. Function 0
/// is the top-level script body.
#[derive(Clone, Debug, Default)]
pub struct AstModule {
    pub functions: IndexVec<AstFunction, FunctionIndex>,
}

impl AstModule {
    pub fn new() -> Self {
        AstModule::default()
    }

    pub fn push_function(&mut self, f: AstFunction) -> FunctionIndex {
        self.functions.push(f)
    }
}
