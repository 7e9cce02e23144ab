//! The frozen kernel-AST op tags and tree (§3 "LazyOp", C2).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dtype::{ConstValue, DType};
use crate::shapetracker::ShapeTracker;
use crate::var::Variable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferOps {
    Load,
    Store,
    Const,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOps {
    Neg,
    Exp2,
    Log2,
    Sqrt,
    Sin,
    Cast,
    BitCast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOps {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    CmpLt,
    CmpEq,
    Xor,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TernaryOps {
    Where,
    MulAcc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOps {
    Sum,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaOps {
    Kernel,
    Copy,
    Empty,
    Custom,
    View,
    Contiguous,
    Assign,
    Const,
}

/// The tagged op-kind enum unifying every `LazyOp`/`LazyBuffer` operation
/// (§9 "polymorphism over op kinds is a tagged-variant enum").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Buffer(BufferOps),
    Unary(UnaryOps),
    Binary(BinaryOps),
    Ternary(TernaryOps),
    Reduce(ReduceOps),
    Meta(MetaOps),
}

impl Op {
    pub fn is_reduce(&self) -> bool {
        matches!(self, Op::Reduce(_))
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, Op::Meta(_))
    }

    pub fn as_meta(&self) -> Option<MetaOps> {
        match self {
            Op::Meta(m) => Some(*m),
            _ => None,
        }
    }
}

impl From<BufferOps> for Op {
    fn from(v: BufferOps) -> Self {
        Op::Buffer(v)
    }
}
impl From<UnaryOps> for Op {
    fn from(v: UnaryOps) -> Self {
        Op::Unary(v)
    }
}
impl From<BinaryOps> for Op {
    fn from(v: BinaryOps) -> Self {
        Op::Binary(v)
    }
}
impl From<TernaryOps> for Op {
    fn from(v: TernaryOps) -> Self {
        Op::Ternary(v)
    }
}
impl From<ReduceOps> for Op {
    fn from(v: ReduceOps) -> Self {
        Op::Reduce(v)
    }
}
impl From<MetaOps> for Op {
    fn from(v: MetaOps) -> Self {
        Op::Meta(v)
    }
}

/// The argument payload carried by a `LazyOp` node. Most ops carry `None`;
/// a handful carry a structured arg (reduce axes, buffer leaves, assign view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpArg {
    None,
    /// `ReduceOps` axis tuple.
    Axes(SmallVec<[usize; 4]>),
    Mem(MemBuffer),
    ConstLeaf(ConstBuffer),
    /// The view an `ASSIGN` writes into, when distinct from the target's own view.
    AssignView(ShapeTracker),
}

/// `BufferOps::Load`/`Store` leaf payload: references buffer slot `idx` in
/// the kernel's `bufs` list, reindexed through `st`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemBuffer {
    pub idx: usize,
    pub dtype: DType,
    pub st: ShapeTracker,
}

/// `BufferOps::Const` leaf payload: broadcasts a scalar through `st`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstBuffer {
    pub value: ConstValue,
    pub dtype: DType,
    pub st: ShapeTracker,
}

/// An immutable kernel-AST node `(op, srcs, arg)` (§3 "LazyOp").
///
/// Cheap to share: `srcs` is reference-counted, so the same subtree can be
/// referenced from multiple parents without cloning (the lowering cache in
/// `lower` relies on this).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyOp {
    pub op: Op,
    pub srcs: SmallVec<[Arc<LazyOp>; 2]>,
    pub arg: OpArg,
}

impl LazyOp {
    pub fn new(op: impl Into<Op>, srcs: impl IntoIterator<Item = Arc<LazyOp>>, arg: OpArg) -> Self {
        LazyOp { op: op.into(), srcs: srcs.into_iter().collect(), arg }
    }

    pub fn leaf(op: impl Into<Op>, arg: OpArg) -> Self {
        LazyOp { op: op.into(), srcs: SmallVec::new(), arg }
    }

    /// Variable bindings referenced anywhere in this AST's leaves (used to
    /// sanity-check invariant 6 — every emitted AST is already unbound).
    pub fn var_vals(&self) -> std::collections::BTreeMap<Variable, i64> {
        let mut out = std::collections::BTreeMap::new();
        self.collect_var_vals(&mut out);
        out
    }

    fn collect_var_vals(&self, out: &mut std::collections::BTreeMap<Variable, i64>) {
        match &self.arg {
            OpArg::Mem(m) => out.extend(m.st.var_vals()),
            OpArg::ConstLeaf(c) => out.extend(c.st.var_vals()),
            OpArg::AssignView(st) => out.extend(st.var_vals()),
            _ => {}
        }
        for s in &self.srcs {
            s.collect_var_vals(out);
        }
    }
}
