//! Shared scaffolding for the scenario/invariant integration tests: small
//! hand-built `Graph`s, no golden-file or process-replay harness.

#![allow(dead_code)]

use smallvec::SmallVec;

use tensor_scheduler::buffer::{Buffer, BufferId, BufferOptions, BufferTable};
use tensor_scheduler::dtype::DType;
use tensor_scheduler::graph::{Graph, LbId};
use tensor_scheduler::op::{ConstBuffer, LazyOp, MetaOps, OpArg};
use tensor_scheduler::shapetracker::ShapeTracker;
use tensor_scheduler::var::Extent;

pub fn st(dims: &[i64]) -> ShapeTracker {
    ShapeTracker::from_shape(dims.iter().map(|&d| Extent::Const(d)).collect())
}

/// Pushes an already-realized input LazyBuffer, as if produced by an earlier
/// scheduling call (or supplied directly by the caller).
pub fn input(graph: &mut Graph, buffers: &mut BufferTable, shape: &[i64], dtype: DType) -> (LbId, BufferId) {
    let id = graph.push_base(MetaOps::Empty.into(), SmallVec::new(), OpArg::None, dtype, st(shape), "cpu");
    let size = shape.iter().product::<i64>().max(1) as usize;
    let buf = buffers.insert(Buffer::new("cpu", size, dtype, BufferOptions::default()));
    graph.mark_realized(id, buf);
    (id, buf)
}

/// Collects every `MemBuffer.idx` referenced by a LOAD or STORE leaf in `ast`
/// (§8 invariant 4).
pub fn collect_mem_indices(ast: &LazyOp, out: &mut Vec<usize>) {
    if let OpArg::Mem(m) = &ast.arg {
        out.push(m.idx);
    }
    for s in &ast.srcs {
        collect_mem_indices(s, out);
    }
}

/// Collects every `ShapeTracker` carried anywhere in `ast`'s leaves (§8
/// invariant 6: none may still carry a `Bound` extent).
pub fn collect_shapetrackers<'a>(ast: &'a LazyOp, out: &mut Vec<&'a ShapeTracker>) {
    match &ast.arg {
        OpArg::Mem(m) => out.push(&m.st),
        OpArg::ConstLeaf(c) => out.push(&c.st),
        OpArg::AssignView(v) => out.push(v),
        _ => {}
    }
    for s in &ast.srcs {
        collect_shapetrackers(s, out);
    }
}

pub fn has_bound_extent(st: &ShapeTracker) -> bool {
    st.views.iter().any(|v| v.shape.iter().any(|e| matches!(e, Extent::Bound(_, _))))
}

pub fn const_f32(graph: &mut Graph, shape: &[i64], value: f64) -> LbId {
    graph.push_base(
        MetaOps::Const.into(),
        SmallVec::new(),
        OpArg::ConstLeaf(ConstBuffer {
            value: tensor_scheduler::dtype::ConstValue::Float(value),
            dtype: DType::Float32,
            st: st(shape),
        }),
        DType::Float32,
        st(shape),
        "cpu",
    )
}
