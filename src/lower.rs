//! AST lowering (C4, §4.3): turns one output group into a single kernel AST
//! (or a bare meta-op) with an explicit input buffer list.

use std::collections::BTreeMap;
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::dtype::DType;
use crate::error::ScheduleError;
use crate::graph::{Graph, LbId};
use crate::op::{BufferOps, ConstBuffer, LazyOp, MemBuffer, MetaOps, Op, OpArg};
use crate::shapetracker::ShapeTracker;
use crate::var::{Extent, Variable};

/// The result of lowering one output group: either a full kernel AST, or a
/// bare meta-op that needs no AST body (§4.3 steps 1-2).
pub enum LoweredAst {
    Kernel(Arc<LazyOp>),
    Meta { op: MetaOps, srcs: SmallVec<[LbId; 2]> },
}

pub struct LoweredGroup {
    pub ast: LoweredAst,
    /// Base LazyBuffers referenced as LOAD, in first-reference order.
    pub inputs: Vec<LbId>,
    pub var_vals: BTreeMap<Variable, i64>,
    /// Deduplicated provenance tags of fused-in (non-input) nodes.
    pub metadata: Vec<Arc<str>>,
}

struct Ctx<'a> {
    graph: &'a Graph,
    outs: &'a [LbId],
    assign_targets: &'a FnvHashMap<LbId, LbId>,
    /// Inner reduces of a same-kind reduce-of-reduce chain that §4.2.4
    /// dropped from the realize-set; lowering substitutes through them
    /// instead of emitting a nested `Reduce` (§4.3 step 4a).
    fused_reduces: &'a FnvHashSet<LbId>,
    cache: FnvHashMap<(LbId, ShapeTracker), Arc<LazyOp>>,
    input_slots: FnvHashMap<LbId, usize>,
    inputs: Vec<LbId>,
    var_vals: BTreeMap<Variable, i64>,
    metadata: IndexSet<Arc<str>>,
}

impl<'a> Ctx<'a> {
    fn out_index(&self, id: LbId) -> Option<usize> {
        self.outs.iter().position(|&o| o == id)
    }

    fn input_slot(&mut self, base: LbId) -> usize {
        if let Some(&slot) = self.input_slots.get(&base) {
            return slot;
        }
        let slot = self.outs.len() + self.inputs.len();
        self.inputs.push(base);
        self.input_slots.insert(base, slot);
        slot
    }
}

fn recursive_lazyop(
    id: LbId,
    st: ShapeTracker,
    at_root: bool,
    ctx: &mut Ctx,
) -> Result<Arc<LazyOp>, ScheduleError> {
    let graph = ctx.graph;
    if graph.is_view(id) {
        let node = graph.get(id);
        let composed = node.st.compose(&st);
        return recursive_lazyop(node.base, composed, false, ctx);
    }

    let key = (id, st.clone());
    if let Some(cached) = ctx.cache.get(&key) {
        return Ok(cached.clone());
    }

    let node = graph.get(id);
    debug_assert!(
        !node.scheduled,
        "attempted to lower a LazyBuffer already finalized into an earlier schedule"
    );

    // CONST leaves broadcast regardless of realization state.
    if matches!(node.op, Some(Op::Meta(MetaOps::Const)) | Some(Op::Buffer(BufferOps::Const))) {
        let value = match &node.arg {
            OpArg::ConstLeaf(c) => c.value,
            _ => return Err(ScheduleError::BadConst),
        };
        let (unbound, vars) = st.simplify().unbind();
        ctx.var_vals.extend(vars);
        let leaf = Arc::new(LazyOp::leaf(
            BufferOps::Const,
            OpArg::ConstLeaf(ConstBuffer { value, dtype: node.dtype, st: unbound }),
        ));
        ctx.cache.insert(key, leaf.clone());
        return Ok(leaf);
    }

    let is_this_output = ctx.out_index(id).is_some() && at_root;
    if !is_this_output && (graph.is_realized(id) || node.forced_realize || node.op.map(|o| o.is_meta()).unwrap_or(false)) {
        let assign_op = ctx.assign_targets.get(&id).copied();
        let slot = match assign_op.and_then(|a| ctx.out_index(a)) {
            Some(out_slot) => {
                if !st.contiguous() && !st.mask_contiguous() {
                    return Err(ScheduleError::BadAssign);
                }
                out_slot
            }
            None => ctx.input_slot(id),
        };
        if slot < ctx.outs.len() {
            if let Some(tag) = &node.metadata {
                ctx.metadata.insert(tag.clone());
            }
        }
        let (unbound, vars) = st.simplify().unbind();
        ctx.var_vals.extend(vars);
        let leaf = Arc::new(LazyOp::leaf(
            BufferOps::Load,
            OpArg::Mem(MemBuffer { idx: slot, dtype: node.dtype, st: unbound }),
        ));
        ctx.cache.insert(key, leaf.clone());
        return Ok(leaf);
    }

    if matches!(node.op, Some(Op::Meta(MetaOps::Contiguous)) | Some(Op::Meta(MetaOps::Assign))) {
        let src0 = node.srcs[0];
        let out = recursive_lazyop(src0, st, false, ctx)?;
        ctx.cache.insert(key, out.clone());
        return Ok(out);
    }

    if let Some(op) = node.op {
        if op.is_reduce() {
            let mut src0 = node.srcs[0];
            let mut axes: SmallVec<[usize; 4]> = match &node.arg {
                OpArg::Axes(a) => a.clone(),
                _ => SmallVec::new(),
            };
            // §4.3 step 4a: a same-kind reduce that §4.2.4 fused away is
            // substituted through, concatenating its axes into this one
            // rather than lowering it as a nested Reduce.
            while ctx.fused_reduces.contains(&src0) {
                let inner = graph.get(src0);
                if let OpArg::Axes(inner_axes) = &inner.arg {
                    for &a in inner_axes {
                        if !axes.contains(&a) {
                            axes.push(a);
                        }
                    }
                }
                src0 = inner.srcs[0];
            }
            let inner_st = graph.get(src0).st.clone();
            let lowered_src = recursive_lazyop(src0, inner_st, false, ctx)?;
            let out = Arc::new(LazyOp::new(op, [lowered_src], OpArg::Axes(axes)));
            if let Some(tag) = &node.metadata {
                ctx.metadata.insert(tag.clone());
            }
            ctx.cache.insert(key, out.clone());
            return Ok(out);
        }
    }

    let srcs: Vec<LbId> = node.srcs.iter().copied().collect();
    let lowered: SmallVec<[Arc<LazyOp>; 2]> =
        srcs.iter().map(|&s| recursive_lazyop(s, st.clone(), false, ctx)).collect::<Result<_, _>>()?;
    if let Some(tag) = &node.metadata {
        ctx.metadata.insert(tag.clone());
    }
    let out = Arc::new(LazyOp::new(node.op.expect("non-meta op"), lowered, node.arg.clone()));
    ctx.cache.insert(key, out.clone());
    Ok(out)
}

/// Lowers one output group (all sharing the same `reduce_for_op` key, or a
/// singleton when `MULTIOUTPUT` is off) into a kernel AST.
pub fn lower_group(
    outs: &[LbId],
    graph: &Graph,
    assign_targets: &FnvHashMap<LbId, LbId>,
    fused_reduces: &FnvHashSet<LbId>,
    use_copy_kernel: bool,
) -> Result<LoweredGroup, ScheduleError> {
    debug_assert!(!outs.is_empty());

    if outs.len() == 1 {
        let node = graph.get(outs[0]);
        if let Some(Op::Meta(m)) = node.op {
            if m == MetaOps::Copy && use_copy_kernel {
                let src = node.srcs[0];
                if graph.get(src).device.split(':').next() == node.device.split(':').next() {
                    let ast = trivial_copy_kernel(outs[0], graph);
                    return Ok(LoweredGroup {
                        ast: LoweredAst::Kernel(ast),
                        inputs: vec![graph.get(src).base],
                        var_vals: BTreeMap::new(),
                        metadata: node.metadata.clone().into_iter().collect(),
                    });
                }
            }
            if matches!(m, MetaOps::Custom | MetaOps::Copy | MetaOps::Empty | MetaOps::View) {
                return Ok(LoweredGroup {
                    ast: LoweredAst::Meta { op: m, srcs: node.srcs.clone() },
                    inputs: node.srcs.iter().map(|&s| graph.get(s).base).collect(),
                    var_vals: BTreeMap::new(),
                    metadata: node.metadata.clone().into_iter().collect(),
                });
            }
        }
    }

    let mut ctx = Ctx {
        graph,
        outs,
        assign_targets,
        fused_reduces,
        cache: FnvHashMap::default(),
        input_slots: FnvHashMap::default(),
        inputs: Vec::new(),
        var_vals: BTreeMap::new(),
        metadata: IndexSet::new(),
    };

    let mut stores = Vec::with_capacity(outs.len());
    for (i, &out_id) in outs.iter().enumerate() {
        let node = graph.get(out_id);
        ctx.var_vals.extend(node.st.var_vals());
        let root_st = ShapeTracker::from_shape(node.st.shape().to_vec());
        let body = recursive_lazyop(out_id, root_st, true, &mut ctx)?;

        let output_view = match &node.arg {
            OpArg::AssignView(view) => view.clone(),
            _ => node.st.clone(),
        };
        let (unbound_view, vars) = output_view.simplify().unbind();
        ctx.var_vals.extend(vars);
        let store = LazyOp::new(
            BufferOps::Store,
            [body],
            OpArg::Mem(MemBuffer { idx: i, dtype: node.dtype, st: unbound_view }),
        );
        stores.push(Arc::new(store));
    }

    let ast = Arc::new(LazyOp::new(MetaOps::Kernel, stores, OpArg::None));
    Ok(LoweredGroup {
        ast: LoweredAst::Kernel(ast),
        inputs: ctx.inputs,
        var_vals: ctx.var_vals,
        metadata: ctx.metadata.into_iter().collect(),
    })
}

fn trivial_copy_kernel(out_id: LbId, graph: &Graph) -> Arc<LazyOp> {
    let node = graph.get(out_id);
    let nbytes = node.st.size().unwrap_or(0) * node.dtype.itemsize() as i64;
    let byte_st = ShapeTracker::from_shape(vec![Extent::Const(nbytes)]);
    let load = LazyOp::leaf(
        BufferOps::Load,
        OpArg::Mem(MemBuffer { idx: 1, dtype: DType::Bool, st: byte_st.clone() }),
    );
    let store = LazyOp::new(
        BufferOps::Store,
        [Arc::new(load)],
        OpArg::Mem(MemBuffer { idx: 0, dtype: DType::Bool, st: byte_st }),
    );
    Arc::new(LazyOp::new(MetaOps::Kernel, [Arc::new(store)], OpArg::None))
}
