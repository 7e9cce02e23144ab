//! The realization decider (C3, §4.2): walks the DAG from the requested
//! outputs and classifies every LazyBuffer as fused or realized, grouping
//! fusible reduces along the way.

use fnv::{FnvHashMap, FnvHashSet};
use indexmap::{IndexMap, IndexSet};

use crate::config::SchedulerConfig;
use crate::graph::{Graph, LbId};
use crate::op::{BinaryOps, MetaOps, Op, UnaryOps};

/// Everything the DAG walk and reduce-grouping pass produced, ready for C4
/// (AST lowering) to consume.
pub struct RealizeResult {
    pub realize_set: IndexSet<LbId>,
    pub reduce_for_op: FnvHashMap<LbId, LbId>,
    pub allbufs: IndexSet<LbId>,
    pub children: FnvHashMap<LbId, Vec<LbId>>,
    /// assign target -> the ASSIGN op that writes it.
    pub assign_targets: FnvHashMap<LbId, LbId>,
    /// group key -> ordered member buffers (§4.2.5).
    pub output_groups: IndexMap<LbId, Vec<LbId>>,
    /// Inner reduces of a same-kind reduce-of-reduce chain that were pulled
    /// out of the realize-set by §4.2.4 double-reduce fusion. C4 substitutes
    /// these away, concatenating their axes into the outer reduce instead of
    /// lowering them as a nested `Reduce` LazyOp.
    pub fused_reduces: FnvHashSet<LbId>,
}

/// Ops that do not distribute over a masked-zero input, so a pad crossing
/// them cannot be proven safe to keep fused (§4.2.2 `UNSAFE_PAD_OPS`).
fn is_pad_unsafe_op(op: Op) -> bool {
    matches!(
        op,
        Op::Binary(BinaryOps::Div)
            | Op::Binary(BinaryOps::Mod)
            | Op::Binary(BinaryOps::CmpLt)
            | Op::Binary(BinaryOps::CmpEq)
            | Op::Unary(UnaryOps::Exp2)
            | Op::Unary(UnaryOps::Log2)
    )
}

fn is_padding_okay(b: LbId, graph: &Graph, memo: &mut FnvHashMap<LbId, bool>) -> bool {
    if let Some(&v) = memo.get(&b) {
        return v;
    }
    if graph.is_realized(b) {
        memo.insert(b, true);
        return true;
    }
    let node = graph.get(b);
    if let Some(op) = node.op {
        if is_pad_unsafe_op(op) {
            memo.insert(b, false);
            return false;
        }
    }
    let srcs: Vec<LbId> = node.srcs.iter().copied().collect();
    let ok = srcs.iter().all(|&s| is_padding_okay(s, graph, memo));
    memo.insert(b, ok);
    ok
}

#[allow(clippy::too_many_arguments)]
fn recurse_lb(
    b: LbId,
    graph: &Graph,
    config: &SchedulerConfig,
    realize_set: &mut IndexSet<LbId>,
    allbufs: &mut IndexSet<LbId>,
    children: &mut FnvHashMap<LbId, Vec<LbId>>,
    assign_targets: &mut FnvHashMap<LbId, LbId>,
    candidate_pads: &mut IndexSet<LbId>,
    double_reduces: &mut Vec<LbId>,
) {
    if allbufs.contains(&b) {
        return;
    }
    let base = graph.get(b).base;
    if graph.is_realized(base) {
        return;
    }
    debug_assert!(
        !graph.get(base).scheduled,
        "attempted to re-traverse a LazyBuffer already finalized into a schedule"
    );

    if graph.is_view(b) {
        let node = graph.get(b);
        let base_node = graph.get(base);
        if let Some(last) = node.st.views.last() {
            let expands = match (node.st.size(), base_node.st.size()) {
                (Some(o), Some(bse)) => o > bse,
                _ => false,
            };
            let image_cast = node.dtype.is_image() && base_node.dtype.is_image();
            if expands && !config.fuse_as_one_kernel && !image_cast {
                realize_set.insert(base);
            } else if last.mask.is_some() {
                candidate_pads.insert(base);
            }
        }
        recurse_lb(
            base,
            graph,
            config,
            realize_set,
            allbufs,
            children,
            assign_targets,
            candidate_pads,
            double_reduces,
        );
        allbufs.insert(b);
        return;
    }

    allbufs.insert(b);
    let node = graph.get(b);
    let srcs: Vec<LbId> = node.srcs.iter().copied().collect();
    for src in &srcs {
        children.entry(*src).or_default().push(b);
        recurse_lb(
            *src,
            graph,
            config,
            realize_set,
            allbufs,
            children,
            assign_targets,
            candidate_pads,
            double_reduces,
        );
    }

    let node = graph.get(b);
    if node.forced_realize || node.op.map(|o| o.is_meta()).unwrap_or(false) {
        realize_set.insert(b);
    }
    if node.op == Some(Op::Meta(MetaOps::Assign)) {
        if let Some(&target) = node.srcs.get(1) {
            assign_targets.insert(graph.get(target).base, b);
        }
    }
    if matches!(node.op, Some(Op::Meta(MetaOps::Copy)) | Some(Op::Meta(MetaOps::View))) {
        if let Some(&src0) = node.srcs.first() {
            realize_set.insert(graph.get(src0).base);
        }
    }
    if let Some(op) = node.op {
        if op.is_reduce() {
            if let Some(&src0) = node.srcs.first() {
                let src_base = graph.get(src0).base;
                if src_base == src0 && graph.get(src0).op == Some(op) {
                    // `src0` is the inner reduce of a same-kind reduce-of-reduce
                    // chain (§4.2.4): record it, not the outer `b`, since it's
                    // `src0` that fusion may drop from the realize-set.
                    double_reduces.push(src0);
                }
            }
        }
    }
}

fn recursive_group(
    tr: LbId,
    r: LbId,
    graph: &Graph,
    children: &FnvHashMap<LbId, Vec<LbId>>,
    realize_set: &IndexSet<LbId>,
    group: &mut IndexSet<LbId>,
    visited: &mut FnvHashSet<LbId>,
) -> bool {
    if !visited.insert(tr) {
        return false;
    }
    let top_size = graph.get(r).st.size();
    let kids = children.get(&tr).cloned().unwrap_or_default();
    for c in kids {
        let cnode = graph.get(c);
        if cnode.op.map(|o| o.is_reduce()).unwrap_or(false) {
            continue;
        }
        let refs = cnode.srcs.iter().filter(|&&s| s == tr).count();
        if refs != 1 {
            continue;
        }
        if realize_set.contains(&c) {
            if cnode.st.contiguous() && cnode.st.size() == top_size {
                group.insert(c);
                continue;
            }
            return true;
        }
        group.insert(c);
        if recursive_group(c, r, graph, children, realize_set, group, visited) {
            return true;
        }
    }
    false
}

/// Narrows `group` down to the members with no consumer outside the group
/// (or `r` itself): pulling a buffer into `r`'s kernel as an extra STORE is
/// only safe if nothing downstream still expects it materialized on its own
/// (§4.2.3 step 5, "isolated" = no external consumer).
fn get_isolated_children(
    r: LbId,
    group: &IndexSet<LbId>,
    children: &FnvHashMap<LbId, Vec<LbId>>,
) -> IndexSet<LbId> {
    group
        .iter()
        .copied()
        .filter(|&c| children.get(&c).map(|ch| ch.iter().all(|x| *x == r || group.contains(x))).unwrap_or(true))
        .collect()
}

/// Descends from `r` while it has a single, contiguous, singly-referenced
/// child, deferring the realize boundary as far downstream as fusion
/// allows; backs off one step if that lands on an upcasting CAST (§4.2.3
/// step 6).
fn chase_target(r: LbId, graph: &Graph, children: &FnvHashMap<LbId, Vec<LbId>>) -> LbId {
    let mut tr = r;
    loop {
        let kids = children.get(&tr).cloned().unwrap_or_default();
        if kids.len() != 1 {
            break;
        }
        let c = kids[0];
        let cnode = graph.get(c);
        if cnode.op.map(|o| o.is_reduce()).unwrap_or(false) {
            break;
        }
        let refs = cnode.srcs.iter().filter(|&&s| s == tr).count();
        if refs != 1 || !cnode.st.contiguous() {
            break;
        }
        tr = c;
    }
    if let Some(Op::Unary(UnaryOps::Cast)) = graph.get(tr).op {
        if let Some(&src) = graph.get(tr).srcs.first() {
            if graph.get(tr).dtype.itemsize() > graph.get(src).dtype.itemsize() {
                return src;
            }
        }
    }
    tr
}

fn image_layout_ok(graph: &Graph, id: LbId) -> bool {
    let node = graph.get(id);
    let img = match node.dtype {
        crate::dtype::DType::Image(img) => img,
        _ => return true,
    };
    let img_vol = (img.shape.0 * img.shape.1 * img.shape.2) as i64;
    if node.st.size() != Some(img_vol) {
        return false;
    }
    let shape = node.st.shape();
    node.st
        .unit_stride_axes()
        .iter()
        .any(|&a| shape.get(a).and_then(|e| e.value()).map(|v| v % 4 == 0).unwrap_or(false))
}

/// Runs the full §4.2 pipeline and returns the realize-set, reduce grouping,
/// and output groups for C4 to lower.
pub fn decide(
    outs: &[LbId],
    seen: &FnvHashSet<LbId>,
    graph: &mut Graph,
    config: &SchedulerConfig,
) -> RealizeResult {
    let mut realize_set: IndexSet<LbId> = outs.iter().map(|&o| graph.get(o).base).collect();
    let mut allbufs = IndexSet::new();
    let mut children: FnvHashMap<LbId, Vec<LbId>> = FnvHashMap::default();
    let mut assign_targets: FnvHashMap<LbId, LbId> = FnvHashMap::default();
    let mut candidate_pads: IndexSet<LbId> = IndexSet::new();
    let mut double_reduces: Vec<LbId> = Vec::new();

    for &o in outs {
        recurse_lb(
            o,
            graph,
            config,
            &mut realize_set,
            &mut allbufs,
            &mut children,
            &mut assign_targets,
            &mut candidate_pads,
            &mut double_reduces,
        );
    }

    // §4.2.2 pad safety.
    let mut memo = FnvHashMap::default();
    for p in candidate_pads.iter().copied().collect::<Vec<_>>() {
        if !is_padding_okay(p, graph, &mut memo) {
            realize_set.insert(p);
        }
    }

    // §4.2.3 reduce grouping.
    let mut reduce_for_op: FnvHashMap<LbId, LbId> = FnvHashMap::default();
    let reduces: Vec<LbId> = allbufs
        .iter()
        .copied()
        .filter(|&b| graph.get(b).op.map(|o| o.is_reduce()).unwrap_or(false) && !realize_set.contains(&b))
        .collect();
    for r in reduces {
        let mut group: IndexSet<LbId> = IndexSet::new();
        let mut visited = FnvHashSet::default();
        let must_realize_r = recursive_group(r, r, graph, &children, &realize_set, &mut group, &mut visited);
        if must_realize_r {
            realize_set.insert(r);
            reduce_for_op.insert(r, r);
            continue;
        }
        let forced = group.contains(&r);
        let can_chase = group.iter().all(|tr| !reduce_for_op.contains_key(tr));
        let effective_group: IndexSet<LbId> = if !forced && group.len() > 1 {
            get_isolated_children(r, &group, &children)
        } else {
            group
        };
        if forced || !can_chase {
            let tr = if forced { r } else { chase_target(r, graph, &children) };
            realize_set.insert(tr);
            reduce_for_op.insert(tr, r);
        } else {
            for tr in &effective_group {
                reduce_for_op.insert(*tr, r);
            }
            reduce_for_op.entry(r).or_insert(r);
        }
    }

    // §4.2.4 double-reduce fusion: an inner reduce with exactly one consumer
    // (the outer reduce) doesn't need its own kernel output — C4 substitutes
    // it away and concatenates its axes into the outer reduce instead.
    let mut fused_reduces: FnvHashSet<LbId> = FnvHashSet::default();
    if config.fuse_conv_bw {
        for inner in double_reduces {
            let child_count = children.get(&inner).map(|c| c.len()).unwrap_or(0);
            if child_count == 1 {
                realize_set.shift_remove(&inner);
                fused_reduces.insert(inner);
            }
        }
    }

    // §4.2.6 image dtype demotion.
    let demote: Vec<LbId> = realize_set
        .iter()
        .copied()
        .filter(|&b| graph.get(b).dtype.is_image() && !image_layout_ok(graph, b))
        .collect();
    for b in demote {
        graph.get_mut(b).dtype = crate::dtype::DType::Float32;
    }

    // §4.2.5 output grouping.
    let mut output_groups: IndexMap<LbId, Vec<LbId>> = IndexMap::new();
    for &b in realize_set.iter() {
        if seen.contains(&b) || graph.is_realized(b) {
            continue;
        }
        if matches!(graph.get(b).op, Some(Op::Meta(MetaOps::Const)) | Some(Op::Buffer(crate::op::BufferOps::Const))) {
            continue;
        }
        let key = if config.multioutput {
            *reduce_for_op.get(&b).unwrap_or(&b)
        } else {
            b
        };
        output_groups.entry(key).or_default().push(b);
    }

    RealizeResult { realize_set, reduce_for_op, allbufs, children, assign_targets, output_groups, fused_reduces }
}
