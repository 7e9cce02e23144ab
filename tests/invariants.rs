//! §8 testable invariants, exercised end-to-end through
//! `create_schedule_with_vars` rather than against any one internal module.

mod common;

use fnv::FnvHashSet;
use smallvec::SmallVec;

use tensor_scheduler::buffer::{BufferId, BufferTable};
use tensor_scheduler::config::SchedulerConfig;
use tensor_scheduler::dtype::DType;
use tensor_scheduler::graph::Graph;
use tensor_scheduler::op::{BinaryOps, MetaOps, OpArg, ReduceOps, UnaryOps};
use tensor_scheduler::schedule::{create_schedule_with_vars, ScheduleAst, ScheduleItem};
use tensor_scheduler::shapetracker::ShapeTracker;
use tensor_scheduler::var::{Extent, Variable};

fn num_outputs(item: &ScheduleItem) -> usize {
    match item.ast_kind {
        ScheduleAst::Kernel => item.ast.srcs.len().max(1),
        ScheduleAst::Meta => 1,
    }
}

/// Invariant 1 (Completeness): every requested output ends up realized
/// after scheduling, either via a fresh item or because it already was.
#[test]
fn completeness_every_output_ends_up_realized() {
    let mut g = Graph::new();
    let mut buffers = BufferTable::new();
    let (a, _) = common::input(&mut g, &mut buffers, &[4], DType::Float32);
    let (b, _) = common::input(&mut g, &mut buffers, &[4], DType::Float32);
    let sum = g.push_base(BinaryOps::Add.into(), SmallVec::from_slice(&[a, b]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");
    let neg = g.push_base(UnaryOps::Neg.into(), SmallVec::from_slice(&[sum]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");

    let mut seen = FnvHashSet::default();
    let config = SchedulerConfig::default();
    let (_items, _) = create_schedule_with_vars(&[sum, neg], &mut g, &mut buffers, &mut seen, &config).unwrap();

    assert!(g.get(sum).realized.is_some(), "sum must be realized: it was requested as an output");
    assert!(g.get(neg).realized.is_some(), "neg must be realized: it was requested as an output");
}

/// Invariant 2 (No-duplicate realization): a node forced to realize (here,
/// a CONTIGUOUS barrier) that feeds two independent requested outputs is
/// scheduled exactly once, not once per consumer.
#[test]
fn no_duplicate_realization_of_a_shared_forced_node() {
    let mut g = Graph::new();
    let mut buffers = BufferTable::new();
    let (a, _) = common::input(&mut g, &mut buffers, &[4], DType::Float32);
    let x = g.push_base(MetaOps::Contiguous.into(), SmallVec::from_slice(&[a]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");
    let y1 = g.push_base(UnaryOps::Neg.into(), SmallVec::from_slice(&[x]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");
    let y2 = g.push_base(UnaryOps::Exp2.into(), SmallVec::from_slice(&[x]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");

    let mut seen = FnvHashSet::default();
    let config = SchedulerConfig::default();
    let (items, _) = create_schedule_with_vars(&[y1, y2], &mut g, &mut buffers, &mut seen, &config).unwrap();

    // x must appear as an *output* of exactly one item.
    let buf_x = g.get(x).realized.expect("x was requested indirectly and must be realized");
    let producer_count = items
        .iter()
        .filter(|it| it.bufs.iter().take(num_outputs(it)).any(|&b| b == buf_x))
        .count();
    assert_eq!(producer_count, 1, "x must be produced by exactly one schedule item even though two outputs depend on it");
}

/// Invariant 3 (Topological validity): every item's input buffers were
/// either produced by a strictly earlier item, or pre-existed the call.
#[test]
fn topological_order_respects_producer_before_consumer() {
    let mut g = Graph::new();
    let mut buffers = BufferTable::new();
    let (a, _) = common::input(&mut g, &mut buffers, &[4], DType::Float32);
    let x1 = g.push_base(MetaOps::Contiguous.into(), SmallVec::from_slice(&[a]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");
    let x2 = g.push_base(MetaOps::Contiguous.into(), SmallVec::from_slice(&[x1]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");
    let x3 = g.push_base(MetaOps::Contiguous.into(), SmallVec::from_slice(&[x2]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");

    let mut seen = FnvHashSet::default();
    let config = SchedulerConfig::default();
    let (items, _) = create_schedule_with_vars(&[x3], &mut g, &mut buffers, &mut seen, &config).unwrap();
    assert_eq!(items.len(), 3);

    let full_produced: std::collections::HashSet<BufferId> =
        items.iter().flat_map(|it| it.bufs[..num_outputs(it)].iter().copied()).collect();

    let mut produced_so_far: std::collections::HashSet<BufferId> = std::collections::HashSet::new();
    for item in &items {
        let n_out = num_outputs(item);
        for &input_buf in item.bufs.iter().skip(n_out) {
            assert!(!item.bufs[..n_out].contains(&input_buf), "an item must never consume its own output buffer as an input");
            if full_produced.contains(&input_buf) {
                assert!(produced_so_far.contains(&input_buf), "an input produced within this batch must come from a strictly earlier item");
            }
        }
        produced_so_far.extend(item.bufs[..n_out].iter().copied());
    }
}

/// Invariant 4 (Memory-reference bounds): every `MemBuffer` leaf's `idx`
/// indexes into that item's own `bufs`, for every item in a multi-kernel,
/// multi-buffer schedule.
#[test]
fn every_mem_index_is_in_bounds_for_its_own_item_bufs() {
    let mut g = Graph::new();
    let mut buffers = BufferTable::new();
    let (a, _) = common::input(&mut g, &mut buffers, &[4, 3], DType::Float32);
    let (b, _) = common::input(&mut g, &mut buffers, &[4, 3], DType::Float32);
    let mul = g.push_base(BinaryOps::Mul.into(), SmallVec::from_slice(&[a, b]), OpArg::None, DType::Float32, common::st(&[4, 3]), "cpu");
    let x = g.push_base(MetaOps::Contiguous.into(), SmallVec::from_slice(&[mul]), OpArg::None, DType::Float32, common::st(&[4, 3]), "cpu");
    let reduce = g.push_base(
        ReduceOps::Sum.into(),
        SmallVec::from_slice(&[x]),
        OpArg::Axes(SmallVec::from_slice(&[0])),
        DType::Float32,
        common::st(&[3]),
        "cpu",
    );
    let one = common::const_f32(&mut g, &[3], 1.0);
    let y = g.push_base(BinaryOps::Add.into(), SmallVec::from_slice(&[reduce, one]), OpArg::None, DType::Float32, common::st(&[3]), "cpu");

    let mut seen = FnvHashSet::default();
    let config = SchedulerConfig::default();
    let (items, _) = create_schedule_with_vars(&[y], &mut g, &mut buffers, &mut seen, &config).unwrap();
    assert!(items.len() >= 2, "x and y must land in separate kernels");

    for item in &items {
        let mut indices = Vec::new();
        common::collect_mem_indices(&item.ast, &mut indices);
        assert!(!indices.is_empty(), "every emitted kernel references at least one buffer");
        for idx in indices {
            assert!(idx < item.bufs.len(), "MemBuffer idx {idx} out of bounds for item with {} bufs", item.bufs.len());
        }
    }
}

/// Invariant 5 (Output arity): a KERNEL ast with N STORE children has
/// exactly N leading output buffers.
#[test]
fn output_arity_matches_store_count() {
    let mut g = Graph::new();
    let mut buffers = BufferTable::new();
    let (a, _) = common::input(&mut g, &mut buffers, &[4, 3], DType::Float32);
    let r = g.push_base(ReduceOps::Sum.into(), SmallVec::from_slice(&[a]), OpArg::Axes(SmallVec::from_slice(&[0])), DType::Float32, common::st(&[3]), "cpu");
    let two = common::const_f32(&mut g, &[3], 2.0);
    let one = common::const_f32(&mut g, &[3], 1.0);
    let c1 = g.push_base(BinaryOps::Add.into(), SmallVec::from_slice(&[r, one]), OpArg::None, DType::Float32, common::st(&[3]), "cpu");
    let c2 = g.push_base(BinaryOps::Mul.into(), SmallVec::from_slice(&[r, two]), OpArg::None, DType::Float32, common::st(&[3]), "cpu");

    let mut seen = FnvHashSet::default();
    let config = SchedulerConfig { multioutput: true, ..SchedulerConfig::default() };
    let (items, _) = create_schedule_with_vars(&[c1, c2], &mut g, &mut buffers, &mut seen, &config).unwrap();

    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.ast.srcs.len(), 2);
    assert_eq!(num_outputs(item), 2);
    assert!(item.bufs.len() >= 2);
}

/// Invariant 6 (ShapeTracker unbind): no leaf in any emitted ast still
/// carries a `Bound` extent; every symbolic dimension has been unbound and
/// its value hoisted into the returned `var_vals` map.
#[test]
fn no_bound_extents_survive_into_the_emitted_ast() {
    let mut g = Graph::new();
    let mut buffers = BufferTable::new();
    let n = Variable::new("N", 1, 16);
    let sym_shape = ShapeTracker::from_shape(vec![Extent::Bound(n.clone(), 4)]);
    let a = g.push_base(MetaOps::Empty.into(), SmallVec::new(), OpArg::None, DType::Float32, sym_shape.clone(), "cpu");
    let buf_a = buffers.insert(tensor_scheduler::buffer::Buffer::new("cpu", 4, DType::Float32, tensor_scheduler::buffer::BufferOptions::default()));
    g.mark_realized(a, buf_a);
    let y = g.push_base(UnaryOps::Neg.into(), SmallVec::from_slice(&[a]), OpArg::None, DType::Float32, sym_shape, "cpu");

    let mut seen = FnvHashSet::default();
    let config = SchedulerConfig::default();
    let (items, var_vals) = create_schedule_with_vars(&[y], &mut g, &mut buffers, &mut seen, &config).unwrap();

    assert_eq!(items.len(), 1);
    let mut trackers = Vec::new();
    common::collect_shapetrackers(&items[0].ast, &mut trackers);
    assert!(!trackers.is_empty());
    for st in trackers {
        assert!(!common::has_bound_extent(st), "emitted ast must carry only unbound (Sym) extents, never Bound ones");
    }
    assert_eq!(var_vals.get(&n), Some(&4), "the bound value must survive in the returned var_vals map");
}

/// Invariant 7 (Memory-planner soundness): two intermediates with
/// overlapping lifetimes never end up sharing the same physical buffer,
/// even after the planner runs as part of the full pipeline.
#[test]
fn memory_planner_keeps_overlapping_lifetimes_distinct() {
    let mut g = Graph::new();
    let mut buffers = BufferTable::new();
    let (a, _) = common::input(&mut g, &mut buffers, &[4], DType::Float32);
    let (b, _) = common::input(&mut g, &mut buffers, &[4], DType::Float32);
    // x1 and x2 are both alive when the final add consumes them together.
    let x1 = g.push_base(MetaOps::Contiguous.into(), SmallVec::from_slice(&[a]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");
    let x2 = g.push_base(MetaOps::Contiguous.into(), SmallVec::from_slice(&[b]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");
    let y = g.push_base(BinaryOps::Add.into(), SmallVec::from_slice(&[x1, x2]), OpArg::None, DType::Float32, common::st(&[4]), "cpu");

    let mut seen = FnvHashSet::default();
    let config = SchedulerConfig::default();
    let (items, _) = create_schedule_with_vars(&[y], &mut g, &mut buffers, &mut seen, &config).unwrap();

    assert_eq!(items.len(), 3); // x1, x2, y each force/need their own kernel
    let buf_x1 = g.get(x1).realized.unwrap();
    let buf_x2 = g.get(x2).realized.unwrap();
    assert_ne!(buf_x1, buf_x2, "x1 and x2 are both alive at y's kernel and must not share a physical buffer");
}

/// Invariant 9 (Determinism): scheduling the same DAG shape twice from
/// scratch produces the same sequence of ast kinds and buffer-count shapes.
#[test]
fn same_dag_schedules_identically_on_repeated_calls() {
    let build = || {
        let mut g = Graph::new();
        let mut buffers = BufferTable::new();
        let (a, _) = common::input(&mut g, &mut buffers, &[4, 3], DType::Float32);
        let (b, _) = common::input(&mut g, &mut buffers, &[4, 3], DType::Float32);
        let mul = g.push_base(BinaryOps::Mul.into(), SmallVec::from_slice(&[a, b]), OpArg::None, DType::Float32, common::st(&[4, 3]), "cpu");
        let reduce = g.push_base(
            ReduceOps::Sum.into(),
            SmallVec::from_slice(&[mul]),
            OpArg::Axes(SmallVec::from_slice(&[0])),
            DType::Float32,
            common::st(&[3]),
            "cpu",
        );
        let one = common::const_f32(&mut g, &[3], 1.0);
        let add = g.push_base(BinaryOps::Add.into(), SmallVec::from_slice(&[reduce, one]), OpArg::None, DType::Float32, common::st(&[3]), "cpu");
        (g, buffers, add)
    };

    let (mut g1, mut buffers1, add1) = build();
    let (mut g2, mut buffers2, add2) = build();

    let mut seen1 = FnvHashSet::default();
    let mut seen2 = FnvHashSet::default();
    let config = SchedulerConfig::default();
    let (items1, vars1) = create_schedule_with_vars(&[add1], &mut g1, &mut buffers1, &mut seen1, &config).unwrap();
    let (items2, vars2) = create_schedule_with_vars(&[add2], &mut g2, &mut buffers2, &mut seen2, &config).unwrap();

    assert_eq!(items1.len(), items2.len());
    for (i1, i2) in items1.iter().zip(items2.iter()) {
        assert_eq!(i1.ast_kind, i2.ast_kind);
        assert_eq!(i1.bufs, i2.bufs, "identical insertion order into fresh arenas must yield identical buffer ids");
        assert_eq!(i1.ast, i2.ast);
    }
    assert_eq!(vars1, vars2);
}
