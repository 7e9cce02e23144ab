//! The topological emitter (C5, §4.4) and the public scheduling entry
//! points (§6).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use indexmap::IndexMap;

use crate::buffer::{Buffer, BufferId, BufferOptions, BufferTable};
use crate::config::SchedulerConfig;
use crate::error::ScheduleError;
use crate::graph::{Graph, LbId};
use crate::logging::{self, GraphEvent};
use crate::lower::{self, LoweredAst, LoweredGroup};
use crate::memory;
use crate::op::{LazyOp, MetaOps, OpArg};
use crate::realize;
use crate::var::Variable;

/// Whether a [`ScheduleItem`]'s ast is a real kernel body or a bare meta-op
/// (COPY/EMPTY/VIEW/CUSTOM). Kernel items are the only ones the memory
/// planner is allowed to rewrite buffers of (§4.5 opt-out set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAst {
    Kernel,
    Meta,
}

/// One unit of work: a kernel, a copy, a view, or an empty allocation
/// (§3 "ScheduleItem").
///
/// If `ast_kind == Kernel` and the ast's root has N `STORE` children, the
/// first N entries of `bufs` are outputs and the rest are inputs. Otherwise
/// `bufs[0]` is the output and `bufs[1..]` are inputs.
#[derive(Debug, Clone)]
pub struct ScheduleItem {
    pub ast: Arc<LazyOp>,
    pub ast_kind: ScheduleAst,
    pub bufs: Vec<BufferId>,
    pub metadata: Vec<Arc<str>>,
}

fn alloc_buffer_for(graph: &Graph, buffers: &mut BufferTable, id: LbId) -> BufferId {
    if let Some(existing) = graph.get(id).realized {
        return existing;
    }
    let node = graph.get(id);
    let size = node.st.size().unwrap_or(1).max(0) as usize;
    buffers.insert(Buffer::new(node.device.clone(), size.max(1), node.dtype, BufferOptions::default()))
}

/// Runs C3 (realize) -> C4 (lower each group) -> C5 (topological emit) ->
/// C6 (memory plan), returning the emitted schedule and the merged variable
/// bindings.
pub fn create_schedule_with_vars(
    outs: &[LbId],
    graph: &mut Graph,
    buffers: &mut BufferTable,
    seen: &mut FnvHashSet<LbId>,
    config: &SchedulerConfig,
) -> Result<(Vec<ScheduleItem>, BTreeMap<Variable, i64>), ScheduleError> {
    let span = logging::schedule_span(outs.len());
    let _guard = span.enter();
    if config.debug > 0 {
        tracing::debug!(target: "tensor_scheduler", num_outs = outs.len(), debug = config.debug, "create_schedule_with_vars start");
    }

    let result = realize::decide(outs, seen, graph, config);
    logging::emit_graph_event(
        config,
        &GraphEvent::RealizeDecided { realized: result.realize_set.len(), groups: result.output_groups.len() },
    );

    let mut assign_writer_target: FnvHashMap<LbId, LbId> = FnvHashMap::default();
    for (&target, &writer) in result.assign_targets.iter() {
        assign_writer_target.insert(writer, target);
    }

    let keys: Vec<LbId> = result.output_groups.keys().copied().collect();
    let mut owner_of: FnvHashMap<LbId, LbId> = FnvHashMap::default();
    for (&key, members) in result.output_groups.iter() {
        for &m in members {
            owner_of.insert(m, key);
        }
    }

    let mut lowered_by_key: IndexMap<LbId, LoweredGroup> = IndexMap::new();
    for (&key, members) in result.output_groups.iter() {
        let lg = lower::lower_group(members, graph, &result.assign_targets, &result.fused_reduces, config.use_copy_kernel)?;
        logging::emit_graph_event(config, &GraphEvent::GroupLowered { group: key.0, inputs: lg.inputs.len() });
        lowered_by_key.insert(key, lg);
    }

    let mut indegree: FnvHashMap<LbId, usize> = keys.iter().map(|&k| (k, 0)).collect();
    let mut adj: FnvHashMap<LbId, Vec<LbId>> = FnvHashMap::default();

    for (&key, lg) in &lowered_by_key {
        for &input_base in &lg.inputs {
            if let Some(&parent) = owner_of.get(&input_base) {
                if parent != key {
                    adj.entry(parent).or_default().push(key);
                    *indegree.get_mut(&key).unwrap() += 1;
                }
            }
        }
    }
    for (&target, assign_op) in &result.assign_targets {
        let assign_group = match owner_of.get(assign_op) {
            Some(&g) => g,
            None => continue,
        };
        for (&key, lg) in &lowered_by_key {
            if key == assign_group {
                continue;
            }
            if lg.inputs.contains(&target) {
                adj.entry(key).or_default().push(assign_group);
                *indegree.get_mut(&assign_group).unwrap() += 1;
            }
        }
    }

    let mut queue: VecDeque<LbId> = keys.iter().copied().filter(|k| indegree[k] == 0).collect();
    let mut order = Vec::with_capacity(keys.len());
    while let Some(k) = queue.pop_front() {
        order.push(k);
        if let Some(children) = adj.get(&k) {
            for &c in children {
                let d = indegree.get_mut(&c).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push_back(c);
                }
            }
        }
    }
    if order.len() != keys.len() {
        return Err(ScheduleError::CycleDetected { scheduled: order.len(), total: keys.len() });
    }

    let mut var_vals: BTreeMap<Variable, i64> = BTreeMap::new();
    let mut items = Vec::with_capacity(order.len());

    for key in order {
        let members = result.output_groups.get(&key).expect("group key came from output_groups");
        let lowered = lowered_by_key.shift_remove(&key).expect("each group lowered exactly once");
        var_vals.extend(lowered.var_vals.clone());

        let mut out_bufs = Vec::with_capacity(members.len());
        for &m in members {
            let buf_id = match assign_writer_target.get(&m) {
                Some(&target) => graph.get(target).realized.ok_or(ScheduleError::AssignTargetUnrealized)?,
                None => alloc_buffer_for(graph, buffers, m),
            };
            graph.mark_realized(m, buf_id);
            out_bufs.push(buf_id);
        }
        let in_bufs: Vec<BufferId> = lowered
            .inputs
            .iter()
            .map(|&i| graph.get(i).realized.expect("lowering only references already-realized inputs"))
            .collect();

        let (ast, ast_kind) = match lowered.ast {
            LoweredAst::Kernel(ast) => (ast, ScheduleAst::Kernel),
            LoweredAst::Meta { op, .. } => (Arc::new(LazyOp::leaf(op, OpArg::None)), ScheduleAst::Meta),
        };

        let mut bufs = out_bufs;
        bufs.extend(in_bufs);
        // Every buffer referenced by a schedule item holds a live reference
        // to it; the memory planner transfers this count when it supersedes
        // a buffer with a shared backing allocation (§4.5, §3 Buffer lifecycle).
        for &b in &bufs {
            buffers.get_mut(b).refcount += 1;
        }
        items.push(ScheduleItem { ast, ast_kind, bufs, metadata: lowered.metadata });

        for &m in members {
            seen.insert(m);
            graph.get_mut(m).scheduled = true;
            graph.get_mut(m).srcs.clear();
        }
    }

    logging::emit_graph_event(config, &GraphEvent::ScheduleEmitted { items: items.len() });

    if !config.no_memory_planner {
        let before = buffers.len();
        memory::plan(buffers, &mut items);
        logging::emit_graph_event(config, &GraphEvent::MemoryPlanned { before, after: buffers.len() });
    }

    if let Some(path) = &config.logops {
        if let Err(e) = logging::log_ops(path, &items) {
            tracing::warn!(target: "tensor_scheduler", error = %e, path = %path.display(), "failed to append LOGOPS log");
        }
    }
    if config.save_schedule != 0 {
        let path = std::env::temp_dir().join("tensor_scheduler_schedule.jsonl");
        if let Err(e) = logging::save_schedule(&path, outs, &items) {
            tracing::warn!(target: "tensor_scheduler", error = %e, path = %path.display(), "failed to append SAVE_SCHEDULE log");
        }
    }

    Ok((items, var_vals))
}

/// As [`create_schedule_with_vars`], discarding the variable-binding map.
pub fn create_schedule(
    outs: &[LbId],
    graph: &mut Graph,
    buffers: &mut BufferTable,
    seen: &mut FnvHashSet<LbId>,
    config: &SchedulerConfig,
) -> Result<Vec<ScheduleItem>, ScheduleError> {
    create_schedule_with_vars(outs, graph, buffers, seen, config).map(|(items, _)| items)
}
