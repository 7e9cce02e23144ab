//! A kernel fusion scheduler for a lazy tensor compiler.
//!
//! Takes a DAG of deferred tensor operations ([`graph::LazyBufferNode`]s) and
//! lowers it to a topologically ordered [`schedule::ScheduleItem`] list ready
//! to hand to a device executor. The scheduler owns realization decisions,
//! reduce fusion, AST lowering, and memory reuse; it does not allocate
//! memory, compile kernels, or execute anything itself — see [`runtime`] for
//! the external contract it assumes.

pub mod buffer;
pub mod config;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod logging;
pub mod lower;
pub mod memory;
pub mod op;
pub mod realize;
pub mod runtime;
pub mod schedule;
pub mod shapetracker;
pub mod var;
pub mod view;

use fnv::FnvHashSet;

pub use buffer::{Buffer, BufferId, BufferOptions, BufferTable};
pub use config::SchedulerConfig;
pub use error::ScheduleError;
pub use graph::{Graph, LazyBufferNode, LbId};
pub use schedule::{ScheduleAst, ScheduleItem};

/// Schedules `outs`, returning only the schedule items (§6
/// `create_schedule`).
pub fn create_schedule(
    outs: &[LbId],
    graph: &mut Graph,
    buffers: &mut BufferTable,
    seen: &mut FnvHashSet<LbId>,
) -> Result<Vec<ScheduleItem>, ScheduleError> {
    let config = SchedulerConfig::from_env();
    schedule::create_schedule(outs, graph, buffers, seen, &config)
}

/// Schedules `outs`, also returning the merged symbolic-variable bindings
/// (§6 `create_schedule_with_vars`).
pub fn create_schedule_with_vars(
    outs: &[LbId],
    graph: &mut Graph,
    buffers: &mut BufferTable,
    seen: &mut FnvHashSet<LbId>,
) -> Result<(Vec<ScheduleItem>, std::collections::BTreeMap<var::Variable, i64>), ScheduleError> {
    let config = SchedulerConfig::from_env();
    schedule::create_schedule_with_vars(outs, graph, buffers, seen, &config)
}
