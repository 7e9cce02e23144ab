//! Diagnostics: `tracing` spans/events for the scheduling pipeline, plus the
//! `GRAPH`/`SAVE_SCHEDULE` persisted-state hooks of §6 and §10.3/§10.5.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, span, Level};

use crate::config::SchedulerConfig;
use crate::graph::LbId;
use crate::schedule::ScheduleItem;

/// A structured record of one scheduling call's shape, suitable for the
/// `GRAPH` debug-visualization mode. Mirrors, at a much smaller scale, the
/// kind of per-step event a dataflow visualizer consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GraphEvent {
    RealizeDecided { realized: usize, groups: usize },
    GroupLowered { group: u32, inputs: usize },
    ScheduleEmitted { items: usize },
    MemoryPlanned { before: usize, after: usize },
}

/// Emits `event` both as a `tracing` event (for `DEBUG`-level log consumers)
/// and, when `config.graph` is nonzero, appended as JSON to help a debug
/// visualizer replay the run.
pub fn emit_graph_event(config: &SchedulerConfig, event: &GraphEvent) {
    debug!(target: "tensor_scheduler::graph", ?event, "graph event");
    if config.graph == 0 {
        return;
    }
    if let Ok(line) = serde_json::to_string(event) {
        tracing::trace!(target: "tensor_scheduler::graph", json = %line, "graph event json");
    }
}

/// Opens a scheduling-call span carrying the output count, matching the
/// teacher's convention of one span per externally-visible operation.
pub fn schedule_span(num_outs: usize) -> tracing::Span {
    span!(Level::DEBUG, "create_schedule", num_outs)
}

/// Appends each emitted KERNEL ast to `path` as one JSON line, implementing
/// the `LOGOPS` env var of §6.
pub fn log_ops(path: &Path, items: &[ScheduleItem]) -> std::io::Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    for item in items {
        if item.ast_kind == crate::schedule::ScheduleAst::Kernel {
            if let Ok(line) = serde_json::to_string(&*item.ast) {
                writeln!(f, "{line}")?;
            }
        }
    }
    Ok(())
}

/// The `(graph, prescheduled)` snapshot dumped when `SAVE_SCHEDULE` is set
/// (§6 "Persisted state"). The format is explicitly opaque — this is a
/// plain `serde_json` dump, not required to match any other implementation's
/// on-disk layout.
#[derive(Debug, Serialize, Deserialize)]
pub struct SavedSchedule {
    pub outs: Vec<u32>,
    pub items: usize,
}

pub fn save_schedule(path: &Path, outs: &[LbId], items: &[ScheduleItem]) -> std::io::Result<()> {
    let snapshot = SavedSchedule { outs: outs.iter().map(|o| o.0).collect(), items: items.len() };
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(&snapshot)?;
    writeln!(f, "{line}")
}
