//! The scheduler's fatal error taxonomy (§7).

use thiserror::Error;

/// Errors a scheduling call can fail with. All are fatal to the current
/// call: no partial schedule is ever returned (§7 "Propagation").
///
/// `PadUnsafe` from §7 is deliberately not a variant here: it's an internal,
/// recovered signal that triggers a realize insertion during `realize::`'s
/// pad-safety pass and never escapes to a caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// An augmented-assign's self-operand was not contiguous.
    #[error(
        "assign to a non-contiguous view is unsupported; call .contiguous() on the \
         right-hand side before assigning back into this buffer"
    )]
    BadAssign,

    /// A CONST LazyBuffer's `arg` was neither a recognized scalar dtype nor a `Variable`.
    #[error("CONST argument is not a recognized scalar or bound Variable")]
    BadConst,

    /// An ASSIGN's target was not already realized.
    #[error("assign target must already be realized before it can be written into")]
    AssignTargetUnrealized,

    /// Topological emission did not schedule every group.
    #[error("schedule graph has a cycle: {scheduled} of {total} groups were emitted")]
    CycleDetected { scheduled: usize, total: usize },

    /// An arena identity invariant was violated (a caller bug, not a DAG
    /// shape problem): e.g. a `LbId`/`BufferId` from a different graph.
    #[error("internal DAG consistency check failed: {0}")]
    DagInconsistent(String),
}
