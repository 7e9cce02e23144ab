//! The unscheduled LazyBuffer DAG, held as an arena of indices (§3
//! "LazyBuffer", §9 "implement with arena + indices").

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::buffer::BufferId;
use crate::dtype::DType;
use crate::op::{Op, OpArg};
use crate::shapetracker::ShapeTracker;

/// Identity handle for a node in a [`Graph`]. Two `LbId`s are the same
/// LazyBuffer iff they're equal as integers — there is no structural
/// equality, matching §9's "identity equality... never structural".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LbId(pub u32);

/// A node in the unscheduled DAG.
///
/// If `base != id-of-self` this node is a *view*: `op`/`srcs`/`arg` are
/// meaningless and it carries only a `ShapeTracker` re-indexing `base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyBufferNode {
    pub op: Option<Op>,
    pub srcs: SmallVec<[LbId; 2]>,
    pub arg: OpArg,
    pub dtype: DType,
    pub st: ShapeTracker,
    pub base: LbId,
    pub realized: Option<BufferId>,
    pub forced_realize: bool,
    pub metadata: Option<Arc<str>>,
    pub device: Arc<str>,
    /// Set once this node has been finalized into a `ScheduleItem`'s output
    /// (§9 "lazy deletion of srcs after scheduling"). Re-traversal of a
    /// scheduled node's `srcs` is a caller bug.
    pub scheduled: bool,
}

/// An arena of [`LazyBufferNode`]s, freed wholesale once a schedule has been
/// emitted. Read-only during scheduling: no node is ever mutated in place
/// except for `realized`, `forced_realize`, `scheduled`, and the image-dtype
/// demotion of §4.2.6.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<LazyBufferNode>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: LbId) -> &LazyBufferNode {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: LbId) -> &mut LazyBufferNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn is_base(&self, id: LbId) -> bool {
        self.get(id).base == id
    }

    pub fn is_view(&self, id: LbId) -> bool {
        !self.is_base(id)
    }

    /// Inserts a base LazyBuffer (one that carries an actual operation).
    #[allow(clippy::too_many_arguments)]
    pub fn push_base(
        &mut self,
        op: Op,
        srcs: SmallVec<[LbId; 2]>,
        arg: OpArg,
        dtype: DType,
        st: ShapeTracker,
        device: impl Into<Arc<str>>,
    ) -> LbId {
        let id = LbId(self.nodes.len() as u32);
        self.nodes.push(LazyBufferNode {
            op: Some(op),
            srcs,
            arg,
            dtype,
            st,
            base: id,
            realized: None,
            forced_realize: false,
            metadata: None,
            device: device.into(),
            scheduled: false,
        });
        id
    }

    /// Inserts a view LazyBuffer re-indexing `base` through `st`.
    pub fn push_view(&mut self, base: LbId, st: ShapeTracker) -> LbId {
        let dtype = self.get(base).dtype;
        let device = self.get(base).device.clone();
        let id = LbId(self.nodes.len() as u32);
        self.nodes.push(LazyBufferNode {
            op: None,
            srcs: SmallVec::new(),
            arg: OpArg::None,
            dtype,
            st,
            base,
            realized: None,
            forced_realize: false,
            metadata: None,
            device,
            scheduled: false,
        });
        id
    }

    pub fn set_metadata(&mut self, id: LbId, tag: impl Into<Arc<str>>) {
        self.get_mut(id).metadata = Some(tag.into());
    }

    pub fn mark_realized(&mut self, id: LbId, buf: BufferId) {
        self.get_mut(id).realized = Some(buf);
    }

    pub fn force_realize(&mut self, id: LbId) {
        self.get_mut(id).forced_realize = true;
    }

    pub fn is_realized(&self, id: LbId) -> bool {
        self.get(id).realized.is_some()
    }
}
