//! The memory planner (C6, §4.5): reassigns intermediate buffers so that
//! non-overlapping lifetimes share physical storage.

use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::buffer::{Buffer, BufferId, BufferOptions, BufferTable};
use crate::dtype::DType;
use crate::schedule::{ScheduleAst, ScheduleItem};

type AllocKey = (Arc<str>, DType, BufferOptions, Option<usize>);

struct FreeSeg {
    start: usize,
    end: usize,
    backing: BufferId,
}

/// Number of leading `bufs` entries that are this item's outputs (§8
/// invariant 5: a KERNEL ast with N STORE children has N output bufs).
fn num_outputs(item: &ScheduleItem) -> usize {
    match item.ast_kind {
        ScheduleAst::Kernel => item.ast.srcs.len().max(1),
        ScheduleAst::Meta => 1,
    }
}

/// Rewrites every `ScheduleItem.bufs` in place so that buffers with
/// disjoint `[first, last]` schedule-index lifetimes share storage.
///
/// Buffers referenced by a non-`Kernel` item (COPY/TRANSFER) are left
/// untouched (§4.5 "opt-out set"), as are buffers that are already views or
/// already allocated externally.
pub fn plan(buffers: &mut BufferTable, items: &mut [ScheduleItem]) {
    let mut opt_out: FnvHashSet<BufferId> = FnvHashSet::default();
    for item in items.iter() {
        if !matches!(item.ast_kind, ScheduleAst::Kernel) {
            opt_out.extend(item.bufs.iter().copied());
        }
    }

    let mut first: FnvHashMap<BufferId, usize> = FnvHashMap::default();
    let mut last: FnvHashMap<BufferId, usize> = FnvHashMap::default();
    let mut produced: FnvHashSet<BufferId> = FnvHashSet::default();
    for (i, item) in items.iter().enumerate() {
        for &b in &item.bufs {
            first.entry(b).or_insert(i);
            last.insert(b, i);
        }
        let n = num_outputs(item);
        produced.extend(item.bufs.iter().take(n).copied());
    }

    // Only buffers this batch actually materializes are eligible for reuse;
    // buffers that are purely inputs here were allocated by an earlier call
    // (or handed in by the caller) and are owned outside this plan.
    let mut candidates: Vec<BufferId> = produced
        .iter()
        .copied()
        .filter(|b| !opt_out.contains(b) && !buffers.get(*b).is_view() && !buffers.get(*b).is_allocated())
        .collect();
    candidates.sort_by(|a, b| buffers.get(*b).nbytes().cmp(&buffers.get(*a).nbytes()));

    let last_index = items.len().saturating_sub(1);
    let mut free_segs: FnvHashMap<AllocKey, Vec<FreeSeg>> = FnvHashMap::default();
    let mut assignment: FnvHashMap<BufferId, BufferId> = FnvHashMap::default();

    for cand in &candidates {
        let (s, e) = (first[cand], last[cand]);
        let key = buffers.get(*cand).alloc_key();
        let seg_list = free_segs.entry(key).or_default();
        let found_idx = seg_list.iter().position(|seg| seg.start <= s && e <= seg.end);
        let (backing, seg_start, seg_end) = match found_idx {
            Some(i) => {
                let seg = seg_list.remove(i);
                (seg.backing, seg.start, seg.end)
            }
            None => (*cand, 0, last_index),
        };
        assignment.insert(*cand, backing);
        if seg_start < s {
            seg_list.push(FreeSeg { start: seg_start, end: s - 1, backing });
        }
        if e < seg_end {
            seg_list.push(FreeSeg { start: e + 1, end: seg_end, backing });
        }
    }

    let mut remap: FnvHashMap<BufferId, BufferId> = FnvHashMap::default();
    for (cand, backing) in assignment {
        if backing == cand {
            continue;
        }
        let cand_buf = buffers.get(cand).clone();
        let backing_buf = buffers.get(backing).clone();
        let new_id = if cand_buf.nbytes() == backing_buf.nbytes() {
            backing
        } else {
            buffers.insert(Buffer::view_of(backing, &backing_buf, cand_buf.size, 0))
        };
        // `cand`'s own slot no longer holds any live reference once every
        // item referencing it is rewritten to `new_id` below; the refcount
        // moves with it (§3 Buffer lifecycle).
        let moved = buffers.get(cand).refcount;
        buffers.get_mut(cand).refcount = 0;
        buffers.get_mut(new_id).refcount += moved;
        remap.insert(cand, new_id);
    }

    for item in items.iter_mut() {
        for b in item.bufs.iter_mut() {
            if let Some(&new_id) = remap.get(b) {
                *b = new_id;
            }
        }
    }
}
