//! Composable shape/stride/mask metadata (§4.1, C1).

use std::collections::BTreeMap;
use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::var::{Extent, Variable};
use crate::view::View;

/// An ordered, non-empty sequence of [`View`]s, read as function composition
/// from outer (logical) indexing down to physical offset.
///
/// A single-view tracker is canonical; additional views accumulate only when
/// [`simplify`](ShapeTracker::simplify) cannot collapse them without changing
/// which physical offset each logical index maps to (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeTracker {
    pub views: Vec<View>,
}

impl ShapeTracker {
    pub fn from_shape(shape: Vec<Extent>) -> Self {
        ShapeTracker { views: vec![View::from_shape(shape)] }
    }

    pub fn shape(&self) -> &[Extent] {
        &self.last().shape
    }

    fn last(&self) -> &View {
        self.views.last().expect("ShapeTracker is never empty")
    }

    /// A single canonical view with no mask, zero offset.
    pub fn contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].contiguous
    }

    /// A single view whose strides/offset are row-major-canonical but which
    /// carries a mask (e.g. a pad): not `contiguous()`, but still safe to
    /// load/store directly without materializing a gather (§4.3 "assigns
    /// require the load ShapeTracker to be contiguous or mask-contiguous").
    pub fn mask_contiguous(&self) -> bool {
        if self.views.len() != 1 {
            return false;
        }
        let v = &self.views[0];
        v.mask.is_some() && v.offset == 0 && v.strides == crate::view::strides_for_shape(&v.shape)
    }

    pub fn size(&self) -> Option<i64> {
        self.last().numel()
    }

    pub fn unit_stride_axes(&self) -> Vec<usize> {
        self.last().unit_stride_axes()
    }

    /// All `(Variable, value)` bindings reachable from this tracker's views.
    pub fn var_vals(&self) -> BTreeMap<Variable, i64> {
        let mut out = BTreeMap::new();
        for v in &self.views {
            for e in &v.shape {
                if let Extent::Bound(var, val) = e {
                    out.insert(var.clone(), *val);
                }
            }
        }
        out
    }

    /// Replaces every bound symbolic extent with its unbound form, returning
    /// the extracted bindings separately (§4.1, §8 invariant 6).
    pub fn unbind(&self) -> (Self, BTreeMap<Variable, i64>) {
        let mut var_vals = BTreeMap::new();
        let views = self
            .views
            .iter()
            .map(|v| {
                let shape = v
                    .shape
                    .iter()
                    .map(|e| match e {
                        Extent::Bound(var, val) => {
                            var_vals.insert(var.clone(), *val);
                            Extent::Sym(var.clone())
                        }
                        other => other.clone(),
                    })
                    .collect();
                View { shape, ..v.clone() }
            })
            .collect();
        (ShapeTracker { views }, var_vals)
    }

    fn map_last(&self, f: impl FnOnce(&View) -> View) -> Self {
        let mut views = self.views.clone();
        let new_last = f(views.last().expect("non-empty"));
        *views.last_mut().unwrap() = new_last;
        ShapeTracker { views }
    }

    pub fn permute(&self, axes: &[usize]) -> Self {
        self.map_last(|v| v.permute(axes))
    }

    pub fn shrink(&self, bounds: &[(i64, i64)]) -> Self {
        self.map_last(|v| v.shrink(bounds))
    }

    pub fn expand(&self, new_shape: &[Extent]) -> Self {
        self.map_last(|v| v.expand(new_shape))
    }

    pub fn pad(&self, padding: &[(i64, i64)]) -> Self {
        self.map_last(|v| v.pad(padding))
    }

    /// Appends a fresh canonical view over `new_shape`, then simplifies.
    ///
    /// Reinterpreting a flat index range under a new shape is always valid
    /// as long as the total element count matches: the new view's `idx` is
    /// exactly the identity on flat indices (a pure unravel/ravel), so the
    /// composition never changes the function this tracker represents.
    pub fn reshape(&self, new_shape: Vec<Extent>) -> Self {
        let mut views = self.views.clone();
        views.push(View::from_shape(new_shape));
        ShapeTracker { views }.simplify()
    }

    /// Appends `other`'s views after `self`'s (§4.1: `(a + b).idx(i) == a.idx(b.idx(i))`).
    pub fn compose(&self, other: &Self) -> Self {
        let mut views = self.views.clone();
        views.extend(other.views.iter().cloned());
        ShapeTracker { views }.simplify()
    }

    /// Collapses mergeable adjacent views. Never changes the indexing
    /// function (§4.1); see `DESIGN.md` for which merge cases this
    /// implements vs. leaves as a (still correct) multi-view tracker.
    pub fn simplify(&self) -> Self {
        if self.views.len() < 2 {
            return self.clone();
        }
        let mut views = self.views.clone();
        let mut changed = true;
        while changed && views.len() >= 2 {
            changed = false;
            for i in 0..views.len() - 1 {
                if let Some(merged) = try_merge(&views[i], &views[i + 1]) {
                    views.splice(i..=i + 1, [merged]);
                    changed = true;
                    break;
                }
            }
        }
        ShapeTracker { views }
    }

    /// Reference flat-index -> physical-offset evaluator, used by property
    /// tests to check that `simplify`/`compose` never change semantics.
    /// Returns `None` for a masked-out index.
    pub fn idx(&self, flat: i64) -> Option<i64> {
        let mut cur = flat;
        for v in self.views.iter().rev() {
            cur = v.idx(cur)?;
        }
        Some(cur)
    }
}

impl Add for ShapeTracker {
    type Output = ShapeTracker;
    fn add(self, rhs: ShapeTracker) -> ShapeTracker {
        self.compose(&rhs)
    }
}

impl Add<&ShapeTracker> for &ShapeTracker {
    type Output = ShapeTracker;
    fn add(self, rhs: &ShapeTracker) -> ShapeTracker {
        self.compose(rhs)
    }
}

/// Two adjacent views `(inner, outer)` can be collapsed when `outer` is a
/// mask-free, zero-offset reshape of `inner`'s already-contiguous output, or
/// is a literal no-op over `inner`.
fn try_merge(inner: &View, outer: &View) -> Option<View> {
    if outer.shape == inner.shape
        && outer.strides == inner.strides
        && outer.offset == 0
        && outer.mask.is_none()
    {
        return Some(inner.clone());
    }
    if outer.offset == 0 && outer.mask.is_none() && outer.contiguous && inner.contiguous {
        if let (Some(n1), Some(n2)) = (inner.numel(), outer.numel()) {
            if n1 == n2 {
                return Some(View::from_shape(outer.shape.clone()));
            }
        }
    }
    None
}
