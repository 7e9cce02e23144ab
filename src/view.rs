//! A single `(shape, strides, offset, mask)` reindexing record (§3 "View").

use serde::{Deserialize, Serialize};

use crate::var::Extent;

/// Row-major strides implied by a shape, ignoring any mask or offset.
///
/// Symbolic extents must already be bound (`Extent::Bound`) to a concrete
/// value: strides are computed once, at `View` construction time, from
/// whatever values were in scope then; `ShapeTracker::unbind` later swaps
/// `Extent::Bound` entries in `shape` for `Extent::Sym` ones without
/// touching `strides`, since the stride integers don't change when the
/// binding is merely hoisted out into `var_vals` (§4.1).
pub fn strides_for_shape(shape: &[Extent]) -> Vec<i64> {
    let mut strides = vec![0i64; shape.len()];
    let mut acc = 1i64;
    for i in (0..shape.len()).rev() {
        strides[i] = acc;
        let dim = shape[i].value().unwrap_or(1);
        acc *= dim.max(1);
    }
    // a size-1 (or size-0) dimension conventionally carries stride 0, matching
    // the teacher corpus' convention that degenerate axes never participate in
    // addressing.
    for (s, e) in strides.iter_mut().zip(shape.iter()) {
        if e.value() == Some(1) {
            *s = 0;
        }
    }
    strides
}

/// An immutable `(shape, strides, offset, mask?)` record.
///
/// `contiguous` holds iff `strides == strides_for_shape(shape)`, `mask` is
/// `None`, and `offset == 0` (§3 View invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    pub shape: Vec<Extent>,
    pub strides: Vec<i64>,
    pub offset: i64,
    pub mask: Option<Vec<(i64, i64)>>,
    pub contiguous: bool,
}

impl View {
    /// Builds a view, computing `contiguous` from the other fields.
    pub fn create(
        shape: Vec<Extent>,
        strides: Vec<i64>,
        offset: i64,
        mask: Option<Vec<(i64, i64)>>,
    ) -> Self {
        let canonical = strides_for_shape(&shape);
        let contiguous = offset == 0 && mask.is_none() && strides == canonical;
        View { shape, strides, offset, mask, contiguous }
    }

    /// A canonical, contiguous view over `shape`.
    pub fn from_shape(shape: Vec<Extent>) -> Self {
        let strides = strides_for_shape(&shape);
        View { shape, strides, offset: 0, mask: None, contiguous: true }
    }

    /// The number of logical elements, or `None` if the shape has an
    /// unbound symbolic extent.
    pub fn numel(&self) -> Option<i64> {
        self.shape.iter().try_fold(1i64, |acc, e| e.value().map(|v| acc * v.max(0)))
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Axes whose stride is 1 (candidates for the image-dtype 4-channel
    /// packing check, §4.2.6).
    pub fn unit_stride_axes(&self) -> Vec<usize> {
        self.strides
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == 1)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn permute(&self, axes: &[usize]) -> Self {
        debug_assert_eq!(axes.len(), self.shape.len());
        let shape = axes.iter().map(|&i| self.shape[i].clone()).collect();
        let strides = axes.iter().map(|&i| self.strides[i]).collect();
        let mask = self.mask.as_ref().map(|m| axes.iter().map(|&i| m[i]).collect());
        View { shape, strides, offset: self.offset, mask, contiguous: false }
            .recheck_contiguous()
    }

    /// Restricts each axis to `[lo, hi)`, adjusting `offset` accordingly.
    pub fn shrink(&self, bounds: &[(i64, i64)]) -> Self {
        debug_assert_eq!(bounds.len(), self.shape.len());
        let mut offset = self.offset;
        let mut shape = Vec::with_capacity(bounds.len());
        for (i, &(lo, hi)) in bounds.iter().enumerate() {
            offset += lo * self.strides[i];
            shape.push(Extent::Const(hi - lo));
        }
        let mask = self.mask.as_ref().map(|m| {
            m.iter()
                .zip(bounds.iter())
                .map(|(&(mlo, mhi), &(lo, _))| ((mlo - lo).max(0), (mhi - lo).max(0)))
                .collect()
        });
        View { shape, strides: self.strides.clone(), offset, mask, contiguous: false }
            .recheck_contiguous()
    }

    /// Broadcasts size-1 axes up to `new_shape` (stride 0 on broadcast axes).
    pub fn expand(&self, new_shape: &[Extent]) -> Self {
        debug_assert_eq!(new_shape.len(), self.shape.len());
        let mut strides = self.strides.clone();
        for (i, (old, new)) in self.shape.iter().zip(new_shape.iter()).enumerate() {
            if old.value() == Some(1) && new.value() != Some(1) {
                strides[i] = 0;
            }
        }
        let mask = self.mask.clone();
        View { shape: new_shape.to_vec(), strides, offset: self.offset, mask, contiguous: false }
            .recheck_contiguous()
    }

    /// Adds `(before, after)` zero-padding to each axis, introducing a mask.
    pub fn pad(&self, padding: &[(i64, i64)]) -> Self {
        debug_assert_eq!(padding.len(), self.shape.len());
        let shape: Vec<Extent> = self
            .shape
            .iter()
            .zip(padding.iter())
            .map(|(e, &(before, after))| Extent::Const(e.value().unwrap_or(0) + before + after))
            .collect();
        let mut offset = self.offset;
        let mut mask = Vec::with_capacity(padding.len());
        for (i, &(before, _after)) in padding.iter().enumerate() {
            offset -= before * self.strides[i];
            let dim = self.shape[i].value().unwrap_or(0);
            mask.push((before, before + dim));
        }
        View { shape, strides: self.strides.clone(), offset, mask: Some(mask), contiguous: false }
            .recheck_contiguous()
    }

    fn recheck_contiguous(mut self) -> Self {
        let canonical = strides_for_shape(&self.shape);
        self.contiguous = self.offset == 0 && self.mask.is_none() && self.strides == canonical;
        self
    }

    /// Evaluates this view as a flat-index -> physical-offset function.
    /// Returns `None` when the index falls outside the mask.
    pub fn idx(&self, flat: i64) -> Option<i64> {
        let mut rem = flat;
        let mut offset = self.offset;
        for d in (0..self.shape.len()).rev() {
            let dim = self.shape[d].value().unwrap_or(1).max(1);
            let coord = rem % dim;
            rem /= dim;
            if let Some(mask) = &self.mask {
                let (lo, hi) = mask[d];
                if coord < lo || coord >= hi {
                    return None;
                }
            }
            offset += coord * self.strides[d];
        }
        Some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[i64]) -> Vec<Extent> {
        dims.iter().map(|&d| Extent::Const(d)).collect()
    }

    #[test]
    fn from_shape_is_row_major_contiguous() {
        let v = View::from_shape(shape(&[2, 3, 4]));
        assert!(v.contiguous);
        assert_eq!(v.strides, vec![12, 4, 1]);
    }

    #[test]
    fn size_one_axes_carry_zero_stride() {
        let v = View::from_shape(shape(&[1, 5]));
        assert_eq!(v.strides, vec![0, 1]);
    }

    #[test]
    fn permute_reorders_shape_and_strides() {
        let v = View::from_shape(shape(&[2, 3]));
        let p = v.permute(&[1, 0]);
        assert_eq!(p.shape, shape(&[3, 2]));
        assert_eq!(p.strides, vec![1, 3]);
        assert!(!p.contiguous);
    }

    #[test]
    fn shrink_adjusts_offset_and_shape() {
        let v = View::from_shape(shape(&[4, 4]));
        let s = v.shrink(&[(1, 3), (0, 4)]);
        assert_eq!(s.shape, shape(&[2, 4]));
        assert_eq!(s.offset, 4);
    }

    #[test]
    fn expand_zeroes_stride_on_broadcast_axes() {
        let v = View::from_shape(shape(&[1, 4]));
        let e = v.expand(&[Extent::Const(8), Extent::Const(4)]);
        assert_eq!(e.strides[0], 0);
        assert_eq!(e.strides[1], 1);
    }

    #[test]
    fn pad_introduces_mask_and_shifts_offset() {
        let v = View::from_shape(shape(&[4]));
        let p = v.pad(&[(2, 2)]);
        assert_eq!(p.shape, shape(&[8]));
        assert_eq!(p.mask, Some(vec![(2, 6)]));
        assert!(!p.contiguous);
    }

    #[test]
    fn idx_masks_out_padding_region() {
        let v = View::from_shape(shape(&[4])).pad(&[(2, 2)]);
        assert_eq!(v.idx(0), None);
        assert_eq!(v.idx(2), Some(0));
        assert_eq!(v.idx(5), Some(3));
        assert_eq!(v.idx(7), None);
    }

    #[test]
    fn numel_is_none_for_unbound_symbolic_shape() {
        let v = View::from_shape(vec![Extent::Sym(crate::var::Variable::new("N", 1, 8))]);
        assert_eq!(v.numel(), None);
    }
}
