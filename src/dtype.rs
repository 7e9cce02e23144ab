//! Scalar types carried by `LazyBuffer`s and `Buffer`s.

use serde::{Deserialize, Serialize};

/// The concrete image-dtype layout constraint (§4.2.6).
///
/// An image dtype additionally demands that some axis of the tensor has
/// unit stride and a length divisible by 4, to match the hardware's
/// 4-channel texel layout. `shape` is that texel-grid shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDType {
    pub shape: (usize, usize, usize),
}

/// A scalar element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
    Image(ImageDType),
}

impl DType {
    /// Size in bytes of one element.
    pub fn itemsize(&self) -> usize {
        match self {
            DType::Bool => 1,
            DType::Int32 => 4,
            DType::Int64 => 8,
            DType::Float16 => 2,
            DType::Float32 => 4,
            DType::Float64 => 8,
            DType::Image(_) => 4,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, DType::Image(_))
    }
}

/// A scalar constant payload, as carried by `ConstBuffer` and `MetaOps::Const`.
///
/// This is the Rust-side counterpart of tinygrad's `ConstType` union; a
/// `BadConst` error is raised (§7) when a `CONST` LazyBuffer's `arg` cannot be
/// expressed as one of these (or as a bound `Variable`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ConstValue {
    pub fn is_zero(&self) -> bool {
        match self {
            ConstValue::Bool(b) => !b,
            ConstValue::Int(i) => *i == 0,
            ConstValue::Float(f) => *f == 0.0,
        }
    }
}
