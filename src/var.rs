//! Symbolic dimension variables (§3 "Variable").

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A named symbolic integer with an inclusive range `[min, max]`.
///
/// Identity is by name: two `Variable`s with the same name are the same
/// dimension variable, regardless of where they were constructed, matching
/// how dynamic-shape tensors share a variable across unrelated LazyBuffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    name: Arc<str>,
    pub min: i64,
    pub max: i64,
}

impl Variable {
    pub fn new(name: impl Into<Arc<str>>, min: i64, max: i64) -> Self {
        Variable { name: name.into(), min, max }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for Variable {}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Variable {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Variable {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// A dimension extent: either a concrete integer, or a symbolic variable
/// that has been bound to a concrete value for this scheduling call.
///
/// Unbound symbolic extents do not appear inside a `ShapeTracker` that is
/// about to be emitted into an AST: `ShapeTracker::unbind` replaces every
/// `Extent::Bound` with a plain `Extent::Sym`, recording the binding
/// separately (§4.1 `unbind`, §8 invariant 6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extent {
    Const(i64),
    /// A symbolic extent not yet bound to a value (valid inside an AST).
    Sym(Variable),
    /// A symbolic extent bound to a concrete value (valid only before `unbind`).
    Bound(Variable, i64),
}

impl Extent {
    /// The concrete value, if known (bound symbolic extents count).
    pub fn value(&self) -> Option<i64> {
        match self {
            Extent::Const(v) => Some(*v),
            Extent::Sym(_) => None,
            Extent::Bound(_, v) => Some(*v),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        !matches!(self, Extent::Const(_))
    }
}

impl From<i64> for Extent {
    fn from(v: i64) -> Self {
        Extent::Const(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variables_are_identified_by_name_not_range() {
        let a = Variable::new("N", 1, 16);
        let b = Variable::new("N", 1, 1024);
        assert_eq!(a, b);
    }

    #[test]
    fn extent_value_reflects_binding_state() {
        let v = Variable::new("N", 1, 16);
        assert_eq!(Extent::Const(4).value(), Some(4));
        assert_eq!(Extent::Sym(v.clone()).value(), None);
        assert_eq!(Extent::Bound(v, 8).value(), Some(8));
    }

    #[test]
    fn only_const_extents_are_non_symbolic() {
        let v = Variable::new("N", 1, 16);
        assert!(!Extent::Const(4).is_symbolic());
        assert!(Extent::Sym(v.clone()).is_symbolic());
        assert!(Extent::Bound(v, 8).is_symbolic());
    }
}
