//! Heap locations and array index normalisation.

use crate::ir::{BinaryOp, DataType, FieldId, Graph, InstId, Op};

/// What part of an object a location names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationKind {
    /// An instance or static field.
    Field(FieldId),
    /// An array element at the value of `index`.
    ArrayElement {
        /// The index instruction.
        index: InstId,
    },
}

/// A storable slot: a field of a reference, or an array element.
///
/// Static fields are fields of the `LoadClass` reference of their class.
/// Null and bounds checks are separate instructions, so an access itself
/// only throws when it is a reference array store needing a store check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLocation {
    pub(crate) ref_info: usize,
    pub(crate) kind: LocationKind,
    pub(crate) ty: DataType,
    pub(crate) is_volatile: bool,
    pub(crate) may_throw: bool,
    pub(crate) has_aliased_locations: bool,
}

impl HeapLocation {
    /// Index of the reference info of the base reference.
    #[must_use]
    pub fn ref_info(&self) -> usize {
        self.ref_info
    }

    /// Field or element selector.
    #[must_use]
    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    /// Type of the slot.
    #[must_use]
    pub fn ty(&self) -> DataType {
        self.ty
    }

    /// Returns `true` for a volatile field.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.is_volatile
    }

    /// Returns `true` if some access to the slot may throw.
    #[must_use]
    pub fn may_throw(&self) -> bool {
        self.may_throw
    }

    /// Returns `true` for array elements.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self.kind, LocationKind::ArrayElement { .. })
    }

    /// The index instruction of an array element.
    #[must_use]
    pub fn index(&self) -> Option<InstId> {
        match self.kind {
            LocationKind::ArrayElement { index } => Some(index),
            LocationKind::Field(_) => None,
        }
    }

    /// The accessed field.
    #[must_use]
    pub fn field(&self) -> Option<FieldId> {
        match self.kind {
            LocationKind::Field(field) => Some(field),
            LocationKind::ArrayElement { .. } => None,
        }
    }

    /// Returns `true` if some other location may alias this one.
    #[must_use]
    pub fn has_aliased_locations(&self) -> bool {
        self.has_aliased_locations
    }
}

/// An index split into a symbolic base and a constant offset.
///
/// `base` is `None` for constant indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedIndex {
    /// Non-constant part of the index.
    pub base: Option<InstId>,
    /// Constant part of the index.
    pub offset: i64,
}

impl NormalizedIndex {
    /// Splits `index` into base and offset.
    #[must_use]
    pub fn of(graph: &Graph, index: InstId) -> Self {
        let constant = |id: InstId| graph.constant_value(id).and_then(|c| c.as_i64());

        if let Some(value) = constant(index) {
            return Self {
                base: None,
                offset: value,
            };
        }
        match *graph.op(index) {
            Op::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            } => {
                if let Some(c) = constant(rhs) {
                    return Self {
                        base: Some(lhs),
                        offset: c,
                    };
                }
                if let Some(c) = constant(lhs) {
                    return Self {
                        base: Some(rhs),
                        offset: c,
                    };
                }
            }
            Op::Binary {
                op: BinaryOp::Sub,
                lhs,
                rhs,
            } => {
                if let Some(c) = constant(rhs).and_then(i64::checked_neg) {
                    return Self {
                        base: Some(lhs),
                        offset: c,
                    };
                }
            }
            _ => {}
        }
        Self {
            base: Some(index),
            offset: 0,
        }
    }

    /// Returns `true` if the two indices may evaluate to the same value at
    /// the same program point.
    #[must_use]
    pub fn may_overlap(self, other: Self) -> bool {
        match (self.base, other.base) {
            (None, None) => self.offset == other.offset,
            (Some(a), Some(b)) if a == b => self.offset == other.offset,
            _ => true,
        }
    }
}
