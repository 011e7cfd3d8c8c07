//! Abstract heap values tracked per heap location.
//!
//! Every block keeps one [`ValueRecord`] per heap location: the value a load
//! at that point would observe, and the store (or merge of stores) that put it
//! there. Values at merge points that are not known yet are represented by a
//! [`PhiPlaceholder`] and only turned into real phis when some load needs them.

use std::fmt;

use crate::ir::{BlockId, Graph, InstId};

/// A (merge block, heap location) pair whose value is the merge of the
/// values flowing in from the block's predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhiPlaceholder {
    block: BlockId,
    location: usize,
}

impl PhiPlaceholder {
    /// Creates the placeholder of `location` at `block`.
    #[must_use]
    pub fn new(block: BlockId, location: usize) -> Self {
        Self { block, location }
    }

    /// The merge block.
    #[must_use]
    pub fn block(self) -> BlockId {
        self.block
    }

    /// The heap location index.
    #[must_use]
    pub fn location(self) -> usize {
        self.location
    }
}

impl fmt::Display for PhiPlaceholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ph({}, {})", self.block, self.location)
    }
}

/// What is known about the content of a heap location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    /// Not computed yet. Only used for placeholder replacements and scratch
    /// state; never stored in a block's records.
    #[default]
    Invalid,
    /// Nothing is known.
    Unknown,
    /// Nothing is known because the predecessors of the placeholder's block
    /// disagree and at least one of them is unknown. The placeholder is kept
    /// so that the stores feeding the merge can be found again.
    MergedUnknown(PhiPlaceholder),
    /// The default value of the location's type, as left by an allocation.
    Default,
    /// The value of an instruction.
    Instruction(InstId),
    /// The merge of predecessor values at a block that is not a loop header.
    NeedsNonLoopPhi(PhiPlaceholder),
    /// A merge that depends on a loop back edge.
    NeedsLoopPhi(PhiPlaceholder),
}

impl Value {
    /// A placeholder value of the right kind.
    #[must_use]
    pub fn for_phi_placeholder(placeholder: PhiPlaceholder, needs_loop_phi: bool) -> Self {
        if needs_loop_phi {
            Self::NeedsLoopPhi(placeholder)
        } else {
            Self::NeedsNonLoopPhi(placeholder)
        }
    }

    /// Returns `true` for every value except [`Value::Invalid`].
    #[must_use]
    pub fn is_valid(self) -> bool {
        !self.is_invalid()
    }

    /// Returns `true` for [`Value::Invalid`].
    #[must_use]
    pub fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// Returns `true` for both kinds of unknown.
    #[must_use]
    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown | Self::MergedUnknown(_))
    }

    /// Returns `true` for [`Value::Unknown`] only.
    #[must_use]
    pub fn is_pure_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Returns `true` for [`Value::MergedUnknown`].
    #[must_use]
    pub fn is_merged_unknown(self) -> bool {
        matches!(self, Self::MergedUnknown(_))
    }

    /// Returns `true` for [`Value::Default`].
    #[must_use]
    pub fn is_default(self) -> bool {
        matches!(self, Self::Default)
    }

    /// Returns `true` for [`Value::Instruction`].
    #[must_use]
    pub fn is_instruction(self) -> bool {
        matches!(self, Self::Instruction(_))
    }

    /// Returns `true` for both kinds of placeholder value.
    #[must_use]
    pub fn needs_phi(self) -> bool {
        matches!(self, Self::NeedsNonLoopPhi(_) | Self::NeedsLoopPhi(_))
    }

    /// Returns `true` for [`Value::NeedsLoopPhi`].
    #[must_use]
    pub fn needs_loop_phi(self) -> bool {
        matches!(self, Self::NeedsLoopPhi(_))
    }

    /// Returns `true` for [`Value::NeedsNonLoopPhi`].
    #[must_use]
    pub fn needs_non_loop_phi(self) -> bool {
        matches!(self, Self::NeedsNonLoopPhi(_))
    }

    /// The instruction of an [`Value::Instruction`].
    #[must_use]
    pub fn instruction(self) -> Option<InstId> {
        match self {
            Self::Instruction(inst) => Some(inst),
            _ => None,
        }
    }

    /// The placeholder of a placeholder value or a merged unknown.
    #[must_use]
    pub fn phi_placeholder(self) -> Option<PhiPlaceholder> {
        match self {
            Self::MergedUnknown(ph) | Self::NeedsNonLoopPhi(ph) | Self::NeedsLoopPhi(ph) => Some(ph),
            _ => None,
        }
    }

    /// Compares two valid values.
    ///
    /// Unknown values never equal anything, not even themselves. The default
    /// value equals any constant whose bits are all zero.
    #[must_use]
    pub fn equals(self, other: Self, graph: &Graph) -> bool {
        if self == other {
            return !self.is_unknown();
        }
        match (self, other) {
            (Self::Default, Self::Instruction(inst)) | (Self::Instruction(inst), Self::Default) => {
                graph.is_zero_bit_pattern(inst)
            }
            _ => false,
        }
    }

    /// Shorthand for comparing with the value of `inst`.
    #[must_use]
    pub fn equals_instruction(self, inst: InstId, graph: &Graph) -> bool {
        self.equals(Self::Instruction(inst), graph)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("invalid"),
            Self::Unknown => f.write_str("unknown"),
            Self::MergedUnknown(ph) => write!(f, "unknown[{ph}]"),
            Self::Default => f.write_str("default"),
            Self::Instruction(inst) => write!(f, "{inst}"),
            Self::NeedsNonLoopPhi(ph) => write!(f, "phi[{ph}]"),
            Self::NeedsLoopPhi(ph) => write!(f, "loop-phi[{ph}]"),
        }
    }
}

/// The tracked state of one heap location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRecord {
    /// The value a load would observe.
    pub value: Value,
    /// The store that wrote `value`: an instruction, a placeholder standing
    /// for the stores of all predecessors, or unknown.
    pub stored_by: Value,
}

impl ValueRecord {
    /// A location about which nothing is known.
    pub const UNKNOWN: Self = Self {
        value: Value::Unknown,
        stored_by: Value::Unknown,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, GraphBuilder};

    #[test]
    fn unknown_values_never_compare_equal() {
        let graph = GraphBuilder::new("void Main.f()")
            .build(|f| {
                f.block(0, |b| b.ret_void());
            })
            .unwrap();
        let ph = PhiPlaceholder::new(BlockId::new(1), 0);
        assert!(!Value::Unknown.equals(Value::Unknown, &graph));
        assert!(!Value::MergedUnknown(ph).equals(Value::MergedUnknown(ph), &graph));
        assert!(Value::NeedsLoopPhi(ph).equals(Value::NeedsLoopPhi(ph), &graph));
        assert!(!Value::NeedsLoopPhi(ph).equals(Value::NeedsNonLoopPhi(ph), &graph));
        assert!(Value::Default.equals(Value::Default, &graph));
    }

    #[test]
    fn default_matches_zero_constants_only() {
        let (graph, (zero, one, neg_zero, null)) = GraphBuilder::new("void Main.f()")
            .build_with(|f| {
                f.block(0, |b| {
                    let zero = b.int(0);
                    let one = b.int(1);
                    let neg_zero = b.double(-0.0);
                    let null = b.null();
                    b.ret_void();
                    (zero, one, neg_zero, null)
                })
            })
            .unwrap();
        assert!(Value::Default.equals_instruction(zero, &graph));
        assert!(Value::Default.equals_instruction(null, &graph));
        assert!(!Value::Default.equals_instruction(one, &graph));
        assert!(!Value::Default.equals_instruction(neg_zero, &graph));
        assert_eq!(graph.ty(neg_zero), DataType::Float64);
    }

    #[test]
    fn placeholders_are_reported() {
        let ph = PhiPlaceholder::new(BlockId::new(3), 2);
        assert_eq!(Value::for_phi_placeholder(ph, true), Value::NeedsLoopPhi(ph));
        assert_eq!(Value::MergedUnknown(ph).phi_placeholder(), Some(ph));
        assert_eq!(Value::Default.phi_placeholder(), None);
        assert_eq!(Value::NeedsNonLoopPhi(ph).to_string(), "phi[ph(B3, 2)]");
    }
}
