//! The closed set of instruction operations.
//!
//! Every instruction carries one [`Op`]. Operands are named fields holding
//! [`InstId`]s, so passes can pattern-match on exactly the shapes they care about
//! and the compiler checks exhaustiveness wherever all kinds must be handled.
//!
//! # Operand order
//!
//! [`Op::inputs`] reports operands in a fixed order per variant. The order is
//! part of the dump format and of the use lists kept by [`crate::ir::Graph`];
//! [`Op::inputs_mut`] yields the same operands in the same order.

use std::fmt;

use bitflags::bitflags;
use strum::EnumDiscriminants;

use crate::ir::{ClassId, ConstValue, DataType, FieldId, InstId};

bitflags! {
    /// Side effects of an invoked method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SideEffects: u8 {
        /// The callee may read any heap location reachable by it.
        const READS_HEAP = 0b0001;
        /// The callee may write any heap location reachable by it.
        const WRITES_HEAP = 0b0010;
        /// The callee may throw.
        const CAN_THROW = 0b0100;
    }
}

impl SideEffects {
    /// A callee about which nothing is known.
    pub const OPAQUE: Self = Self::all();

    /// A pure callee.
    pub const PURE: Self = Self::empty();
}

/// Two-operand arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum BinaryOp {
    /// `lhs + rhs`
    Add,
    /// `lhs - rhs`
    Sub,
    /// `lhs * rhs`
    Mul,
    /// `lhs / rhs`, throws on integral division by zero
    Div,
    /// `lhs % rhs`, throws on integral division by zero
    Rem,
    /// `lhs & rhs`
    And,
    /// `lhs | rhs`
    Or,
    /// `lhs ^ rhs`
    Xor,
    /// `lhs << rhs`
    Shl,
    /// `lhs >> rhs` (arithmetic)
    Shr,
    /// `lhs >>> rhs` (logical)
    UShr,
}

/// Single-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    Not,
}

/// Comparison conditions producing a `Bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Condition {
    /// `lhs == rhs`
    Equal,
    /// `lhs != rhs`
    NotEqual,
    /// `lhs < rhs`
    LessThan,
    /// `lhs <= rhs`
    LessThanOrEqual,
    /// `lhs > rhs`
    GreaterThan,
    /// `lhs >= rhs`
    GreaterThanOrEqual,
}

/// An instruction operation.
#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(name(OpKind), derive(Hash, strum::IntoStaticStr))]
pub enum Op {
    /// The `index`-th method parameter.
    ParameterValue {
        /// Zero-based parameter index.
        index: usize,
    },
    /// An interned constant, always placed in the entry block.
    Constant(ConstValue),
    /// Binary arithmetic on values of the instruction's type.
    Binary {
        /// The operation.
        op: BinaryOp,
        /// Left operand.
        lhs: InstId,
        /// Right operand.
        rhs: InstId,
    },
    /// Unary arithmetic.
    Unary {
        /// The operation.
        op: UnaryOp,
        /// Operand.
        input: InstId,
    },
    /// Comparison producing a `Bool`.
    Compare {
        /// The condition tested.
        cond: Condition,
        /// Left operand.
        lhs: InstId,
        /// Right operand.
        rhs: InstId,
    },
    /// Conversion of `input` to the instruction's type.
    TypeConversion {
        /// Value converted.
        input: InstId,
    },
    /// Throws if `input` is null, otherwise yields `input`.
    NullCheck {
        /// Checked reference.
        input: InstId,
    },
    /// Yields `input` with a refined static class.
    BoundType {
        /// Refined reference.
        input: InstId,
    },
    /// Throws if `index` is not within `0..length`, otherwise yields `index`.
    BoundsCheck {
        /// Checked index.
        index: InstId,
        /// Array length.
        length: InstId,
    },
    /// Length of an array.
    ArrayLength {
        /// The array.
        array: InstId,
    },
    /// Allocation of a class instance with all fields zeroed.
    NewInstance {
        /// Allocated class.
        class: ClassId,
        /// The allocation also performs an access or initialization check.
        needs_checks: bool,
    },
    /// Allocation of an array with all elements zeroed.
    NewArray {
        /// Element count.
        length: InstId,
        /// Element type.
        elem: DataType,
    },
    /// The class object of `class`, base of static field accesses.
    LoadClass {
        /// Loaded class.
        class: ClassId,
    },
    /// Runs the static initializer of `class` if needed.
    ClinitCheck {
        /// The `LoadClass` being initialized.
        class: InstId,
    },
    /// `object.field`
    InstanceFieldGet {
        /// Receiver.
        object: InstId,
        /// Accessed field.
        field: FieldId,
    },
    /// `object.field = value`; when `predicated`, a null `object` skips the store.
    InstanceFieldSet {
        /// Receiver.
        object: InstId,
        /// Accessed field.
        field: FieldId,
        /// Stored value.
        value: InstId,
        /// Skip the store when `object` is null.
        predicated: bool,
    },
    /// `Class.field`
    StaticFieldGet {
        /// The `LoadClass` (or `ClinitCheck`) of the declaring class.
        class: InstId,
        /// Accessed field.
        field: FieldId,
    },
    /// `Class.field = value`
    StaticFieldSet {
        /// The `LoadClass` (or `ClinitCheck`) of the declaring class.
        class: InstId,
        /// Accessed field.
        field: FieldId,
        /// Stored value.
        value: InstId,
    },
    /// `array[index]`
    ArrayGet {
        /// The array.
        array: InstId,
        /// Element index.
        index: InstId,
    },
    /// `array[index] = value`
    ArraySet {
        /// The array.
        array: InstId,
        /// Element index.
        index: InstId,
        /// Stored value.
        value: InstId,
    },
    /// A field load that could not be resolved statically.
    UnresolvedInstanceFieldGet {
        /// Receiver.
        object: InstId,
        /// Symbolic field.
        field: FieldId,
    },
    /// A field store that could not be resolved statically.
    UnresolvedInstanceFieldSet {
        /// Receiver.
        object: InstId,
        /// Symbolic field.
        field: FieldId,
        /// Stored value.
        value: InstId,
    },
    /// A static field load that could not be resolved statically.
    UnresolvedStaticFieldGet {
        /// Symbolic field.
        field: FieldId,
    },
    /// A static field store that could not be resolved statically.
    UnresolvedStaticFieldSet {
        /// Symbolic field.
        field: FieldId,
        /// Stored value.
        value: InstId,
    },
    /// `target == null ? default : target.field`
    PredicatedInstanceFieldGet {
        /// Possibly-null receiver.
        target: InstId,
        /// Value yielded when `target` is null.
        default: InstId,
        /// Accessed field.
        field: FieldId,
    },
    /// A call to code outside the method.
    InvokeStaticOrDirect {
        /// Callee name, used by dumps and the interpreter's handler table.
        method: String,
        /// Arguments.
        args: Vec<InstId>,
        /// What the callee may do.
        effects: SideEffects,
    },
    /// Publication barrier after constructing `objects`.
    ConstructorFence {
        /// Objects whose construction completed.
        objects: Vec<InstId>,
    },
    /// Monitor enter or exit on `object`.
    MonitorOperation {
        /// Locked object.
        object: InstId,
        /// `true` for enter, `false` for exit.
        enter: bool,
    },
    /// Leaves optimized code when `condition` holds, resuming with `env` live.
    Deoptimize {
        /// Deoptimization guard.
        condition: InstId,
        /// Values the resumed frame needs.
        env: Vec<InstId>,
    },
    /// `condition ? if_true : if_false`
    Select {
        /// Selector.
        condition: InstId,
        /// Value if the selector is true.
        if_true: InstId,
        /// Value if the selector is false.
        if_false: InstId,
    },
    /// SSA merge, one input per predecessor in predecessor order.
    Phi {
        /// Incoming values.
        inputs: Vec<InstId>,
    },
    /// Unconditional jump to the single successor.
    Goto,
    /// Branch to the first successor if `condition` holds, else to the second.
    If {
        /// Branch condition.
        condition: InstId,
    },
    /// Return `value` from the method.
    Return {
        /// Returned value.
        value: InstId,
    },
    /// Return from a `void` method.
    ReturnVoid,
    /// Throw `exception` out of the method.
    Throw {
        /// Thrown reference.
        exception: InstId,
    },
}

impl Op {
    /// Returns the kind of this operation.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        OpKind::from(self)
    }

    /// Returns the operands in their canonical order.
    #[must_use]
    pub fn inputs(&self) -> Vec<InstId> {
        match self {
            Self::ParameterValue { .. }
            | Self::Constant(_)
            | Self::NewInstance { .. }
            | Self::LoadClass { .. }
            | Self::UnresolvedStaticFieldGet { .. }
            | Self::Goto
            | Self::ReturnVoid => Vec::new(),
            Self::Unary { input, .. }
            | Self::TypeConversion { input }
            | Self::NullCheck { input }
            | Self::BoundType { input } => vec![*input],
            Self::Binary { lhs, rhs, .. } | Self::Compare { lhs, rhs, .. } => vec![*lhs, *rhs],
            Self::BoundsCheck { index, length } => vec![*index, *length],
            Self::ArrayLength { array } => vec![*array],
            Self::NewArray { length, .. } => vec![*length],
            Self::ClinitCheck { class } => vec![*class],
            Self::InstanceFieldGet { object, .. }
            | Self::UnresolvedInstanceFieldGet { object, .. } => vec![*object],
            Self::InstanceFieldSet { object, value, .. }
            | Self::UnresolvedInstanceFieldSet { object, value, .. } => vec![*object, *value],
            Self::StaticFieldGet { class, .. } => vec![*class],
            Self::StaticFieldSet { class, value, .. } => vec![*class, *value],
            Self::ArrayGet { array, index } => vec![*array, *index],
            Self::ArraySet {
                array,
                index,
                value,
            } => vec![*array, *index, *value],
            Self::UnresolvedStaticFieldSet { value, .. } => vec![*value],
            Self::PredicatedInstanceFieldGet {
                target, default, ..
            } => vec![*target, *default],
            Self::InvokeStaticOrDirect { args, .. } => args.clone(),
            Self::ConstructorFence { objects } => objects.clone(),
            Self::MonitorOperation { object, .. } => vec![*object],
            Self::Deoptimize { condition, env } => {
                let mut inputs = Vec::with_capacity(env.len() + 1);
                inputs.push(*condition);
                inputs.extend(env.iter().copied());
                inputs
            }
            Self::Select {
                condition,
                if_true,
                if_false,
            } => vec![*condition, *if_true, *if_false],
            Self::Phi { inputs } => inputs.clone(),
            Self::If { condition } => vec![*condition],
            Self::Return { value } => vec![*value],
            Self::Throw { exception } => vec![*exception],
        }
    }

    /// Returns mutable references to the operands, in the order of [`Op::inputs`].
    pub fn inputs_mut(&mut self) -> Vec<&mut InstId> {
        match self {
            Self::ParameterValue { .. }
            | Self::Constant(_)
            | Self::NewInstance { .. }
            | Self::LoadClass { .. }
            | Self::UnresolvedStaticFieldGet { .. }
            | Self::Goto
            | Self::ReturnVoid => Vec::new(),
            Self::Unary { input, .. }
            | Self::TypeConversion { input }
            | Self::NullCheck { input }
            | Self::BoundType { input } => vec![input],
            Self::Binary { lhs, rhs, .. } | Self::Compare { lhs, rhs, .. } => vec![lhs, rhs],
            Self::BoundsCheck { index, length } => vec![index, length],
            Self::ArrayLength { array } => vec![array],
            Self::NewArray { length, .. } => vec![length],
            Self::ClinitCheck { class } => vec![class],
            Self::InstanceFieldGet { object, .. }
            | Self::UnresolvedInstanceFieldGet { object, .. } => vec![object],
            Self::InstanceFieldSet { object, value, .. }
            | Self::UnresolvedInstanceFieldSet { object, value, .. } => vec![object, value],
            Self::StaticFieldGet { class, .. } => vec![class],
            Self::StaticFieldSet { class, value, .. } => vec![class, value],
            Self::ArrayGet { array, index } => vec![array, index],
            Self::ArraySet {
                array,
                index,
                value,
            } => vec![array, index, value],
            Self::UnresolvedStaticFieldSet { value, .. } => vec![value],
            Self::PredicatedInstanceFieldGet {
                target, default, ..
            } => vec![target, default],
            Self::InvokeStaticOrDirect { args, .. } => args.iter_mut().collect(),
            Self::ConstructorFence { objects } => objects.iter_mut().collect(),
            Self::MonitorOperation { object, .. } => vec![object],
            Self::Deoptimize { condition, env } => {
                let mut inputs = Vec::with_capacity(env.len() + 1);
                inputs.push(condition);
                inputs.extend(env.iter_mut());
                inputs
            }
            Self::Select {
                condition,
                if_true,
                if_false,
            } => vec![condition, if_true, if_false],
            Self::Phi { inputs } => inputs.iter_mut().collect(),
            Self::If { condition } => vec![condition],
            Self::Return { value } => vec![value],
            Self::Throw { exception } => vec![exception],
        }
    }

    /// Returns `true` for instructions that end a block.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Goto | Self::If { .. } | Self::Return { .. } | Self::ReturnVoid | Self::Throw { .. }
        )
    }

    /// Returns `true` for instructions that leave the method.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            Self::Return { .. } | Self::ReturnVoid | Self::Throw { .. }
        )
    }

    /// Number of successors a block ending in this terminator must have.
    #[must_use]
    pub fn successor_count(&self) -> Option<usize> {
        match self {
            Self::Goto => Some(1),
            Self::If { .. } => Some(2),
            Self::Return { .. } | Self::ReturnVoid | Self::Throw { .. } => Some(0),
            _ => None,
        }
    }

    /// Returns `true` for `Phi`.
    #[must_use]
    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    /// Returns `true` for allocations.
    #[must_use]
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::NewInstance { .. } | Self::NewArray { .. })
    }

    /// Returns `true` for the ops treated as calls into unknown code.
    ///
    /// Unresolved accesses may run class initialization or resolution code and
    /// are handled exactly like an opaque invoke.
    #[must_use]
    pub fn is_call_like(&self) -> bool {
        matches!(
            self,
            Self::InvokeStaticOrDirect { .. }
                | Self::ClinitCheck { .. }
                | Self::UnresolvedInstanceFieldGet { .. }
                | Self::UnresolvedInstanceFieldSet { .. }
                | Self::UnresolvedStaticFieldGet { .. }
                | Self::UnresolvedStaticFieldSet { .. }
        )
    }

    /// The side effects of a call-like op, `None` for other ops.
    #[must_use]
    pub fn call_effects(&self) -> Option<SideEffects> {
        match self {
            Self::InvokeStaticOrDirect { effects, .. } => Some(*effects),
            Self::ClinitCheck { .. }
            | Self::UnresolvedInstanceFieldGet { .. }
            | Self::UnresolvedInstanceFieldSet { .. }
            | Self::UnresolvedStaticFieldGet { .. }
            | Self::UnresolvedStaticFieldSet { .. } => Some(SideEffects::OPAQUE),
            _ => None,
        }
    }

    /// Returns the field accessed by a resolved field load or store.
    #[must_use]
    pub fn accessed_field(&self) -> Option<FieldId> {
        match self {
            Self::InstanceFieldGet { field, .. }
            | Self::InstanceFieldSet { field, .. }
            | Self::StaticFieldGet { field, .. }
            | Self::StaticFieldSet { field, .. }
            | Self::PredicatedInstanceFieldGet { field, .. }
            | Self::UnresolvedInstanceFieldGet { field, .. }
            | Self::UnresolvedInstanceFieldSet { field, .. }
            | Self::UnresolvedStaticFieldGet { field }
            | Self::UnresolvedStaticFieldSet { field, .. } => Some(*field),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}
