//! Value types, constants and arena identifiers of the instruction graph.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use strum::{Display, EnumIter};

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) usize);

        impl $name {
            /// Creates an identifier from a raw arena index.
            #[must_use]
            #[inline]
            pub const fn new(index: usize) -> Self {
                Self(index)
            }

            /// Returns the raw arena index.
            #[must_use]
            #[inline]
            pub const fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Index of an instruction in the graph arena.
    InstId,
    "i"
);
arena_id!(
    /// Index of a basic block in the graph arena.
    BlockId,
    "B"
);
arena_id!(
    /// Index of a class in the graph's class table.
    ClassId,
    "c"
);
arena_id!(
    /// Index of a field in the graph's field table.
    FieldId,
    "f"
);

/// The type of an SSA value or of a heap slot.
///
/// Sub-word integral types only describe heap slots and the results of loads
/// and conversions; arithmetic always happens on [`DataType::Int32`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum DataType {
    /// Boolean stored as 0 or 1.
    #[strum(serialize = "bool")]
    Bool,
    /// Signed 8-bit integer.
    #[strum(serialize = "int8")]
    Int8,
    /// Unsigned 8-bit integer.
    #[strum(serialize = "uint8")]
    Uint8,
    /// Signed 16-bit integer.
    #[strum(serialize = "int16")]
    Int16,
    /// Unsigned 16-bit integer (Java `char`).
    #[strum(serialize = "uint16")]
    Uint16,
    /// Signed 32-bit integer.
    #[strum(serialize = "int32")]
    Int32,
    /// Signed 64-bit integer.
    #[strum(serialize = "int64")]
    Int64,
    /// IEEE single precision float.
    #[strum(serialize = "float32")]
    Float32,
    /// IEEE double precision float.
    #[strum(serialize = "float64")]
    Float64,
    /// Object or array reference.
    #[strum(serialize = "reference")]
    Reference,
    /// No value.
    #[strum(serialize = "void")]
    Void,
}

impl DataType {
    /// Size of a value of this type in bytes, as stored in the heap.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Float32 | Self::Reference => 4,
            Self::Int64 | Self::Float64 => 8,
            Self::Void => 0,
        }
    }

    /// Returns `true` for all integral types including `Bool`.
    #[must_use]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::Int8
                | Self::Uint8
                | Self::Int16
                | Self::Uint16
                | Self::Int32
                | Self::Int64
        )
    }

    /// Returns `true` for `Float32` and `Float64`.
    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Returns `true` for `Reference`.
    #[must_use]
    pub const fn is_reference(self) -> bool {
        matches!(self, Self::Reference)
    }

    /// The type an SSA value of this type is computed in.
    ///
    /// Sub-word integral types widen to `Int32`.
    #[must_use]
    pub const fn kind(self) -> Self {
        match self {
            Self::Bool | Self::Int8 | Self::Uint8 | Self::Int16 | Self::Uint16 => Self::Int32,
            other => other,
        }
    }

    /// Returns `true` if a value of type `input` can be used where `result` is
    /// expected without an explicit conversion.
    ///
    /// This holds for identical types and for widening into a type that can
    /// represent every value of `input` with the same bit pattern.
    #[must_use]
    pub const fn is_type_conversion_implicit(input: Self, result: Self) -> bool {
        if input as u8 == result as u8 {
            return true;
        }
        match result {
            Self::Int32 => matches!(
                input,
                Self::Bool | Self::Int8 | Self::Uint8 | Self::Int16 | Self::Uint16
            ),
            Self::Int16 => matches!(input, Self::Bool | Self::Int8 | Self::Uint8),
            Self::Uint16 => matches!(input, Self::Bool | Self::Uint8),
            Self::Int8 | Self::Uint8 => matches!(input, Self::Bool),
            _ => false,
        }
    }

    /// The zero value of this type, used for freshly allocated fields and elements.
    #[must_use]
    pub const fn default_value(self) -> ConstValue {
        match self {
            Self::Int64 => ConstValue::Long(0),
            Self::Float32 => ConstValue::Float(0.0),
            Self::Float64 => ConstValue::Double(0.0),
            Self::Reference | Self::Void => ConstValue::Null,
            _ => ConstValue::Int(0),
        }
    }
}

/// A compile-time constant.
///
/// Floating point constants compare and hash by bit pattern so that constants
/// can be interned (`-0.0` and `0.0` are distinct, `NaN` equals itself).
#[derive(Debug, Clone, Copy)]
pub enum ConstValue {
    /// 32-bit integer constant (also used for sub-word and boolean values).
    Int(i32),
    /// 64-bit integer constant.
    Long(i64),
    /// Single precision constant.
    Float(f32),
    /// Double precision constant.
    Double(f64),
    /// The null reference.
    Null,
}

impl ConstValue {
    /// The SSA type of this constant.
    #[must_use]
    pub const fn data_type(self) -> DataType {
        match self {
            Self::Int(_) => DataType::Int32,
            Self::Long(_) => DataType::Int64,
            Self::Float(_) => DataType::Float32,
            Self::Double(_) => DataType::Float64,
            Self::Null => DataType::Reference,
        }
    }

    /// Returns `true` if every bit of the constant is zero.
    #[must_use]
    pub fn is_zero_bit_pattern(self) -> bool {
        self.bits() == 0
    }

    /// Returns the integral value for `Int` and `Long` constants.
    #[must_use]
    pub const fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v as i64),
            Self::Long(v) => Some(v),
            _ => None,
        }
    }

    fn bits(self) -> u64 {
        match self {
            // Sign-extension is irrelevant here, only zero-ness and identity matter.
            Self::Int(v) => u64::from(v as u32),
            Self::Long(v) => v as u64,
            Self::Float(v) => u64::from(v.to_bits()),
            Self::Double(v) => v.to_bits(),
            Self::Null => 0,
        }
    }
}

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other) && self.bits() == other.bits()
    }
}

impl Eq for ConstValue {}

impl Hash for ConstValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        self.bits().hash(state);
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}L"),
            Self::Float(v) => write!(f, "{v}f"),
            Self::Double(v) => write!(f, "{v}d"),
            Self::Null => f.write_str("null"),
        }
    }
}

/// A class known to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    /// Simple class name, used in dumps.
    pub name: String,
    /// Direct superclass, `None` for hierarchy roots.
    pub superclass: Option<ClassId>,
    /// Instances need finalization, so their final field values are observable.
    pub is_finalizable: bool,
}

/// A field known to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name, used in dumps.
    pub name: String,
    /// Declaring class.
    pub class: ClassId,
    /// Declared type of the heap slot.
    pub ty: DataType,
    /// Volatile accesses are never optimized.
    pub is_volatile: bool,
    /// Static fields live in the class, not in instances.
    pub is_static: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn implicit_conversions() {
        assert!(DataType::is_type_conversion_implicit(DataType::Int8, DataType::Int32));
        assert!(DataType::is_type_conversion_implicit(DataType::Bool, DataType::Uint8));
        assert!(!DataType::is_type_conversion_implicit(DataType::Int32, DataType::Int8));
        assert!(!DataType::is_type_conversion_implicit(DataType::Uint16, DataType::Int16));
        assert!(!DataType::is_type_conversion_implicit(DataType::Int32, DataType::Int64));
        for ty in DataType::iter() {
            assert!(DataType::is_type_conversion_implicit(ty, ty));
        }
    }

    #[test]
    fn kinds_widen_sub_words() {
        assert_eq!(DataType::Uint16.kind(), DataType::Int32);
        assert_eq!(DataType::Int64.kind(), DataType::Int64);
        assert_eq!(DataType::Int8.to_string(), "int8");
    }

    #[test]
    fn constants_compare_by_bits() {
        assert_eq!(ConstValue::Float(f32::NAN), ConstValue::Float(f32::NAN));
        assert_ne!(ConstValue::Double(0.0), ConstValue::Double(-0.0));
        assert_ne!(ConstValue::Int(0), ConstValue::Long(0));
        assert!(ConstValue::Double(0.0).is_zero_bit_pattern());
        assert!(!ConstValue::Double(-0.0).is_zero_bit_pattern());
        assert!(ConstValue::Null.is_zero_bit_pattern());
        assert_eq!(DataType::Int16.default_value(), ConstValue::Int(0));
    }
}
