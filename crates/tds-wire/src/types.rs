//! Column data type identifiers.

use crate::error::ProtocolError;

/// Data type byte as it appears in column metadata.
///
/// Only the types this crate can decode are listed; anything else is rejected
/// when the metadata is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// Always-NULL column.
    Null = 0x1F,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// Bit.
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 32-bit float.
    Float4 = 0x3B,
    /// 64-bit float.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,
    /// Nullable integer of length 1, 2, 4 or 8.
    IntN = 0x26,
    /// Nullable bit.
    BitN = 0x68,
    /// Nullable float of length 4 or 8.
    FloatN = 0x6D,
    /// Nullable money of length 4 or 8.
    MoneyN = 0x6E,
    /// Nullable datetime of length 4 or 8.
    DateTimeN = 0x6F,
    /// Unique identifier.
    Guid = 0x24,
    /// Decimal.
    DecimalN = 0x6A,
    /// Numeric.
    NumericN = 0x6C,
    /// Variable-length single-byte character data.
    BigVarChar = 0xA7,
    /// Fixed-length single-byte character data.
    BigChar = 0xAF,
    /// Variable-length binary.
    BigVarBinary = 0xA5,
    /// Fixed-length binary.
    BigBinary = 0xAD,
    /// Variable-length UTF-16 character data.
    NVarChar = 0xE7,
    /// Fixed-length UTF-16 character data.
    NChar = 0xEF,
    /// Date.
    Date = 0x28,
    /// Time of day with scale.
    Time = 0x29,
    /// Date and time with scale.
    DateTime2 = 0x2A,
    /// Date and time with offset.
    DateTimeOffset = 0x2B,
}

impl TypeId {
    /// Parse a type byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x1F => Self::Null,
            0x30 => Self::Int1,
            0x32 => Self::Bit,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0x7F => Self::Int8,
            0x3B => Self::Float4,
            0x3E => Self::Float8,
            0x3C => Self::Money,
            0x7A => Self::Money4,
            0x3D => Self::DateTime,
            0x3A => Self::DateTime4,
            0x26 => Self::IntN,
            0x68 => Self::BitN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x6F => Self::DateTimeN,
            0x24 => Self::Guid,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0xA7 => Self::BigVarChar,
            0xAF => Self::BigChar,
            0xA5 => Self::BigVarBinary,
            0xAD => Self::BigBinary,
            0xE7 => Self::NVarChar,
            0xEF => Self::NChar,
            0x28 => Self::Date,
            0x29 => Self::Time,
            0x2A => Self::DateTime2,
            0x2B => Self::DateTimeOffset,
            other => return Err(ProtocolError::UnsupportedDataType(other)),
        })
    }

    /// Size of a value of this type when it has no length prefix.
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Int1 | Self::Bit => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => Some(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => Some(8),
            _ => None,
        }
    }

    /// Whether values carry a 2-byte length prefix (or PLP when the column is MAX).
    #[must_use]
    pub const fn is_ushort_len(self) -> bool {
        matches!(
            self,
            Self::BigVarChar
                | Self::BigChar
                | Self::BigVarBinary
                | Self::BigBinary
                | Self::NVarChar
                | Self::NChar
        )
    }

    /// Whether metadata for this type carries a 5-byte collation.
    #[must_use]
    pub const fn has_collation(self) -> bool {
        matches!(
            self,
            Self::BigVarChar | Self::BigChar | Self::NVarChar | Self::NChar
        )
    }
}
