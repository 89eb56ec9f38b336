//! Decoded column values.

use bytes::Bytes;

/// A single column value decoded from a row token.
///
/// This is a closed set: each supported wire type maps onto exactly one
/// variant, and accessors match on it instead of dispatching dynamically.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// `bit`.
    Bool(bool),
    /// `tinyint` (unsigned).
    U8(u8),
    /// `smallint`.
    I16(i16),
    /// `int`.
    I32(i32),
    /// `bigint`.
    I64(i64),
    /// `real`.
    F32(f32),
    /// `float`.
    F64(f64),
    /// `money` / `smallmoney` in ten-thousandths of a unit.
    Money(i64),
    /// `decimal` / `numeric` as an unscaled integer plus scale.
    Decimal {
        /// Unscaled value.
        value: i128,
        /// Digits after the decimal point.
        scale: u8,
    },
    /// Character data.
    String(String),
    /// Binary data.
    Binary(Bytes),
    /// `uniqueidentifier` in wire byte order.
    Guid([u8; 16]),
    /// `date` as days since 0001-01-01.
    Date(u32),
    /// `time` as nanoseconds since midnight.
    Time(u64),
    /// `datetime` / `smalldatetime`.
    DateTime {
        /// Days since 1900-01-01.
        days: i32,
        /// Time of day in 1/300 second ticks.
        ticks: u32,
    },
    /// `datetime2`.
    DateTime2 {
        /// Days since 0001-01-01.
        days: u32,
        /// Nanoseconds since midnight.
        nanos: u64,
    },
    /// `datetimeoffset` (UTC date and time plus the original offset).
    DateTimeOffset {
        /// Days since 0001-01-01.
        days: u32,
        /// Nanoseconds since midnight.
        nanos: u64,
        /// Offset from UTC in minutes.
        offset_minutes: i16,
    },
}

impl SqlValue {
    /// Whether the value is NULL.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name used in conversion errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bit",
            Self::U8(_) => "tinyint",
            Self::I16(_) => "smallint",
            Self::I32(_) => "int",
            Self::I64(_) => "bigint",
            Self::F32(_) => "real",
            Self::F64(_) => "float",
            Self::Money(_) => "money",
            Self::Decimal { .. } => "decimal",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Guid(_) => "uniqueidentifier",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::DateTime { .. } => "datetime",
            Self::DateTime2 { .. } => "datetime2",
            Self::DateTimeOffset { .. } => "datetimeoffset",
        }
    }

    /// Integer view, widening any integer kind.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::U8(v) => Some(i64::from(v)),
            Self::I16(v) => Some(i64::from(v)),
            Self::I32(v) => Some(i64::from(v)),
            Self::I64(v) => Some(v),
            Self::Bool(v) => Some(i64::from(v)),
            _ => None,
        }
    }

    /// Integer view, if the value fits in `i32`.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    /// Floating point view of any numeric kind.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F32(v) => Some(f64::from(v)),
            Self::F64(v) => Some(v),
            Self::Money(v) => Some(v as f64 / 10_000.0),
            Self::Decimal { value, scale } => Some(value as f64 / 10f64.powi(i32::from(scale))),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// Boolean view.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// String view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            Self::Guid(g) => Some(g),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening() {
        assert_eq!(SqlValue::U8(200).as_i64(), Some(200));
        assert_eq!(SqlValue::I16(-3).as_i32(), Some(-3));
        assert_eq!(SqlValue::I64(i64::MAX).as_i32(), None);
        assert_eq!(SqlValue::String("1".into()).as_i64(), None);
    }

    #[test]
    fn test_scaled_numerics() {
        assert_eq!(SqlValue::Money(12_345).as_f64(), Some(1.2345));
        assert_eq!(
            SqlValue::Decimal {
                value: -1234,
                scale: 2
            }
            .as_f64(),
            Some(-12.34)
        );
    }
}
