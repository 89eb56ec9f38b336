//! Response token decoding.
//!
//! A response message payload is a sequence of self-describing tokens. Each
//! starts with a one-byte tag followed by either a fixed-size body, a
//! length-prefixed body, or (for column metadata and rows) a body whose size
//! is implied by its contents.
//!
//! [`decode_token`] decodes exactly one token and reports how many bytes it
//! consumed. [`TokenStream`] drives it across a whole message and enforces
//! that the message ends exactly at its terminal DONE token.
//!
//! ```rust,ignore
//! let mut stream = TokenStream::new(message.payload);
//! while let Some(token) = stream.next_token()? {
//!     if let Token::Done(done) = token {
//!         println!("{} rows", done.row_count);
//!     }
//! }
//! ```

use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;

use crate::codec::WireSink;
use crate::cursor::ByteCursor;
use crate::error::ProtocolError;
use crate::types::TypeId;
use crate::value::SqlValue;
use crate::version::TdsVersion;

/// Tag byte of every token this crate decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Return status of a procedure.
    ReturnStatus = 0x79,
    /// Column metadata.
    ColMetaData = 0x81,
    /// Result ordering.
    Order = 0xA9,
    /// Error message.
    Error = 0xAA,
    /// Informational message.
    Info = 0xAB,
    /// Login acknowledgment.
    LoginAck = 0xAD,
    /// Row.
    Row = 0xD1,
    /// Null-bitmap compressed row.
    NbcRow = 0xD2,
    /// Environment change.
    EnvChange = 0xE3,
    /// Statement completion.
    Done = 0xFD,
    /// Procedure completion.
    DoneProc = 0xFE,
    /// Statement completion inside a procedure.
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Classify a tag byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x79 => Some(Self::ReturnStatus),
            0x81 => Some(Self::ColMetaData),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAD => Some(Self::LoginAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }
}

/// What to do with a tag the decoder does not know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownTokenPolicy {
    /// Fail with [`ProtocolError::UnknownToken`].
    #[default]
    Reject,
    /// Skip tokens whose tag class declares their size, reporting them as
    /// [`Token::Unknown`]. Tags without a declared size are still rejected.
    SkipLengthPrefixed,
}

/// A decoded response token.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Token {
    /// Column metadata for the rows that follow.
    ColMetaData(Arc<ColMetaData>),
    /// Row (from either ROW or NBCROW).
    Row(Row),
    /// Statement completion.
    Done(Done),
    /// Procedure completion.
    DoneProc(Done),
    /// Statement completion inside a procedure.
    DoneInProc(Done),
    /// Procedure return status.
    ReturnStatus(i32),
    /// Result ordering by column number.
    Order(Vec<u16>),
    /// Server error.
    Error(ServerMessage),
    /// Informational message.
    Info(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change.
    EnvChange(EnvChange),
    /// Token skipped under [`UnknownTokenPolicy::SkipLengthPrefixed`].
    Unknown {
        /// Tag byte.
        tag: u8,
        /// Undecoded body.
        body: Bytes,
    },
}

impl Token {
    /// The DONE payload if this is a terminal completion token.
    ///
    /// DONE and DONEPROC without the MORE bit close a response; DONEINPROC
    /// never does.
    #[must_use]
    pub fn as_terminal_done(&self) -> Option<&Done> {
        match self {
            Self::Done(done) | Self::DoneProc(done) if !done.has_more() => Some(done),
            _ => None,
        }
    }
}

/// A token together with the bytes it occupied, tag included.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// The token.
    pub token: Token,
    /// Bytes consumed from the cursor, including the tag byte.
    pub consumed: usize,
}

// =============================================================================
// Completion tokens
// =============================================================================

bitflags! {
    /// DONE status bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is open.
        const IN_XACT = 0x0004;
        /// `row_count` is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention signal.
        const ATTN = 0x0020;
        /// Server-side error terminated the statement.
        const SRV_ERROR = 0x0100;
    }
}

/// Body shared by DONE, DONEPROC and DONEINPROC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Current command code.
    pub cur_cmd: u16,
    /// Affected row count.
    pub row_count: u64,
}

impl Done {
    /// Body size (excluding the tag byte).
    pub const SIZE: usize = 12;

    /// Decode the fixed 12-byte body.
    pub fn decode(src: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let status = DoneStatus::from_bits_retain(src.read_u16_le()?);
        let cur_cmd = src.read_u16_le()?;
        let row_count = src.read_u64_le()?;
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode tag and body.
    pub fn encode(&self, tag: TokenType, dst: &mut impl WireSink) {
        dst.write_u8(tag as u8);
        dst.write_u16_le(self.status.bits());
        dst.write_u16_le(self.cur_cmd);
        dst.write_u64_le(self.row_count);
    }

    /// More results follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// The statement reported an error.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.status.intersects(DoneStatus::ERROR.union(DoneStatus::SRV_ERROR))
    }

    /// The row count is meaningful.
    #[must_use]
    pub const fn has_count(&self) -> bool {
        self.status.contains(DoneStatus::COUNT)
    }
}

// =============================================================================
// Messages, login acknowledgment, environment changes
// =============================================================================

/// Body of an ERROR or INFO token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// State.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerMessage {
    fn decode(src: &mut ByteCursor) -> Result<Self, ProtocolError> {
        Ok(Self {
            number: src.read_i32_le()?,
            state: src.read_u8()?,
            class: src.read_u8()?,
            message: src.read_us_varchar("message text")?,
            server: src.read_b_varchar("server name")?,
            procedure: src.read_b_varchar("procedure name")?,
            line: src.read_i32_le()?,
        })
    }

    /// Severity 20 and above closes the connection server-side.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }
}

/// LOGINACK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// Negotiated protocol version.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version (major, minor, build high, build low).
    pub prog_version: u32,
}

impl LoginAck {
    fn decode(src: &mut ByteCursor) -> Result<Self, ProtocolError> {
        Ok(Self {
            interface: src.read_u8()?,
            // the version is the one big-endian integer inside a token body
            tds_version: TdsVersion::new(src.read_u32_be()?),
            prog_name: src.read_b_varchar("program name")?,
            prog_version: src.read_u32_be()?,
        })
    }

    /// Server version as `major.minor.build`.
    #[must_use]
    pub fn server_version(&self) -> String {
        let [major, minor, hi, lo] = self.prog_version.to_be_bytes();
        format!("{major}.{minor}.{}", u16::from_be_bytes([hi, lo]))
    }
}

/// Environment change sub-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvChangeType {
    /// Current database.
    Database,
    /// Session language.
    Language,
    /// Character set.
    CharacterSet,
    /// Negotiated packet size.
    PacketSize,
    /// Unicode sort locale.
    UnicodeSortLocale,
    /// Unicode comparison flags.
    UnicodeComparisonFlags,
    /// Default collation.
    SqlCollation,
    /// Transaction started.
    BeginTransaction,
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Enlisted in a distributed transaction.
    EnlistDtcTransaction,
    /// Defected from a distributed transaction.
    DefectTransaction,
    /// Transaction ended.
    TransactionEnded,
    /// Acknowledges a session reset.
    ResetConnectionAck,
    /// Any other sub-type; the body is kept raw.
    Other(u8),
}

impl EnvChangeType {
    /// Map a sub-type byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::UnicodeSortLocale,
            6 => Self::UnicodeComparisonFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            other => Self::Other(other),
        }
    }

    /// Wire byte for this sub-type.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Database => 1,
            Self::Language => 2,
            Self::CharacterSet => 3,
            Self::PacketSize => 4,
            Self::UnicodeSortLocale => 5,
            Self::UnicodeComparisonFlags => 6,
            Self::SqlCollation => 7,
            Self::BeginTransaction => 8,
            Self::CommitTransaction => 9,
            Self::RollbackTransaction => 10,
            Self::EnlistDtcTransaction => 11,
            Self::DefectTransaction => 12,
            Self::TransactionEnded => 17,
            Self::ResetConnectionAck => 18,
            Self::Other(v) => v,
        }
    }

    const fn is_string(self) -> bool {
        matches!(
            self,
            Self::Database
                | Self::Language
                | Self::CharacterSet
                | Self::PacketSize
                | Self::UnicodeSortLocale
                | Self::UnicodeComparisonFlags
        )
    }
}

/// Old or new value carried by an environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// UTF-16 string value.
    String(String),
    /// Binary value (collations, transaction descriptors).
    Binary(Bytes),
}

/// ENVCHANGE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Sub-type.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Previous value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    fn decode(src: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let env_type = EnvChangeType::from_u8(src.read_u8()?);
        let (new_value, old_value) = if env_type.is_string() {
            (
                EnvChangeValue::String(src.read_b_varchar("environment value")?),
                EnvChangeValue::String(src.read_b_varchar("environment value")?),
            )
        } else if let EnvChangeType::Other(_) = env_type {
            // layout unknown: keep whatever the declared length covers
            let rest = src.remaining();
            (
                EnvChangeValue::Binary(src.read_bytes(rest)?),
                EnvChangeValue::Binary(Bytes::new()),
            )
        } else {
            (
                EnvChangeValue::Binary(src.read_b_varbyte()?),
                EnvChangeValue::Binary(src.read_b_varbyte()?),
            )
        };
        Ok(Self {
            env_type,
            new_value,
            old_value,
        })
    }

    /// New database name, for a database change.
    #[must_use]
    pub fn new_database(&self) -> Option<&str> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::Database, EnvChangeValue::String(name)) => Some(name),
            _ => None,
        }
    }

    /// New packet size, for a packet-size change.
    pub fn new_packet_size(&self) -> Option<Result<usize, ProtocolError>> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::PacketSize, EnvChangeValue::String(size)) => Some(
                size.trim()
                    .parse::<usize>()
                    .map_err(|_| ProtocolError::InvalidField {
                        field: "packet size",
                        value: 0,
                    }),
            ),
            _ => None,
        }
    }

    /// Transaction descriptor to send with subsequent requests.
    ///
    /// Begin carries the new descriptor; commit and rollback reset it to 0.
    #[must_use]
    pub fn transaction_descriptor(&self) -> Option<u64> {
        match (&self.env_type, &self.new_value) {
            (
                EnvChangeType::BeginTransaction | EnvChangeType::EnlistDtcTransaction,
                EnvChangeValue::Binary(raw),
            ) if raw.len() == 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(raw);
                Some(u64::from_le_bytes(bytes))
            }
            (
                EnvChangeType::CommitTransaction
                | EnvChangeType::RollbackTransaction
                | EnvChangeType::DefectTransaction
                | EnvChangeType::TransactionEnded,
                _,
            ) => Some(0),
            _ => None,
        }
    }
}

// =============================================================================
// Column metadata and rows
// =============================================================================

/// Column collation (LCID plus sort id).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collation {
    /// Locale id and flags.
    pub lcid: u32,
    /// Sort id.
    pub sort_id: u8,
}

/// Type-specific metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeInfo {
    /// Maximum length for length-prefixed types; `0xFFFF` marks MAX columns.
    pub max_length: Option<u32>,
    /// Precision for decimal types.
    pub precision: Option<u8>,
    /// Scale for decimal and time types.
    pub scale: Option<u8>,
    /// Collation for character types.
    pub collation: Option<Collation>,
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnData {
    /// Column name.
    pub name: String,
    /// Data type.
    pub type_id: TypeId,
    /// Column flags.
    pub flags: u16,
    /// User type id.
    pub user_type: u32,
    /// Type-specific metadata.
    pub type_info: TypeInfo,
}

impl ColumnData {
    /// Column accepts NULL.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.flags & 0x0001 != 0
    }

    /// Values are sent as partially length-prefixed chunks.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        self.type_id.is_ushort_len() && self.type_info.max_length == Some(0xFFFF)
    }
}

/// COLMETADATA body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColMetaData {
    /// Columns in order.
    pub columns: Vec<ColumnData>,
}

impl ColMetaData {
    /// Column count announcing that no metadata follows.
    pub const NO_METADATA: u16 = 0xFFFF;

    fn decode(src: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let count = src.read_u16_le()?;
        if count == Self::NO_METADATA {
            return Ok(Self::default());
        }
        let columns = (0..count)
            .map(|_| Self::decode_column(src))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { columns })
    }

    fn decode_column(src: &mut ByteCursor) -> Result<ColumnData, ProtocolError> {
        let user_type = src.read_u32_le()?;
        let flags = src.read_u16_le()?;
        let type_id = TypeId::from_u8(src.read_u8()?)?;
        let type_info = Self::decode_type_info(src, type_id)?;
        let name = src.read_b_varchar("column name")?;
        Ok(ColumnData {
            name,
            type_id,
            flags,
            user_type,
            type_info,
        })
    }

    fn decode_type_info(src: &mut ByteCursor, type_id: TypeId) -> Result<TypeInfo, ProtocolError> {
        if type_id.fixed_size().is_some() || type_id == TypeId::Date {
            return Ok(TypeInfo::default());
        }
        let info = match type_id {
            TypeId::IntN
            | TypeId::BitN
            | TypeId::FloatN
            | TypeId::MoneyN
            | TypeId::DateTimeN
            | TypeId::Guid => TypeInfo {
                max_length: Some(u32::from(src.read_u8()?)),
                ..TypeInfo::default()
            },
            TypeId::DecimalN | TypeId::NumericN => TypeInfo {
                max_length: Some(u32::from(src.read_u8()?)),
                precision: Some(src.read_u8()?),
                scale: Some(src.read_u8()?),
                ..TypeInfo::default()
            },
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => TypeInfo {
                scale: Some(src.read_u8()?),
                ..TypeInfo::default()
            },
            _ => {
                let max_length = Some(u32::from(src.read_u16_le()?));
                let collation = if type_id.has_collation() {
                    Some(Collation {
                        lcid: src.read_u32_le()?,
                        sort_id: src.read_u8()?,
                    })
                } else {
                    None
                };
                TypeInfo {
                    max_length,
                    collation,
                    ..TypeInfo::default()
                }
            }
        };
        Ok(info)
    }

    /// Number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Index of the column with the given name (case-insensitive).
    #[must_use]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// A decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Values in column order.
    pub values: Vec<SqlValue>,
}

impl Row {
    fn decode(src: &mut ByteCursor, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let values = metadata
            .columns
            .iter()
            .map(|col| decode_value(src, col))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }

    fn decode_nbc(src: &mut ByteCursor, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let bitmap = src.read_bytes(metadata.columns.len().div_ceil(8))?;
        let values = metadata
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                    Ok(SqlValue::Null)
                } else {
                    decode_value(src, col)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }
}

const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

fn decode_value(src: &mut ByteCursor, col: &ColumnData) -> Result<SqlValue, ProtocolError> {
    if let Some(size) = col.type_id.fixed_size() {
        let raw = src.read_bytes(size)?;
        return convert(col, raw);
    }

    let raw = if col.is_plp() {
        match read_plp(src)? {
            Some(raw) => raw,
            None => return Ok(SqlValue::Null),
        }
    } else if col.type_id.is_ushort_len() {
        match src.read_u16_le()? {
            0xFFFF => return Ok(SqlValue::Null),
            len => src.read_bytes(len as usize)?,
        }
    } else {
        match src.read_u8()? {
            0 => return Ok(SqlValue::Null),
            len => src.read_bytes(len as usize)?,
        }
    };
    convert(col, raw)
}

fn read_plp(src: &mut ByteCursor) -> Result<Option<Bytes>, ProtocolError> {
    let total = src.read_u64_le()?;
    if total == PLP_NULL {
        return Ok(None);
    }
    let mut out = bytes::BytesMut::new();
    loop {
        let chunk = src.read_u32_le()? as usize;
        if chunk == 0 {
            break;
        }
        out.extend_from_slice(&src.read_bytes(chunk)?);
    }
    Ok(Some(out.freeze()))
}

fn le_uint(raw: &[u8]) -> u64 {
    raw.iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn bad_length(col: &ColumnData, len: usize) -> ProtocolError {
    ProtocolError::InvalidField {
        field: "value length",
        value: (u64::from(col.type_id as u8) << 32) | len as u64,
    }
}

/// Bytes a time of day occupies at `scale`.
const fn time_len(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

fn time_nanos(raw: &[u8], scale: u8) -> Result<u64, ProtocolError> {
    if scale > 7 {
        return Err(ProtocolError::InvalidField {
            field: "time scale",
            value: u64::from(scale),
        });
    }
    if raw.len() != time_len(scale) {
        return Err(ProtocolError::InvalidField {
            field: "time length",
            value: raw.len() as u64,
        });
    }
    let units = le_uint(raw);
    units
        .checked_mul(10u64.pow(9 - u32::from(scale)))
        .ok_or(ProtocolError::InvalidField {
            field: "time value",
            value: units,
        })
}

fn convert(col: &ColumnData, raw: Bytes) -> Result<SqlValue, ProtocolError> {
    let len = raw.len();
    let value = match (col.type_id, len) {
        (TypeId::Null, _) => SqlValue::Null,
        (TypeId::Bit | TypeId::BitN, 1) => SqlValue::Bool(raw[0] != 0),
        (TypeId::Int1 | TypeId::IntN, 1) => SqlValue::U8(raw[0]),
        (TypeId::Int2 | TypeId::IntN, 2) => SqlValue::I16(i16::from_le_bytes([raw[0], raw[1]])),
        (TypeId::Int4 | TypeId::IntN, 4) => {
            SqlValue::I32(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }
        (TypeId::Int8 | TypeId::IntN, 8) => SqlValue::I64(le_uint(&raw) as i64),
        (TypeId::Float4 | TypeId::FloatN, 4) => {
            SqlValue::F32(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }
        (TypeId::Float8 | TypeId::FloatN, 8) => SqlValue::F64(f64::from_bits(le_uint(&raw))),
        (TypeId::Money4 | TypeId::MoneyN, 4) => SqlValue::Money(i64::from(i32::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3],
        ]))),
        (TypeId::Money | TypeId::MoneyN, 8) => {
            let hi = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let lo = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            SqlValue::Money((i64::from(hi) << 32) | i64::from(lo))
        }
        (TypeId::DateTime4 | TypeId::DateTimeN, 4) => {
            let days = u16::from_le_bytes([raw[0], raw[1]]);
            let minutes = u16::from_le_bytes([raw[2], raw[3]]);
            SqlValue::DateTime {
                days: i32::from(days),
                ticks: u32::from(minutes) * 60 * 300,
            }
        }
        (TypeId::DateTime | TypeId::DateTimeN, 8) => SqlValue::DateTime {
            days: i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            ticks: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        },
        (TypeId::Guid, 16) => {
            let mut guid = [0u8; 16];
            guid.copy_from_slice(&raw);
            SqlValue::Guid(guid)
        }
        (TypeId::DecimalN | TypeId::NumericN, 2..=17) => {
            let magnitude = raw[1..]
                .iter()
                .rev()
                .fold(0u128, |acc, &b| (acc << 8) | u128::from(b));
            // at most 38 digits, so anything past i128::MAX is corrupt
            let magnitude = i128::try_from(magnitude).map_err(|_| ProtocolError::InvalidField {
                field: "decimal magnitude",
                value: (magnitude >> 64) as u64,
            })?;
            SqlValue::Decimal {
                value: if raw[0] == 1 { magnitude } else { -magnitude },
                scale: col.type_info.scale.unwrap_or(0),
            }
        }
        (TypeId::Date, 3) => SqlValue::Date(le_uint(&raw) as u32),
        (TypeId::Time, 3..=5) => SqlValue::Time(time_nanos(&raw, col.type_info.scale.unwrap_or(7))?),
        (TypeId::DateTime2, 6..=8) => SqlValue::DateTime2 {
            nanos: time_nanos(&raw[..len - 3], col.type_info.scale.unwrap_or(7))?,
            days: le_uint(&raw[len - 3..]) as u32,
        },
        (TypeId::DateTimeOffset, 8..=10) => SqlValue::DateTimeOffset {
            nanos: time_nanos(&raw[..len - 5], col.type_info.scale.unwrap_or(7))?,
            days: le_uint(&raw[len - 5..len - 2]) as u32,
            offset_minutes: i16::from_le_bytes([raw[len - 2], raw[len - 1]]),
        },
        (TypeId::NVarChar | TypeId::NChar, n) if n % 2 == 0 => {
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            SqlValue::String(
                String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf16("column value"))?,
            )
        }
        // single-byte character data is decoded as Latin-1
        (TypeId::BigVarChar | TypeId::BigChar, _) => {
            SqlValue::String(raw.iter().map(|&b| char::from(b)).collect())
        }
        (TypeId::BigVarBinary | TypeId::BigBinary, _) => SqlValue::Binary(raw),
        _ => return Err(bad_length(col, len)),
    };
    Ok(value)
}

// =============================================================================
// Decoder entry point
// =============================================================================

/// Decode exactly one token from `src`.
///
/// `metadata` must be the most recent column metadata when a row token may
/// follow. On success the cursor has advanced by [`DecodedToken::consumed`].
pub fn decode_token(
    src: &mut ByteCursor,
    metadata: Option<&ColMetaData>,
    policy: UnknownTokenPolicy,
) -> Result<DecodedToken, ProtocolError> {
    let start = src.position();
    let tag = src.read_u8()?;

    let token = match TokenType::from_u8(tag) {
        Some(TokenType::Done) => Token::Done(Done::decode(src)?),
        Some(TokenType::DoneProc) => Token::DoneProc(Done::decode(src)?),
        Some(TokenType::DoneInProc) => Token::DoneInProc(Done::decode(src)?),
        Some(TokenType::ReturnStatus) => Token::ReturnStatus(src.read_i32_le()?),
        Some(TokenType::ColMetaData) => Token::ColMetaData(Arc::new(ColMetaData::decode(src)?)),
        Some(TokenType::Row) => {
            let meta = metadata.ok_or(ProtocolError::MissingColumnMetadata(tag))?;
            Token::Row(Row::decode(src, meta)?)
        }
        Some(TokenType::NbcRow) => {
            let meta = metadata.ok_or(ProtocolError::MissingColumnMetadata(tag))?;
            Token::Row(Row::decode_nbc(src, meta)?)
        }
        Some(TokenType::Error) => Token::Error(bounded(src, tag, ServerMessage::decode)?),
        Some(TokenType::Info) => Token::Info(bounded(src, tag, ServerMessage::decode)?),
        Some(TokenType::LoginAck) => Token::LoginAck(bounded(src, tag, LoginAck::decode)?),
        Some(TokenType::EnvChange) => Token::EnvChange(bounded(src, tag, EnvChange::decode)?),
        Some(TokenType::Order) => Token::Order(bounded(src, tag, |body| {
            let mut columns = Vec::with_capacity(body.remaining() / 2);
            while !body.is_empty() {
                columns.push(body.read_u16_le()?);
            }
            Ok(columns)
        })?),
        None => skip_unknown(src, tag, start, policy)?,
    };

    Ok(DecodedToken {
        token,
        consumed: src.position() - start,
    })
}

/// Decode a token with a `u16` length prefix inside a cursor bounded by it.
///
/// Reading past the declared length is a fault; an unread tail is skipped.
fn bounded<T>(
    src: &mut ByteCursor,
    tag: u8,
    decode: impl FnOnce(&mut ByteCursor) -> Result<T, ProtocolError>,
) -> Result<T, ProtocolError> {
    let declared = src.read_u16_le()? as usize;
    let mut body = src.sub_cursor(declared)?;
    decode(&mut body).map_err(|err| match err {
        ProtocolError::UnexpectedEof { .. } => ProtocolError::TokenOverrun { tag, declared },
        other => other,
    })
}

fn skip_unknown(
    src: &mut ByteCursor,
    tag: u8,
    offset: usize,
    policy: UnknownTokenPolicy,
) -> Result<Token, ProtocolError> {
    let reject = ProtocolError::UnknownToken { tag, offset };
    if policy == UnknownTokenPolicy::Reject {
        return Err(reject);
    }
    // tag bits 4-5 encode how the body size is declared
    let len = match tag & 0x30 {
        0x10 => 0,
        0x20 => src.read_u16_le()? as usize,
        0x30 => 1 << ((tag >> 2) & 0x03),
        _ => return Err(reject),
    };
    tracing::debug!(tag, len, "skipping unknown token");
    Ok(Token::Unknown {
        tag,
        body: src.read_bytes(len)?,
    })
}

// =============================================================================
// Token stream over one message
// =============================================================================

/// Lazy token iterator over one response message.
///
/// Tracks column metadata for row decoding and stops at the terminal DONE
/// token. Bytes left after it, or a payload that ends before it, are
/// protocol violations.
#[derive(Debug)]
pub struct TokenStream {
    cursor: ByteCursor,
    metadata: Option<Arc<ColMetaData>>,
    policy: UnknownTokenPolicy,
    finished: bool,
}

impl TokenStream {
    /// Stream over a message payload, rejecting unknown tokens.
    #[must_use]
    pub fn new(payload: Bytes) -> Self {
        Self::with_policy(payload, UnknownTokenPolicy::Reject)
    }

    /// Stream over a message payload with an explicit unknown-token policy.
    #[must_use]
    pub fn with_policy(payload: Bytes, policy: UnknownTokenPolicy) -> Self {
        Self {
            cursor: ByteCursor::new(payload),
            metadata: None,
            policy,
            finished: false,
        }
    }

    /// Metadata of the current result set, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<ColMetaData>> {
        self.metadata.as_ref()
    }

    /// Whether the terminal DONE token has been returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Unconsumed payload bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    /// Next token, or `None` once the terminal DONE has been returned.
    pub fn next_token(&mut self) -> Result<Option<Token>, ProtocolError> {
        if self.finished {
            return Ok(None);
        }
        if self.cursor.is_empty() {
            return Err(ProtocolError::MissingDone);
        }

        let decoded = decode_token(&mut self.cursor, self.metadata.as_deref(), self.policy)?;
        tracing::trace!(consumed = decoded.consumed, token = ?decoded.token, "decoded token");

        match &decoded.token {
            Token::ColMetaData(meta) => self.metadata = Some(Arc::clone(meta)),
            token if token.as_terminal_done().is_some() => {
                self.finished = true;
                if !self.cursor.is_empty() {
                    return Err(ProtocolError::TrailingBytes {
                        remaining: self.cursor.remaining(),
                    });
                }
            }
            _ => {}
        }
        Ok(Some(decoded.token))
    }

    /// Consume every remaining token, returning the terminal DONE.
    pub fn drain(&mut self) -> Result<Option<Done>, ProtocolError> {
        let mut last = None;
        while let Some(token) = self.next_token()? {
            if let Some(done) = token.as_terminal_done() {
                last = Some(*done);
            }
        }
        Ok(last)
    }
}
