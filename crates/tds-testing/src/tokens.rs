//! Server-side token encoders.
//!
//! [`TokenWriter`] builds the token stream of one response message. Strings
//! longer than their length prefix allows are truncated rather than
//! rejected, since scripted responses are under the test's control.

use bytes::{BufMut, Bytes, BytesMut};
use tds_wire::{Done, DoneStatus, EnvChangeType, TdsVersion, TokenType, TypeId};

/// LCID and sort id sent with every character column.
const COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

/// One column of a scripted result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Wire type.
    pub type_id: TypeId,
    /// Declared length in bytes.
    pub max_length: u16,
    /// Nullable flag.
    pub nullable: bool,
}

impl MockColumn {
    /// Column with an explicit type and length.
    pub fn new(name: impl Into<String>, type_id: TypeId, max_length: u16) -> Self {
        Self {
            name: name.into(),
            type_id,
            max_length,
            nullable: true,
        }
    }

    /// Nullable `int`.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN, 4)
    }

    /// Nullable `bigint`.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN, 8)
    }

    /// Nullable `bit`.
    pub fn bit(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::BitN, 1)
    }

    /// Nullable `float`.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::FloatN, 8)
    }

    /// `nvarchar(chars)`.
    pub fn nvarchar(name: impl Into<String>, chars: u16) -> Self {
        Self::new(name, TypeId::NVarChar, chars.saturating_mul(2))
    }

    /// `varbinary(len)`.
    pub fn varbinary(name: impl Into<String>, len: u16) -> Self {
        Self::new(name, TypeId::BigVarBinary, len)
    }

    /// Set the nullable flag.
    #[must_use]
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// A single value in a scripted row.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// NULL.
    Null,
    /// `bit`.
    Bool(bool),
    /// `int`.
    Int(i32),
    /// `bigint`.
    BigInt(i64),
    /// `float`.
    Float(f64),
    /// `nvarchar`.
    String(String),
    /// `varbinary`.
    Binary(Bytes),
}

impl ScalarValue {
    /// A column matching this value's natural type.
    pub fn column(&self, name: impl Into<String>) -> MockColumn {
        match self {
            Self::Null | Self::Int(_) => MockColumn::int(name),
            Self::Bool(_) => MockColumn::bit(name),
            Self::BigInt(_) => MockColumn::bigint(name),
            Self::Float(_) => MockColumn::float(name),
            Self::String(s) => {
                let chars = u16::try_from(s.encode_utf16().count()).unwrap_or(4000);
                MockColumn::nvarchar(name, chars.clamp(1, 4000))
            }
            Self::Binary(b) => {
                MockColumn::varbinary(name, u16::try_from(b.len()).unwrap_or(8000).clamp(1, 8000))
            }
        }
    }

    /// Encode as a row value of `column`.
    fn encode(&self, column: &MockColumn, dst: &mut BytesMut) {
        let ushort = column.type_id.is_ushort_len();
        match self {
            Self::Null if ushort => dst.put_u16_le(0xFFFF),
            Self::Null => dst.put_u8(0),
            Self::Bool(v) => {
                dst.put_u8(1);
                dst.put_u8(u8::from(*v));
            }
            Self::Int(v) => {
                dst.put_u8(4);
                dst.put_i32_le(*v);
            }
            Self::BigInt(v) => {
                dst.put_u8(8);
                dst.put_i64_le(*v);
            }
            Self::Float(v) => {
                dst.put_u8(8);
                dst.put_f64_le(*v);
            }
            Self::String(s) => {
                let units: Vec<u16> = s.encode_utf16().take(usize::from(u16::MAX / 2)).collect();
                dst.put_u16_le((units.len() * 2) as u16);
                for unit in units {
                    dst.put_u16_le(unit);
                }
            }
            Self::Binary(b) => {
                let len = b.len().min(usize::from(u16::MAX - 1));
                dst.put_u16_le(len as u16);
                dst.put_slice(&b[..len]);
            }
        }
    }
}

/// Builder for a response token stream.
#[derive(Debug, Default)]
pub struct TokenWriter {
    buf: BytesMut,
}

impl TokenWriter {
    /// Empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// DONE token.
    pub fn done(&mut self, status: DoneStatus, row_count: u64) -> &mut Self {
        self.done_token(TokenType::Done, status, row_count)
    }

    /// DONEPROC token.
    pub fn done_proc(&mut self, status: DoneStatus, row_count: u64) -> &mut Self {
        self.done_token(TokenType::DoneProc, status, row_count)
    }

    /// DONEINPROC token.
    pub fn done_in_proc(&mut self, status: DoneStatus, row_count: u64) -> &mut Self {
        self.done_token(TokenType::DoneInProc, status, row_count)
    }

    fn done_token(&mut self, tag: TokenType, status: DoneStatus, row_count: u64) -> &mut Self {
        Done {
            status,
            cur_cmd: 0,
            row_count,
        }
        .encode(tag, &mut self.buf);
        self
    }

    /// ENVCHANGE carrying string values.
    pub fn env_change(&mut self, env_type: EnvChangeType, new: &str, old: &str) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_u8(env_type.as_u8());
        put_b_varchar(&mut body, new);
        put_b_varchar(&mut body, old);
        self.length_prefixed(TokenType::EnvChange, &body)
    }

    /// ENVCHANGE carrying binary values.
    pub fn env_change_binary(&mut self, env_type: EnvChangeType, new: &[u8], old: &[u8]) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_u8(env_type.as_u8());
        put_b_varbyte(&mut body, new);
        put_b_varbyte(&mut body, old);
        self.length_prefixed(TokenType::EnvChange, &body)
    }

    /// Transaction started with `descriptor`.
    pub fn begin_transaction(&mut self, descriptor: u64) -> &mut Self {
        self.env_change_binary(EnvChangeType::BeginTransaction, &descriptor.to_le_bytes(), &[])
    }

    /// Transaction `descriptor` committed.
    pub fn commit_transaction(&mut self, descriptor: u64) -> &mut Self {
        self.env_change_binary(EnvChangeType::CommitTransaction, &[], &descriptor.to_le_bytes())
    }

    /// Transaction `descriptor` rolled back.
    pub fn rollback_transaction(&mut self, descriptor: u64) -> &mut Self {
        self.env_change_binary(EnvChangeType::RollbackTransaction, &[], &descriptor.to_le_bytes())
    }

    /// LOGINACK token. Both versions go out big-endian.
    pub fn login_ack(&mut self, tds_version: TdsVersion, prog_name: &str, prog_version: u32) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_u32(tds_version.raw());
        put_b_varchar(&mut body, prog_name);
        body.put_u32(prog_version);
        self.length_prefixed(TokenType::LoginAck, &body)
    }

    /// ERROR token.
    pub fn error(&mut self, number: i32, class: u8, message: &str, server: &str) -> &mut Self {
        self.message(TokenType::Error, number, class, message, server)
    }

    /// INFO token.
    pub fn info(&mut self, number: i32, message: &str, server: &str) -> &mut Self {
        self.message(TokenType::Info, number, 0, message, server)
    }

    fn message(&mut self, tag: TokenType, number: i32, class: u8, message: &str, server: &str) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_i32_le(number);
        body.put_u8(1);
        body.put_u8(class);
        let units: Vec<u16> = message.encode_utf16().take(usize::from(u16::MAX)).collect();
        body.put_u16_le(units.len() as u16);
        for unit in units {
            body.put_u16_le(unit);
        }
        put_b_varchar(&mut body, server);
        put_b_varchar(&mut body, "");
        body.put_i32_le(1);
        self.length_prefixed(tag, &body)
    }

    /// COLMETADATA token.
    pub fn col_metadata(&mut self, columns: &[MockColumn]) -> &mut Self {
        let buf = &mut self.buf;
        buf.put_u8(TokenType::ColMetaData as u8);
        buf.put_u16_le(columns.len() as u16);
        for column in columns {
            buf.put_u32_le(0);
            buf.put_u16_le(u16::from(column.nullable));
            buf.put_u8(column.type_id as u8);
            if column.type_id.is_ushort_len() {
                buf.put_u16_le(column.max_length);
                if column.type_id.has_collation() {
                    buf.put_slice(&COLLATION);
                }
            } else {
                buf.put_u8(column.max_length as u8);
            }
            put_b_varchar(buf, &column.name);
        }
        self
    }

    /// ROW token with one value per column.
    pub fn row(&mut self, columns: &[MockColumn], values: &[ScalarValue]) -> &mut Self {
        self.buf.put_u8(TokenType::Row as u8);
        for (column, value) in columns.iter().zip(values) {
            value.encode(column, &mut self.buf);
        }
        self
    }

    /// RETURNSTATUS token.
    pub fn return_status(&mut self, status: i32) -> &mut Self {
        self.buf.put_u8(TokenType::ReturnStatus as u8);
        self.buf.put_i32_le(status);
        self
    }

    /// Append bytes verbatim.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded stream.
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn length_prefixed(&mut self, tag: TokenType, body: &[u8]) -> &mut Self {
        self.buf.put_u8(tag as u8);
        self.buf.put_u16_le(body.len() as u16);
        self.buf.put_slice(body);
        self
    }
}

fn put_b_varchar(dst: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(usize::from(u8::MAX)).collect();
    dst.put_u8(units.len() as u8);
    for unit in units {
        dst.put_u16_le(unit);
    }
}

fn put_b_varbyte(dst: &mut BytesMut, bytes: &[u8]) {
    let len = bytes.len().min(usize::from(u8::MAX));
    dst.put_u8(len as u8);
    dst.put_slice(&bytes[..len]);
}
