//! LOGIN7 message for SQL authentication.
//!
//! A 94-byte fixed header of scalars and `(offset, length)` pairs, followed by
//! the UTF-16LE strings those pairs point at. Lengths are in characters and
//! offsets are relative to the start of the message.
//!
//! The password is obfuscated (each byte nibble-swapped then XOR `0xA5`), not
//! encrypted.

use bytes::{Bytes, BytesMut};

use crate::codec::{WireSink, utf16_len};
use crate::cursor::ByteCursor;
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Size of the fixed header.
pub const LOGIN7_HEADER_SIZE: usize = 94;

/// fUseDB | fDatabase (fatal) | fSetLang.
const OPTION_FLAGS_1: u8 = 0xE0;
/// fLanguage (fatal) | fODBC.
const OPTION_FLAGS_2: u8 = 0x03;
/// fUnknownCollationHandling.
const OPTION_FLAGS_3: u8 = 0x08;

const LIBRARY_NAME: &str = "tds-mux";

/// LOGIN7 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login7 {
    /// Requested protocol version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client process id.
    pub client_pid: u32,
    /// Client machine name.
    pub hostname: String,
    /// Login name.
    pub username: String,
    /// Password (plain; obfuscated on encode).
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_pid: std::process::id(),
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: LIBRARY_NAME.to_string(),
            language: String::new(),
            database: String::new(),
        }
    }
}

impl Login7 {
    /// Login with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SQL credentials.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the client host name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Variable-length fields in header order. `None` marks the unused slot.
    fn fields(&self) -> [(&'static str, Option<&str>); 9] {
        [
            ("hostname", Some(self.hostname.as_str())),
            ("username", Some(self.username.as_str())),
            ("password", Some(self.password.as_str())),
            ("app name", Some(self.app_name.as_str())),
            ("server name", Some(self.server_name.as_str())),
            ("extension", None),
            ("library name", Some(self.library_name.as_str())),
            ("language", Some(self.language.as_str())),
            ("database", Some(self.database.as_str())),
        ]
    }

    /// Encode the complete message.
    pub fn encode(&self, dst: &mut impl WireSink) -> Result<(), ProtocolError> {
        let mut offsets = BytesMut::with_capacity(LOGIN7_HEADER_SIZE - 36);
        let mut data = BytesMut::new();

        for (index, (field, value)) in self.fields().into_iter().enumerate() {
            let value = value.unwrap_or_default();
            let chars = utf16_len(value);
            if chars > 128 {
                return Err(ProtocolError::StringTooLong {
                    field,
                    len: chars,
                    max: 128,
                });
            }
            offsets.write_u16_le((LOGIN7_HEADER_SIZE + data.len()) as u16);
            offsets.write_u16_le(chars as u16);
            if index == 2 {
                write_obfuscated_password(&mut data, value);
            } else {
                data.write_utf16(value);
            }
        }

        // client id (MAC address), then empty SSPI, attach-db and change-password
        offsets.write_bytes(&[0u8; 6]);
        let end = (LOGIN7_HEADER_SIZE + data.len()) as u16;
        for _ in 0..3 {
            offsets.write_u16_le(end);
            offsets.write_u16_le(0);
        }
        offsets.write_u32_le(0);

        let total = LOGIN7_HEADER_SIZE + data.len();
        let total = u32::try_from(total).map_err(|_| ProtocolError::InvalidField {
            field: "login length",
            value: total as u64,
        })?;

        dst.write_u32_le(total);
        dst.write_u32_le(self.tds_version.raw());
        dst.write_u32_le(self.packet_size);
        dst.write_u32_le(0); // client program version
        dst.write_u32_le(self.client_pid);
        dst.write_u32_le(0); // connection id
        dst.write_bytes(&[OPTION_FLAGS_1, OPTION_FLAGS_2, 0, OPTION_FLAGS_3]);
        dst.write_u32_le(0); // client time zone
        dst.write_u32_le(0x0409); // client LCID
        dst.write_bytes(&offsets);
        dst.write_bytes(&data);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(LOGIN7_HEADER_SIZE + 256);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a LOGIN7 message, recovering the password.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut header = ByteCursor::new(payload.clone());
        let total = header.read_u32_le()? as usize;
        if total != payload.len() {
            return Err(ProtocolError::InvalidField {
                field: "login length",
                value: total as u64,
            });
        }
        let tds_version = TdsVersion::new(header.read_u32_le()?);
        let packet_size = header.read_u32_le()?;
        header.skip(4)?;
        let client_pid = header.read_u32_le()?;
        header.skip(4 + 4 + 4 + 4)?;

        let mut strings: Vec<String> = Vec::with_capacity(9);
        for index in 0..9 {
            let offset = header.read_u16_le()? as usize;
            let chars = header.read_u16_le()? as usize;
            if index == 5 {
                continue;
            }
            let mut at = ByteCursor::new(payload.clone());
            at.skip(offset)?;
            let text = if index == 2 {
                let raw = at.read_bytes(chars * 2)?;
                let plain: Vec<u8> = raw.iter().map(|b| (b ^ 0xA5).rotate_left(4)).collect();
                ByteCursor::new(Bytes::from(plain)).read_utf16(chars, "password")?
            } else {
                at.read_utf16(chars, "login field")?
            };
            strings.push(text);
        }

        let mut strings = strings.into_iter();
        let mut next = || strings.next().unwrap_or_default();
        Ok(Self {
            tds_version,
            packet_size,
            client_pid,
            hostname: next(),
            username: next(),
            password: next(),
            app_name: next(),
            server_name: next(),
            library_name: next(),
            language: next(),
            database: next(),
        })
    }
}

fn write_obfuscated_password(dst: &mut impl WireSink, password: &str) {
    for unit in password.encode_utf16() {
        for byte in unit.to_le_bytes() {
            dst.write_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_password_obfuscation() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        // 'a' = 0x61 0x00 -> swap nibbles 0x16 0x00 -> xor 0xA5 0xB3 0xA5
        assert_eq!(&buf[..], &[0xB3, 0xA5]);
    }

    #[test]
    fn test_fixed_header_layout() {
        let login = Login7::new()
            .with_sql_auth("sa", "secret")
            .with_database("orders");
        let bytes = login.to_bytes().unwrap();

        let total = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(total, bytes.len());
        assert_eq!(&bytes[4..8], &0x7400_0004u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &4096u32.to_le_bytes());
        // hostname offset points right after the fixed header
        assert_eq!(u16::from_le_bytes([bytes[36], bytes[37]]), 94);
    }

    #[test]
    fn test_decode_recovers_fields() {
        let login = Login7::new()
            .with_sql_auth("app_user", "p@ss wörd")
            .with_database("orders")
            .with_hostname("web-01")
            .with_app_name("billing")
            .with_packet_size(8192);
        let decoded = Login7::decode(login.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, login);
    }

    #[test]
    fn test_overlong_field_rejected() {
        let login = Login7::new().with_database("d".repeat(129));
        assert!(matches!(
            login.to_bytes(),
            Err(ProtocolError::StringTooLong {
                field: "database",
                ..
            })
        ));
    }
}
