//! PRELOGIN message.
//!
//! The first message on a new connection. A table of option entries
//! (`type: u8`, `offset: u16 BE`, `length: u16 BE`) closed by `0xFF`, followed
//! by the option data the offsets point into. The server answers with the
//! same layout.

use bytes::Bytes;

use crate::codec::WireSink;
use crate::cursor::ByteCursor;
use crate::error::ProtocolError;

/// Driver version announced in the VERSION option (0.1.0).
const CLIENT_VERSION: u32 = 0x0001_0000;

/// Option type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name.
    Instance = 0x02,
    /// Client thread id.
    ThreadId = 0x03,
    /// MARS support.
    Mars = 0x04,
    /// End of the option table.
    Terminator = 0xFF,
}

/// Encryption negotiation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login packet only.
    Off = 0x00,
    /// Encrypt everything.
    On = 0x01,
    /// Encryption unavailable.
    #[default]
    NotSupported = 0x02,
    /// Encryption mandatory.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Map the wire byte; unknown values are treated as `Required`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Off,
            0x01 => Self::On,
            0x02 => Self::NotSupported,
            _ => Self::Required,
        }
    }

    /// Whether a peer answering with this level insists on TLS.
    #[must_use]
    pub const fn demands_tls(self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// PRELOGIN request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreLogin {
    /// Big-endian version word (client driver or server product version).
    pub version: u32,
    /// Sub-build number.
    pub sub_build: u16,
    /// Encryption negotiation.
    pub encryption: EncryptionLevel,
    /// Named instance.
    pub instance: Option<String>,
    /// Client thread id.
    pub thread_id: Option<u32>,
    /// MARS requested or granted.
    pub mars: bool,
}

impl Default for PreLogin {
    fn default() -> Self {
        Self {
            version: CLIENT_VERSION,
            sub_build: 0,
            encryption: EncryptionLevel::NotSupported,
            instance: None,
            thread_id: None,
            mars: false,
        }
    }
}

impl PreLogin {
    /// Client request with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the encryption level.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    fn options(&self) -> Vec<(PreLoginOption, Vec<u8>)> {
        let mut options = Vec::with_capacity(5);

        let mut version = self.version.to_be_bytes().to_vec();
        version.extend_from_slice(&self.sub_build.to_le_bytes());
        options.push((PreLoginOption::Version, version));
        options.push((PreLoginOption::Encryption, vec![self.encryption as u8]));

        if let Some(instance) = &self.instance {
            let mut data = instance.as_bytes().to_vec();
            data.push(0);
            options.push((PreLoginOption::Instance, data));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));
        options
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let options = self.options();
        options.len() * 5 + 1 + options.iter().map(|(_, d)| d.len()).sum::<usize>()
    }

    /// Encode the option table and data.
    pub fn encode(&self, dst: &mut impl WireSink) -> Result<(), ProtocolError> {
        let options = self.options();
        let mut offset = options.len() * 5 + 1;

        for (option, data) in &options {
            let at = u16::try_from(offset).map_err(|_| ProtocolError::InvalidField {
                field: "prelogin offset",
                value: offset as u64,
            })?;
            dst.write_u8(*option as u8);
            dst.write_u16_be(at);
            dst.write_u16_be(data.len() as u16);
            offset += data.len();
        }
        dst.write_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            dst.write_bytes(data);
        }
        Ok(())
    }

    /// Decode a PRELOGIN payload.
    ///
    /// Offsets are relative to the start of the payload. Unknown option types
    /// are ignored.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut table = ByteCursor::new(payload.clone());
        let mut prelogin = Self {
            version: 0,
            ..Self::default()
        };

        loop {
            let option = table.read_u8()?;
            if option == PreLoginOption::Terminator as u8 {
                break;
            }
            let offset = table.read_u16_be()? as usize;
            let length = table.read_u16_be()? as usize;
            let end = offset + length;
            if end > payload.len() {
                return Err(ProtocolError::UnexpectedEof {
                    offset,
                    needed: length,
                    available: payload.len().saturating_sub(offset),
                });
            }
            let mut data = ByteCursor::new(payload.slice(offset..end));

            match option {
                0x00 => {
                    prelogin.version = data.read_u32_be()?;
                    if data.remaining() >= 2 {
                        prelogin.sub_build = data.read_u16_le()?;
                    }
                }
                0x01 => prelogin.encryption = EncryptionLevel::from_u8(data.read_u8()?),
                0x02 => {
                    let raw = data.read_bytes(length)?;
                    let name = raw.split(|&b| b == 0).next().unwrap_or_default();
                    prelogin.instance = Some(String::from_utf8_lossy(name).into_owned());
                }
                0x03 if length >= 4 => prelogin.thread_id = Some(data.read_u32_be()?),
                0x04 if length >= 1 => prelogin.mars = data.read_u8()? != 0,
                _ => {}
            }
        }

        Ok(prelogin)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_encode_layout() {
        let prelogin = PreLogin::new();
        let mut buf = BytesMut::new();
        prelogin.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), prelogin.encoded_len());

        // VERSION, ENCRYPTION, MARS entries then terminator
        assert_eq!(&buf[0..5], &[0x00, 0x00, 16, 0x00, 6]);
        assert_eq!(&buf[5..10], &[0x01, 0x00, 22, 0x00, 1]);
        assert_eq!(&buf[10..15], &[0x04, 0x00, 23, 0x00, 1]);
        assert_eq!(buf[15], 0xFF);
        assert_eq!(buf[22], EncryptionLevel::NotSupported as u8);
    }

    #[test]
    fn test_decode_server_response() {
        let server = PreLogin {
            version: 0x1000_1068,
            sub_build: 3,
            encryption: EncryptionLevel::Off,
            instance: Some("MSSQLSERVER".into()),
            thread_id: None,
            mars: false,
        };
        let mut buf = BytesMut::new();
        server.encode(&mut buf).unwrap();

        let decoded = PreLogin::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, server);
    }

    #[test]
    fn test_decode_rejects_out_of_range_offset() {
        let payload = Bytes::from_static(&[0x01, 0x00, 0x40, 0x00, 0x01, 0xFF]);
        assert!(PreLogin::decode(payload).is_err());
    }

    #[test]
    fn test_decode_missing_terminator() {
        let payload = Bytes::from_static(&[0x01, 0x00, 0x06]);
        assert!(PreLogin::decode(payload).is_err());
    }
}
