//! SMB1 multi-protocol NEGOTIATE
//!
//! Older clients open with an SMB1 negotiate listing dialect strings. A server
//! that speaks SMB2 answers with an SMB2 NEGOTIATE response.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{SmbError, SmbResult};
use crate::protocol::dialect::Dialect;
use crate::protocol::header::LegacyHeader;

/// Dialect string selecting SMB 2.0.2 directly
pub const DIALECT_SMB2_002: &str = "SMB 2.002";

/// Dialect string asking for an SMB2 negotiate round
pub const DIALECT_SMB2_WILDCARD: &str = "SMB 2.???";

/// Buffer-format byte preceding each dialect string
const DIALECT_BUFFER_FORMAT: u8 = 0x02;

/// SMB1 NEGOTIATE request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyNegotiate {
    /// SMB1 header
    pub header: LegacyHeader,
    /// Offered dialect strings, in client order
    pub dialects: Vec<String>,
}

impl LegacyNegotiate {
    /// Create a negotiate offering the given dialect strings
    pub fn new<I, S>(dialects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: LegacyHeader {
                command: LegacyHeader::COM_NEGOTIATE,
                ..Default::default()
            },
            dialects: dialects.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse from bytes
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        let header = LegacyHeader::parse(buf)?;
        if header.command != LegacyHeader::COM_NEGOTIATE {
            return Err(SmbError::NotSupported(format!(
                "SMB1 command 0x{:02X}",
                header.command
            )));
        }
        if buf.remaining() < 3 {
            return Err(SmbError::Protocol("SMB1 negotiate truncated".to_string()));
        }

        let word_count = buf.get_u8() as usize;
        if buf.remaining() < word_count * 2 + 2 {
            return Err(SmbError::Protocol("SMB1 negotiate truncated".to_string()));
        }
        buf.advance(word_count * 2);
        let byte_count = buf.get_u16_le() as usize;
        if buf.remaining() < byte_count {
            return Err(SmbError::Protocol("SMB1 dialect list truncated".to_string()));
        }

        let mut list = &buf[..byte_count];
        let mut dialects = Vec::new();
        while !list.is_empty() {
            if list[0] != DIALECT_BUFFER_FORMAT {
                return Err(SmbError::Protocol(format!(
                    "Bad dialect buffer format 0x{:02X}",
                    list[0]
                )));
            }
            let end = list
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| SmbError::Protocol("Unterminated dialect string".to_string()))?;
            dialects.push(String::from_utf8_lossy(&list[1..end]).into_owned());
            list = &list[end + 1..];
        }
        buf.advance(byte_count);

        Ok(Self { header, dialects })
    }

    /// Encode to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.put_u8(0); // WordCount
        let byte_count: usize = self.dialects.iter().map(|d| d.len() + 2).sum();
        buf.put_u16_le(byte_count as u16);
        for dialect in &self.dialects {
            buf.put_u8(DIALECT_BUFFER_FORMAT);
            buf.put_slice(dialect.as_bytes());
            buf.put_u8(0);
        }
    }

    /// SMB2 dialect to answer with, if any offered string is an SMB2 one
    pub fn smb2_dialect(&self) -> Option<Dialect> {
        if self.offers(DIALECT_SMB2_WILDCARD) {
            Some(Dialect::Wildcard)
        } else if self.offers(DIALECT_SMB2_002) {
            Some(Dialect::Smb202)
        } else {
            None
        }
    }

    fn offers(&self, dialect: &str) -> bool {
        self.dialects.iter().any(|d| d == dialect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_bytes() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"\xFFSMB\x72");
        wire.extend_from_slice(&[0u8; 27]);
        wire.push(0); // WordCount
        let strings = b"\x02NT LM 0.12\x00\x02SMB 2.002\x00\x02SMB 2.???\x00";
        wire.extend_from_slice(&(strings.len() as u16).to_le_bytes());
        wire.extend_from_slice(strings);

        let negotiate = LegacyNegotiate::parse(&mut &wire[..]).unwrap();
        assert_eq!(negotiate.dialects, vec!["NT LM 0.12", "SMB 2.002", "SMB 2.???"]);
        assert_eq!(negotiate.smb2_dialect(), Some(Dialect::Wildcard));

        let mut buf = BytesMut::new();
        negotiate.encode(&mut buf);
        assert_eq!(&buf[..], &wire[..]);
    }

    #[test]
    fn test_smb2_002_only() {
        let negotiate = LegacyNegotiate::new(["NT LM 0.12", DIALECT_SMB2_002]);
        assert_eq!(negotiate.smb2_dialect(), Some(Dialect::Smb202));
    }

    #[test]
    fn test_no_smb2_dialect() {
        let negotiate = LegacyNegotiate::new(["NT LM 0.12"]);
        assert_eq!(negotiate.smb2_dialect(), None);
    }

    #[test]
    fn test_unterminated_string() {
        let mut buf = BytesMut::new();
        LegacyNegotiate::new([DIALECT_SMB2_002]).encode(&mut buf);
        let len = buf.len();
        buf[len - 1] = b'!';
        assert!(LegacyNegotiate::parse(&mut &buf[..]).is_err());
    }
}
