//! Minimal DER reader/writer for the SPNEGO token grammar

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::error::{SmbError, SmbResult};

/// Universal and context tags used by SPNEGO
pub mod tag {
    /// BIT STRING
    pub const BIT_STRING: u8 = 0x03;
    /// OCTET STRING
    pub const OCTET_STRING: u8 = 0x04;
    /// OBJECT IDENTIFIER
    pub const OID: u8 = 0x06;
    /// ENUMERATED
    pub const ENUMERATED: u8 = 0x0A;
    /// GeneralString
    pub const GENERAL_STRING: u8 = 0x1B;
    /// SEQUENCE
    pub const SEQUENCE: u8 = 0x30;
    /// [APPLICATION 0] constructed (GSS-API initial context token)
    pub const APPLICATION_0: u8 = 0x60;

    /// Constructed context-specific tag `[n]`
    pub const fn context(n: u8) -> u8 {
        0xA0 | n
    }
}

/// Object identifier, stored as its DER content octets
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Oid(Cow<'static, [u8]>);

impl Oid {
    /// SPNEGO 1.3.6.1.5.5.2
    pub const SPNEGO: Oid = Oid(Cow::Borrowed(&[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02]));

    /// NTLMSSP 1.3.6.1.4.1.311.2.2.10
    pub const NTLM: Oid = Oid(Cow::Borrowed(&[
        0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a,
    ]));

    /// Kerberos 5 1.2.840.113554.1.2.2
    pub const KERBEROS: Oid = Oid(Cow::Borrowed(&[
        0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02,
    ]));

    /// Microsoft's legacy Kerberos OID 1.2.840.48018.1.2.2
    pub const MS_KERBEROS: Oid = Oid(Cow::Borrowed(&[
        0x2a, 0x86, 0x48, 0x82, 0xf7, 0x12, 0x01, 0x02, 0x02,
    ]));

    /// NEGOEX 1.3.6.1.4.1.311.2.2.30
    pub const NEGOEX: Oid = Oid(Cow::Borrowed(&[
        0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x1e,
    ]));

    /// Build from dotted arcs
    pub fn from_arcs(arcs: &[u64]) -> SmbResult<Self> {
        if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
            return Err(SmbError::Protocol(format!("Invalid OID arcs: {arcs:?}")));
        }
        let mut out = Vec::new();
        push_base128(arcs[0] * 40 + arcs[1], &mut out);
        for &arc in &arcs[2..] {
            push_base128(arc, &mut out);
        }
        Ok(Self(Cow::Owned(out)))
    }

    /// Wrap DER content octets
    pub fn from_der_content(content: &[u8]) -> SmbResult<Self> {
        if content.is_empty() || content[content.len() - 1] & 0x80 != 0 {
            return Err(SmbError::Protocol("Malformed OID".to_string()));
        }
        Ok(Self(Cow::Owned(content.to_vec())))
    }

    /// DER content octets
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Dotted arcs
    pub fn arcs(&self) -> Vec<u64> {
        let mut arcs = Vec::new();
        let mut value = 0u64;
        for &b in self.0.iter() {
            value = (value << 7) | u64::from(b & 0x7f);
            if b & 0x80 == 0 {
                if arcs.is_empty() {
                    let first = (value / 40).min(2);
                    arcs.push(first);
                    arcs.push(value - first * 40);
                } else {
                    arcs.push(value);
                }
                value = 0;
            }
        }
        arcs
    }

    /// Append as a full TLV
    pub fn write(&self, out: &mut Vec<u8>) {
        write_tlv(tag::OID, &self.0, out);
    }
}

fn push_base128(mut value: u64, out: &mut Vec<u8>) {
    let mut tmp = [0u8; 10];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = tmp.len() - 1;
    for (j, b) in tmp.iter().enumerate().skip(i) {
        out.push(if j == last { *b } else { b | 0x80 });
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arcs: Vec<String> = self.arcs().iter().map(u64::to_string).collect();
        f.write_str(&arcs.join("."))
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({self})")
    }
}

impl FromStr for Oid {
    type Err = SmbError;

    fn from_str(s: &str) -> SmbResult<Self> {
        let arcs = s
            .split('.')
            .map(|a| a.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SmbError::Protocol(format!("Invalid OID '{s}': {e}")))?;
        Self::from_arcs(&arcs)
    }
}

/// Append a definite length
fn write_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = (len as u32).to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (4 - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

/// Append one tag-length-value
pub fn write_tlv(tag: u8, content: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    write_length(content.len(), out);
    out.extend_from_slice(content);
}

/// Append a TLV whose content is produced by `f`
pub fn write_nested(tag: u8, out: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let mut content = Vec::new();
    f(&mut content);
    write_tlv(tag, &content, out);
}

/// Read one tag-length-value, returning tag and content
pub fn read_tlv<'a>(buf: &mut &'a [u8]) -> SmbResult<(u8, &'a [u8])> {
    let input = *buf;
    if input.len() < 2 {
        return Err(truncated());
    }
    let tag = input[0];
    let first = input[1];
    let (len, header) = if first & 0x80 == 0 {
        (first as usize, 2)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 {
            return Err(SmbError::Protocol(format!(
                "Unsupported DER length form 0x{first:02X}"
            )));
        }
        if input.len() < 2 + n {
            return Err(truncated());
        }
        let len = input[2..2 + n]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, 2 + n)
    };
    let end = header
        .checked_add(len)
        .filter(|&end| end <= input.len())
        .ok_or_else(truncated)?;
    *buf = &input[end..];
    Ok((tag, &input[header..end]))
}

/// Read a TLV and check its tag
pub fn expect_tlv<'a>(buf: &mut &'a [u8], expected: u8) -> SmbResult<&'a [u8]> {
    let (tag, content) = read_tlv(buf)?;
    if tag != expected {
        return Err(SmbError::Protocol(format!(
            "Expected DER tag 0x{expected:02X}, found 0x{tag:02X}"
        )));
    }
    Ok(content)
}

/// Tag of the next TLV without consuming it
pub fn peek_tag(buf: &[u8]) -> Option<u8> {
    buf.first().copied()
}

fn truncated() -> SmbError {
    SmbError::Protocol("DER value truncated".to_string())
}
