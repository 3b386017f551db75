//! NEGOEX messages (MS-NEGOEX)
//!
//! All messages share a 40-byte header. Vectors inside a message are
//! described by offsets relative to the start of that message, and one token
//! may carry several messages back to back.

mod exchange;

pub use exchange::{
    AuthScheme, NegoexMechanism, Role, KEY_USAGE_ACCEPTOR_CHECKSUM, KEY_USAGE_INITIATOR_CHECKSUM,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{SmbError, SmbResult};
use crate::protocol::Guid;

/// "NEGOEXTS" read as a little-endian u64
pub const SIGNATURE: u64 = 0x535458454f47454e;

/// Common header size
pub const HEADER_SIZE: usize = 40;

const NEGO_HEADER_LENGTH: usize = 96;
const EXCHANGE_HEADER_LENGTH: usize = 64;
const VERIFY_HEADER_LENGTH: usize = 80;
const ALERT_HEADER_LENGTH: usize = 68;
const CHECKSUM_HEADER_LENGTH: u32 = 20;
const EXTENSION_SIZE: usize = 12;

/// CHECKSUM_SCHEME_RFC3961
pub const CHECKSUM_SCHEME_RFC3961: u32 = 1;

/// Message type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Initiator NEGO
    InitiatorNego,
    /// Acceptor NEGO
    AcceptorNego,
    /// Initiator meta data
    InitiatorMetaData,
    /// Acceptor meta data
    AcceptorMetaData,
    /// Acceptor challenge
    Challenge,
    /// Initiator AP request
    ApRequest,
    /// Verify
    Verify,
    /// Alert
    Alert,
}

impl MessageType {
    /// Raw value
    pub fn code(self) -> u32 {
        match self {
            Self::InitiatorNego => 0,
            Self::AcceptorNego => 1,
            Self::InitiatorMetaData => 2,
            Self::AcceptorMetaData => 3,
            Self::Challenge => 4,
            Self::ApRequest => 5,
            Self::Verify => 6,
            Self::Alert => 7,
        }
    }

    /// Parse a raw value
    pub fn from_code(code: u32) -> SmbResult<Self> {
        Ok(match code {
            0 => Self::InitiatorNego,
            1 => Self::AcceptorNego,
            2 => Self::InitiatorMetaData,
            3 => Self::AcceptorMetaData,
            4 => Self::Challenge,
            5 => Self::ApRequest,
            6 => Self::Verify,
            7 => Self::Alert,
            other => {
                return Err(SmbError::Protocol(format!(
                    "Unknown NEGOEX message type {other}"
                )))
            }
        })
    }
}

/// NEGO extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Extension type (high bit marks it critical)
    pub extension_type: u32,
    /// Extension value
    pub value: Bytes,
}

/// NEGO message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nego {
    /// Random bytes
    pub random: [u8; 32],
    /// Protocol version (0)
    pub protocol_version: u64,
    /// Offered or accepted auth schemes, in preference order
    pub auth_schemes: Vec<Guid>,
    /// Extensions
    pub extensions: Vec<Extension>,
}

/// Checksum carried in a VERIFY message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// Checksum scheme (RFC 3961)
    pub scheme: u32,
    /// Checksum type
    pub checksum_type: u32,
    /// Checksum value
    pub value: Bytes,
}

/// Message body, by message family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegoexBody {
    /// INITIATOR_NEGO / ACCEPTOR_NEGO
    Nego(Nego),
    /// META_DATA, CHALLENGE and AP_REQUEST
    Exchange {
        /// Auth scheme the payload belongs to
        auth_scheme: Guid,
        /// Payload
        exchange: Bytes,
    },
    /// VERIFY
    Verify {
        /// Auth scheme that produced the checksum
        auth_scheme: Guid,
        /// Checksum
        checksum: Checksum,
    },
    /// ALERT (alert vector not interpreted)
    Alert {
        /// Auth scheme the alert is about
        auth_scheme: Guid,
        /// Error status
        error_code: u32,
    },
}

/// One NEGOEX message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegoexMessage {
    /// Message type
    pub message_type: MessageType,
    /// Sequence number within the conversation
    pub sequence_num: u32,
    /// Conversation ID
    pub conversation_id: Guid,
    /// Body
    pub body: NegoexBody,
}

impl NegoexMessage {
    /// Encode, appending to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        let start = buf.len();
        let header_length = self.header_length();
        let mut payload = BytesMut::new();
        let mut fixed = BytesMut::with_capacity(header_length - HEADER_SIZE);

        // Payload offsets are relative to the message start
        let offset = |payload: &BytesMut| (header_length + payload.len()) as u32;

        match &self.body {
            NegoexBody::Nego(nego) => {
                fixed.put_slice(&nego.random);
                fixed.put_u64_le(nego.protocol_version);

                let schemes_offset = offset(&payload);
                for scheme in &nego.auth_schemes {
                    scheme.encode(&mut payload);
                }
                fixed.put_u32_le(if nego.auth_schemes.is_empty() { 0 } else { schemes_offset });
                fixed.put_u16_le(nego.auth_schemes.len() as u16);
                fixed.put_u16_le(0);

                let extensions_offset = offset(&payload);
                let values_start =
                    extensions_offset as usize + nego.extensions.len() * EXTENSION_SIZE;
                let mut values = BytesMut::new();
                for ext in &nego.extensions {
                    payload.put_u32_le(ext.extension_type);
                    payload.put_u32_le((values_start + values.len()) as u32);
                    payload.put_u32_le(ext.value.len() as u32);
                    values.put_slice(&ext.value);
                }
                payload.put_slice(&values);
                fixed.put_u32_le(if nego.extensions.is_empty() { 0 } else { extensions_offset });
                fixed.put_u16_le(nego.extensions.len() as u16);
                fixed.put_u16_le(0);
            }
            NegoexBody::Exchange {
                auth_scheme,
                exchange,
            } => {
                auth_scheme.encode(&mut fixed);
                fixed.put_u32_le(offset(&payload));
                fixed.put_u32_le(exchange.len() as u32);
                payload.put_slice(exchange);
            }
            NegoexBody::Verify {
                auth_scheme,
                checksum,
            } => {
                auth_scheme.encode(&mut fixed);
                fixed.put_u32_le(CHECKSUM_HEADER_LENGTH);
                fixed.put_u32_le(checksum.scheme);
                fixed.put_u32_le(checksum.checksum_type);
                fixed.put_u32_le(offset(&payload));
                fixed.put_u32_le(checksum.value.len() as u32);
                fixed.put_u32_le(0); // Pad
                payload.put_slice(&checksum.value);
            }
            NegoexBody::Alert {
                auth_scheme,
                error_code,
            } => {
                auth_scheme.encode(&mut fixed);
                fixed.put_u32_le(*error_code);
                fixed.put_u32_le(0); // AlertArrayOffset
                fixed.put_u16_le(0); // AlertCount
                fixed.put_u16_le(0);
            }
        }

        let message_length = header_length + payload.len();
        let message_length = u32::try_from(message_length)
            .map_err(|_| SmbError::Protocol("NEGOEX message too large".to_string()))?;

        buf.put_u64_le(SIGNATURE);
        buf.put_u32_le(self.message_type.code());
        buf.put_u32_le(self.sequence_num);
        buf.put_u32_le(header_length as u32);
        buf.put_u32_le(message_length);
        self.conversation_id.encode(buf);
        buf.put_slice(&fixed);
        buf.put_slice(&payload);
        debug_assert_eq!(buf.len() - start, message_length as usize);
        Ok(())
    }

    fn header_length(&self) -> usize {
        match self.body {
            NegoexBody::Nego(_) => NEGO_HEADER_LENGTH,
            NegoexBody::Exchange { .. } => EXCHANGE_HEADER_LENGTH,
            NegoexBody::Verify { .. } => VERIFY_HEADER_LENGTH,
            NegoexBody::Alert { .. } => ALERT_HEADER_LENGTH,
        }
    }

    /// Parse one message, returning it and its length
    pub fn parse(input: &[u8]) -> SmbResult<(Self, usize)> {
        if input.len() < HEADER_SIZE {
            return Err(SmbError::Protocol("NEGOEX header truncated".to_string()));
        }
        let mut buf = input;
        if buf.get_u64_le() != SIGNATURE {
            return Err(SmbError::Protocol("Bad NEGOEX signature".to_string()));
        }
        let message_type = MessageType::from_code(buf.get_u32_le())?;
        let sequence_num = buf.get_u32_le();
        let header_length = buf.get_u32_le() as usize;
        let message_length = buf.get_u32_le() as usize;
        let conversation_id = Guid::parse(&mut buf)?;

        if message_length > input.len() || header_length > message_length {
            return Err(SmbError::Protocol(format!(
                "NEGOEX lengths inconsistent: header {header_length}, message {message_length}, have {}",
                input.len()
            )));
        }
        let message = &input[..message_length];

        let body = match message_type {
            MessageType::InitiatorNego | MessageType::AcceptorNego => {
                need(message, NEGO_HEADER_LENGTH)?;
                let mut random = [0u8; 32];
                buf.copy_to_slice(&mut random);
                let protocol_version = buf.get_u64_le();
                let schemes_offset = buf.get_u32_le() as usize;
                let schemes_count = buf.get_u16_le() as usize;
                let _pad = buf.get_u16_le();
                let extensions_offset = buf.get_u32_le() as usize;
                let extensions_count = buf.get_u16_le() as usize;

                let mut schemes = slice(message, schemes_offset, schemes_count * Guid::SIZE)?;
                let auth_schemes = (0..schemes_count)
                    .map(|_| Guid::parse(&mut schemes))
                    .collect::<SmbResult<Vec<_>>>()?;

                let mut raw = slice(message, extensions_offset, extensions_count * EXTENSION_SIZE)?;
                let mut extensions = Vec::with_capacity(extensions_count);
                for _ in 0..extensions_count {
                    let extension_type = raw.get_u32_le();
                    let offset = raw.get_u32_le() as usize;
                    let len = raw.get_u32_le() as usize;
                    extensions.push(Extension {
                        extension_type,
                        value: Bytes::copy_from_slice(slice(message, offset, len)?),
                    });
                }

                NegoexBody::Nego(Nego {
                    random,
                    protocol_version,
                    auth_schemes,
                    extensions,
                })
            }
            MessageType::InitiatorMetaData
            | MessageType::AcceptorMetaData
            | MessageType::Challenge
            | MessageType::ApRequest => {
                need(message, EXCHANGE_HEADER_LENGTH)?;
                let auth_scheme = Guid::parse(&mut buf)?;
                let offset = buf.get_u32_le() as usize;
                let len = buf.get_u32_le() as usize;
                NegoexBody::Exchange {
                    auth_scheme,
                    exchange: Bytes::copy_from_slice(slice(message, offset, len)?),
                }
            }
            MessageType::Verify => {
                need(message, VERIFY_HEADER_LENGTH - 4)?;
                let auth_scheme = Guid::parse(&mut buf)?;
                let checksum_header = buf.get_u32_le();
                if checksum_header != CHECKSUM_HEADER_LENGTH {
                    return Err(SmbError::Protocol(format!(
                        "Bad NEGOEX checksum header length {checksum_header}"
                    )));
                }
                let scheme = buf.get_u32_le();
                let checksum_type = buf.get_u32_le();
                let offset = buf.get_u32_le() as usize;
                let len = buf.get_u32_le() as usize;
                NegoexBody::Verify {
                    auth_scheme,
                    checksum: Checksum {
                        scheme,
                        checksum_type,
                        value: Bytes::copy_from_slice(slice(message, offset, len)?),
                    },
                }
            }
            MessageType::Alert => {
                need(message, HEADER_SIZE + 20)?;
                let auth_scheme = Guid::parse(&mut buf)?;
                let error_code = buf.get_u32_le();
                NegoexBody::Alert {
                    auth_scheme,
                    error_code,
                }
            }
        };

        Ok((
            Self {
                message_type,
                sequence_num,
                conversation_id,
                body,
            },
            message_length,
        ))
    }

    /// Parse every message of a token, returning each with its raw bytes
    pub fn parse_all(mut input: &[u8]) -> SmbResult<Vec<(Self, &[u8])>> {
        let mut messages = Vec::new();
        while !input.is_empty() {
            let (message, len) = Self::parse(input)?;
            messages.push((message, &input[..len]));
            input = &input[len..];
        }
        Ok(messages)
    }
}

fn need(message: &[u8], len: usize) -> SmbResult<()> {
    if message.len() < len {
        return Err(SmbError::Protocol("NEGOEX message truncated".to_string()));
    }
    Ok(())
}

fn slice(message: &[u8], offset: usize, len: usize) -> SmbResult<&[u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    offset
        .checked_add(len)
        .filter(|&end| end <= message.len())
        .map(|end| &message[offset..end])
        .ok_or_else(|| {
            SmbError::Protocol(format!(
                "NEGOEX vector {offset}+{len} outside {}-byte message",
                message.len()
            ))
        })
}
