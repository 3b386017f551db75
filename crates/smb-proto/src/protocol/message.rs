//! Whole messages, response mirroring and inbound packet classification

use bytes::{BufMut, BytesMut};

use crate::error::{NtStatus, SmbError, SmbResult};
use crate::flags::Flag;
use crate::protocol::body::{Body, ErrorResponse};
use crate::protocol::command::{Command, ProtocolVersion, SMB2_PROTOCOL_ID};
use crate::protocol::header::{
    Header, HeaderFlag, HeaderFlags, RawHeader, SIGNATURE_SIZE, SMB2_HEADER_SIZE,
};
use crate::protocol::legacy::LegacyNegotiate;

/// SMB2 message: header plus command body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header
    pub header: Header,
    /// Body
    pub body: Body,
}

impl Message {
    /// Create a message
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    /// Parse a single message
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        let header = Header::parse(buf)?;
        if header.next_command != 0 {
            return Err(SmbError::NotSupported(
                "Compounded requests".to_string(),
            ));
        }
        let body = Body::decode(header.command, header.is_response(), header.status, buf)?;
        Ok(Self { header, body })
    }

    /// Encode to bytes
    ///
    /// On error `buf` may hold a partial message.
    pub fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        self.header.encode(buf);
        self.body.encode(buf)
    }

    /// NTSTATUS carried by a response
    pub fn status(&self) -> NtStatus {
        self.header.status
    }
}

/// Response header fields chosen by a responder
///
/// `None` fields are filled from the request by [`mirror`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Status (defaults to success)
    pub status: Option<NtStatus>,
    /// Flags (the response bit is always added)
    pub flags: Option<HeaderFlags>,
    /// Message ID
    pub message_id: Option<u64>,
    /// Async ID; setting it marks the response async
    pub async_id: Option<u64>,
    /// Session ID
    pub session_id: Option<u64>,
    /// Tree ID
    pub tree_id: Option<u32>,
    /// Credits granted
    pub credit_response: Option<u16>,
}

impl ResponseHeader {
    /// Header reporting a failing status
    pub fn with_status(status: NtStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Responder output before mirroring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Header fields set by the responder
    pub header: ResponseHeader,
    /// Response body
    pub body: Body,
}

impl Reply {
    /// Successful reply with the given body
    pub fn ok(body: Body) -> Self {
        Self {
            header: ResponseHeader::default(),
            body,
        }
    }

    /// Error reply with an empty error body
    pub fn error(status: NtStatus) -> Self {
        Self {
            header: ResponseHeader::with_status(status),
            body: Body::Error(ErrorResponse::default()),
        }
    }
}

/// Build the response message for a request
///
/// Pure transform: fields the responder left unset are copied from the
/// request, the response flag is set and the signed flag cleared (the
/// signer sets it again if the session signs). The channel sequence is not
/// carried over since a response has no room for it.
pub fn mirror(request: &Header, reply: Reply) -> Message {
    let rh = reply.header;
    let mut flags = rh.flags.unwrap_or(request.flags);
    flags.insert(HeaderFlag::Response);
    flags.remove(HeaderFlag::Signed);

    let async_id = rh.async_id.unwrap_or(request.async_id);
    if rh.async_id.is_some() {
        flags.insert(HeaderFlag::AsyncCommand);
    }

    let header = Header {
        credit_charge: request.credit_charge,
        status: rh.status.unwrap_or_default(),
        // The status occupies the channel-sequence bytes in a response
        channel_sequence: 0,
        command: request.command,
        credit: rh.credit_response.unwrap_or(request.credit),
        flags,
        next_command: 0,
        message_id: rh.message_id.unwrap_or(request.message_id),
        async_id,
        tree_id: rh.tree_id.unwrap_or(request.tree_id),
        session_id: rh.session_id.unwrap_or(request.session_id),
        signature: [0; SIGNATURE_SIZE],
    };

    Message::new(header, reply.body)
}

/// Encode an error response to a message whose command code is unknown
pub fn encode_raw_error(request: &RawHeader, status: NtStatus, credit: u16, buf: &mut BytesMut) {
    let mut flags = request.flags | HeaderFlag::Response.bits();
    flags &= !HeaderFlag::Signed.bits();

    buf.put_slice(SMB2_PROTOCOL_ID);
    buf.put_u16_le(SMB2_HEADER_SIZE as u16);
    buf.put_u16_le(request.credit_charge);
    buf.put_u32_le(status.as_u32());
    buf.put_u16_le(request.command);
    buf.put_u16_le(credit);
    buf.put_u32_le(flags);
    buf.put_u32_le(0); // NextCommand
    buf.put_u64_le(request.message_id);
    if request.is_async() {
        buf.put_u64_le(request.async_id);
    } else {
        buf.put_u32_le(0);
        buf.put_u32_le(request.tree_id);
    }
    buf.put_u64_le(request.session_id);
    buf.put_slice(&[0; SIGNATURE_SIZE]);
    ErrorResponse::encode_empty(buf);
}

/// Message received by a server
#[derive(Debug)]
pub enum Packet {
    /// SMB1 multi-protocol negotiate
    Legacy(LegacyNegotiate),
    /// SMB2 message
    Current(Message),
    /// SMB2 message whose header decoded but whose command or body did not
    Undecodable {
        /// Header as read off the wire
        header: RawHeader,
        /// Why the message was rejected
        error: SmbError,
    },
}

impl Packet {
    /// Classify and parse an inbound message
    ///
    /// Fails only when not even a header can be read.
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        match ProtocolVersion::detect(buf) {
            Some(ProtocolVersion::Legacy) => LegacyNegotiate::parse(buf).map(Packet::Legacy),
            Some(ProtocolVersion::Current) => {
                let raw = RawHeader::parse(&mut &buf[..])?;
                match Message::parse(buf) {
                    Ok(message) => Ok(Packet::Current(message)),
                    Err(error) => Ok(Packet::Undecodable { header: raw, error }),
                }
            }
            None => Err(SmbError::Protocol("Unknown protocol magic".to_string())),
        }
    }

    /// Command of a current-format packet
    pub fn command(&self) -> Option<Command> {
        match self {
            Packet::Current(message) => Some(message.header.command),
            _ => None,
        }
    }
}

/// Message received by a client
#[derive(Debug)]
pub enum Response {
    /// SMB2 message
    Decoded(Message),
    /// SMB2 message whose header decoded but whose command or body did not
    ///
    /// The header still carries the message id and credits of a request
    /// the server answered.
    Undecodable {
        /// Header as read off the wire
        header: RawHeader,
        /// Why the message was rejected
        error: SmbError,
    },
}

impl Response {
    /// Parse an inbound message, keeping the header of a bad body
    ///
    /// Fails only when not even a header can be read.
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        let raw = RawHeader::parse(&mut &buf[..])?;
        match Message::parse(buf) {
            Ok(message) => Ok(Response::Decoded(message)),
            Err(error) => Ok(Response::Undecodable { header: raw, error }),
        }
    }

    /// The decoded message, or the error that stopped it decoding
    pub fn into_message(self) -> SmbResult<Message> {
        match self {
            Response::Decoded(message) => Ok(message),
            Response::Undecodable { error, .. } => Err(error),
        }
    }
}
