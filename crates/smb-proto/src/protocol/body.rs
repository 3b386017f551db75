//! Command bodies
//!
//! Only the commands the engine itself drives get a typed body. Everything
//! else is carried as [`Body::Opaque`] and left to the application layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NtStatus, SmbError, SmbResult};
use crate::flags::{Flag, FlagSet};
use crate::protocol::command::Command;
use crate::protocol::dialect::Dialect;
use crate::protocol::header::SMB2_HEADER_SIZE;
use crate::protocol::types::{FileTime, Guid};

/// Global capabilities advertised in NEGOTIATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// DFS support
    Dfs,
    /// Leasing support
    Leasing,
    /// Large MTU support (multi-credit)
    LargeMtu,
    /// Multi-channel support
    MultiChannel,
    /// Persistent handles
    PersistentHandles,
    /// Directory leasing
    DirectoryLeasing,
    /// Encryption support
    Encryption,
}

impl Flag for Capability {
    const ALL: &'static [Self] = &[
        Self::Dfs,
        Self::Leasing,
        Self::LargeMtu,
        Self::MultiChannel,
        Self::PersistentHandles,
        Self::DirectoryLeasing,
        Self::Encryption,
    ];

    fn bits(self) -> u32 {
        match self {
            Self::Dfs => 0x01,
            Self::Leasing => 0x02,
            Self::LargeMtu => 0x04,
            Self::MultiChannel => 0x08,
            Self::PersistentHandles => 0x10,
            Self::DirectoryLeasing => 0x20,
            Self::Encryption => 0x40,
        }
    }
}

/// Capability set
pub type Capabilities = FlagSet<Capability>;

/// Signing bits of the SecurityMode field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityModeFlag {
    /// Signing enabled
    SigningEnabled,
    /// Signing required
    SigningRequired,
}

impl Flag for SecurityModeFlag {
    const ALL: &'static [Self] = &[Self::SigningEnabled, Self::SigningRequired];

    fn bits(self) -> u32 {
        match self {
            Self::SigningEnabled => 0x01,
            Self::SigningRequired => 0x02,
        }
    }
}

/// SecurityMode field
pub type SecurityMode = FlagSet<SecurityModeFlag>;

/// Build the security mode for a signing policy
pub fn security_mode(signing_required: bool) -> SecurityMode {
    let mode = SecurityMode::from(SecurityModeFlag::SigningEnabled);
    if signing_required {
        mode | SecurityModeFlag::SigningRequired
    } else {
        mode
    }
}

/// SessionFlags of a SESSION_SETUP response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionFlag {
    /// Guest session
    IsGuest,
    /// Anonymous session
    IsNull,
    /// Session requires encryption
    EncryptData,
}

impl Flag for SessionFlag {
    const ALL: &'static [Self] = &[Self::IsGuest, Self::IsNull, Self::EncryptData];

    fn bits(self) -> u32 {
        match self {
            Self::IsGuest => 0x01,
            Self::IsNull => 0x02,
            Self::EncryptData => 0x04,
        }
    }
}

/// SessionFlags field
pub type SessionFlags = FlagSet<SessionFlag>;

/// Flags of a SESSION_SETUP request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionSetupFlag {
    /// Bind an existing session to a new channel
    Binding,
}

impl Flag for SessionSetupFlag {
    const ALL: &'static [Self] = &[Self::Binding];

    fn bits(self) -> u32 {
        0x01
    }
}

/// Flags field of a SESSION_SETUP request
pub type SessionSetupFlags = FlagSet<SessionSetupFlag>;

/// NEGOTIATE request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateRequest {
    /// Signing policy of the client
    pub security_mode: SecurityMode,
    /// Client capabilities
    pub capabilities: Capabilities,
    /// Client GUID
    pub client_guid: Guid,
    /// Offered dialects
    pub dialects: Vec<Dialect>,
}

impl NegotiateRequest {
    const STRUCTURE_SIZE: u16 = 36;

    fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        ensure(buf, 36, "NEGOTIATE request")?;
        check_structure_size(buf.get_u16_le(), Self::STRUCTURE_SIZE)?;
        let dialect_count = buf.get_u16_le() as usize;
        let security_mode = SecurityMode::from_bits(u32::from(buf.get_u16_le()));
        let _reserved = buf.get_u16_le();
        let capabilities = Capabilities::from_bits(buf.get_u32_le());
        let client_guid = Guid::parse(buf)?;
        // Negotiate contexts (3.1.1) are not interpreted
        let _context_offset = buf.get_u32_le();
        let _context_count = buf.get_u16_le();
        let _reserved2 = buf.get_u16_le();

        ensure(buf, dialect_count * 2, "NEGOTIATE dialect list")?;
        let dialects = (0..dialect_count)
            .map(|_| Dialect::from_code(buf.get_u16_le()))
            .collect();

        Ok(Self {
            security_mode,
            capabilities,
            client_guid,
            dialects,
        })
    }

    fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        let dialect_count = length_u16(self.dialects.len(), "NEGOTIATE dialect list")?;
        buf.put_u16_le(Self::STRUCTURE_SIZE);
        buf.put_u16_le(dialect_count);
        buf.put_u16_le(self.security_mode.bits() as u16);
        buf.put_u16_le(0); // Reserved
        buf.put_u32_le(self.capabilities.bits());
        self.client_guid.encode(buf);
        buf.put_u32_le(0); // NegotiateContextOffset
        buf.put_u16_le(0); // NegotiateContextCount
        buf.put_u16_le(0); // Reserved2
        for dialect in &self.dialects {
            buf.put_u16_le(dialect.code());
        }
        Ok(())
    }
}

/// NEGOTIATE response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    /// Signing policy of the server
    pub security_mode: SecurityMode,
    /// Selected dialect
    pub dialect: Dialect,
    /// Server GUID
    pub server_guid: Guid,
    /// Server capabilities
    pub capabilities: Capabilities,
    /// Max transaction size
    pub max_transact_size: u32,
    /// Max read size
    pub max_read_size: u32,
    /// Max write size
    pub max_write_size: u32,
    /// Current server time
    pub system_time: FileTime,
    /// Server start time
    pub server_start_time: FileTime,
    /// Initial security blob (SPNEGO)
    pub security_buffer: Bytes,
}

impl NegotiateResponse {
    const STRUCTURE_SIZE: u16 = 65;
    const FIXED_SIZE: usize = 64;

    fn parse(body: &[u8]) -> SmbResult<Self> {
        let mut buf = body;
        ensure(buf, Self::FIXED_SIZE, "NEGOTIATE response")?;
        check_structure_size(buf.get_u16_le(), Self::STRUCTURE_SIZE)?;
        let security_mode = SecurityMode::from_bits(u32::from(buf.get_u16_le()));
        let dialect = Dialect::from_code(buf.get_u16_le());
        let _context_count = buf.get_u16_le();
        let server_guid = Guid::parse(&mut buf)?;
        let capabilities = Capabilities::from_bits(buf.get_u32_le());
        let max_transact_size = buf.get_u32_le();
        let max_read_size = buf.get_u32_le();
        let max_write_size = buf.get_u32_le();
        let system_time = FileTime::new(buf.get_u64_le());
        let server_start_time = FileTime::new(buf.get_u64_le());
        let offset = buf.get_u16_le();
        let length = buf.get_u16_le();
        let _context_offset = buf.get_u32_le();

        Ok(Self {
            security_mode,
            dialect,
            server_guid,
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_buffer: security_buffer(body, offset, length)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        let length = length_u16(self.security_buffer.len(), "NEGOTIATE security buffer")?;
        buf.put_u16_le(Self::STRUCTURE_SIZE);
        buf.put_u16_le(self.security_mode.bits() as u16);
        buf.put_u16_le(self.dialect.code());
        buf.put_u16_le(0); // NegotiateContextCount
        self.server_guid.encode(buf);
        buf.put_u32_le(self.capabilities.bits());
        buf.put_u32_le(self.max_transact_size);
        buf.put_u32_le(self.max_read_size);
        buf.put_u32_le(self.max_write_size);
        buf.put_u64_le(self.system_time.ticks());
        buf.put_u64_le(self.server_start_time.ticks());
        buf.put_u16_le((SMB2_HEADER_SIZE + Self::FIXED_SIZE) as u16);
        buf.put_u16_le(length);
        buf.put_u32_le(0); // NegotiateContextOffset
        buf.put_slice(&self.security_buffer);
        Ok(())
    }
}

/// SESSION_SETUP request body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSetupRequest {
    /// Request flags
    pub flags: SessionSetupFlags,
    /// Signing policy of the client
    pub security_mode: SecurityMode,
    /// Client capabilities
    pub capabilities: Capabilities,
    /// Previous session to reconnect
    pub previous_session_id: u64,
    /// SPNEGO token
    pub security_buffer: Bytes,
}

impl SessionSetupRequest {
    const STRUCTURE_SIZE: u16 = 25;
    const FIXED_SIZE: usize = 24;

    fn parse(body: &[u8]) -> SmbResult<Self> {
        let mut buf = body;
        ensure(buf, Self::FIXED_SIZE, "SESSION_SETUP request")?;
        check_structure_size(buf.get_u16_le(), Self::STRUCTURE_SIZE)?;
        let flags = SessionSetupFlags::from_bits(u32::from(buf.get_u8()));
        let security_mode = SecurityMode::from_bits(u32::from(buf.get_u8()));
        let capabilities = Capabilities::from_bits(buf.get_u32_le());
        let _channel = buf.get_u32_le();
        let offset = buf.get_u16_le();
        let length = buf.get_u16_le();
        let previous_session_id = buf.get_u64_le();

        Ok(Self {
            flags,
            security_mode,
            capabilities,
            previous_session_id,
            security_buffer: security_buffer(body, offset, length)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        let length = length_u16(self.security_buffer.len(), "SESSION_SETUP security buffer")?;
        buf.put_u16_le(Self::STRUCTURE_SIZE);
        buf.put_u8(self.flags.bits() as u8);
        buf.put_u8(self.security_mode.bits() as u8);
        buf.put_u32_le(self.capabilities.bits());
        buf.put_u32_le(0); // Channel
        buf.put_u16_le((SMB2_HEADER_SIZE + Self::FIXED_SIZE) as u16);
        buf.put_u16_le(length);
        buf.put_u64_le(self.previous_session_id);
        buf.put_slice(&self.security_buffer);
        Ok(())
    }
}

/// SESSION_SETUP response body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSetupResponse {
    /// Session flags
    pub session_flags: SessionFlags,
    /// SPNEGO token
    pub security_buffer: Bytes,
}

impl SessionSetupResponse {
    const STRUCTURE_SIZE: u16 = 9;
    const FIXED_SIZE: usize = 8;

    fn parse(body: &[u8]) -> SmbResult<Self> {
        let mut buf = body;
        ensure(buf, Self::FIXED_SIZE, "SESSION_SETUP response")?;
        check_structure_size(buf.get_u16_le(), Self::STRUCTURE_SIZE)?;
        let session_flags = SessionFlags::from_bits(u32::from(buf.get_u16_le()));
        let offset = buf.get_u16_le();
        let length = buf.get_u16_le();

        Ok(Self {
            session_flags,
            security_buffer: security_buffer(body, offset, length)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        let length = length_u16(self.security_buffer.len(), "SESSION_SETUP security buffer")?;
        buf.put_u16_le(Self::STRUCTURE_SIZE);
        buf.put_u16_le(self.session_flags.bits() as u16);
        buf.put_u16_le((SMB2_HEADER_SIZE + Self::FIXED_SIZE) as u16);
        buf.put_u16_le(length);
        buf.put_slice(&self.security_buffer);
        Ok(())
    }
}

/// Error response body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorResponse {
    /// Number of error contexts (3.1.1)
    pub context_count: u8,
    /// Error data
    pub data: Bytes,
}

impl ErrorResponse {
    const STRUCTURE_SIZE: u16 = 9;

    fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        ensure(buf, 8, "error response")?;
        check_structure_size(buf.get_u16_le(), Self::STRUCTURE_SIZE)?;
        let context_count = buf.get_u8();
        let _reserved = buf.get_u8();
        let byte_count = buf.get_u32_le() as usize;
        ensure(buf, byte_count, "error data")?;
        let data = Bytes::copy_from_slice(&buf[..byte_count]);
        buf.advance(buf.len());

        Ok(Self {
            context_count,
            data,
        })
    }

    fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        let byte_count = u32::try_from(self.data.len()).map_err(|_| {
            SmbError::Protocol(format!("Error data too long: {} bytes", self.data.len()))
        })?;
        buf.put_u16_le(Self::STRUCTURE_SIZE);
        buf.put_u8(self.context_count);
        buf.put_u8(0); // Reserved
        buf.put_u32_le(byte_count);
        if self.data.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_slice(&self.data);
        }
        Ok(())
    }

    /// Encode the body of a plain error response
    pub(crate) fn encode_empty(buf: &mut BytesMut) {
        buf.put_u16_le(Self::STRUCTURE_SIZE);
        buf.put_u8(0); // ErrorContextCount
        buf.put_u8(0); // Reserved
        buf.put_u32_le(0); // ByteCount
        buf.put_u8(0);
    }
}

/// Command-specific message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// NEGOTIATE request
    NegotiateRequest(NegotiateRequest),
    /// NEGOTIATE response
    NegotiateResponse(NegotiateResponse),
    /// SESSION_SETUP request
    SessionSetupRequest(SessionSetupRequest),
    /// SESSION_SETUP response
    SessionSetupResponse(SessionSetupResponse),
    /// Four-byte body of LOGOFF, ECHO and CANCEL
    Empty,
    /// Error response
    Error(ErrorResponse),
    /// Body of a command the engine does not interpret
    Opaque(Bytes),
}

impl Body {
    /// Whether a response with this status carries the error body
    pub fn is_error_body(command: Command, status: NtStatus) -> bool {
        match status {
            NtStatus::Pending => true,
            NtStatus::MoreProcessingRequired if command == Command::SessionSetup => false,
            s => s.is_error(),
        }
    }

    /// Decode the bytes following the header
    pub fn decode(
        command: Command,
        is_response: bool,
        status: NtStatus,
        buf: &mut &[u8],
    ) -> SmbResult<Self> {
        if is_response && Self::is_error_body(command, status) {
            return ErrorResponse::parse(buf).map(Body::Error);
        }

        let body = *buf;
        let decoded = match (command, is_response) {
            (Command::Negotiate, false) => {
                Body::NegotiateRequest(NegotiateRequest::parse(&mut &body[..])?)
            }
            (Command::Negotiate, true) => Body::NegotiateResponse(NegotiateResponse::parse(body)?),
            (Command::SessionSetup, false) => {
                Body::SessionSetupRequest(SessionSetupRequest::parse(body)?)
            }
            (Command::SessionSetup, true) => {
                Body::SessionSetupResponse(SessionSetupResponse::parse(body)?)
            }
            (Command::Logoff | Command::Echo | Command::Cancel, _) => {
                let mut fixed = body;
                ensure(fixed, 4, "empty body")?;
                check_structure_size(fixed.get_u16_le(), 4)?;
                Body::Empty
            }
            _ => Body::Opaque(Bytes::copy_from_slice(body)),
        };
        buf.advance(buf.len());
        Ok(decoded)
    }

    /// Encode to bytes
    ///
    /// Fails when a variable-length field outgrows its length field.
    pub fn encode(&self, buf: &mut BytesMut) -> SmbResult<()> {
        match self {
            Body::NegotiateRequest(b) => b.encode(buf),
            Body::NegotiateResponse(b) => b.encode(buf),
            Body::SessionSetupRequest(b) => b.encode(buf),
            Body::SessionSetupResponse(b) => b.encode(buf),
            Body::Empty => {
                buf.put_u16_le(4);
                buf.put_u16_le(0); // Reserved
                Ok(())
            }
            Body::Error(b) => b.encode(buf),
            Body::Opaque(bytes) => {
                buf.put_slice(bytes);
                Ok(())
            }
        }
    }

    /// Security blob carried by a handshake body
    pub fn security_buffer(&self) -> Option<&Bytes> {
        match self {
            Body::NegotiateResponse(b) => Some(&b.security_buffer),
            Body::SessionSetupRequest(b) => Some(&b.security_buffer),
            Body::SessionSetupResponse(b) => Some(&b.security_buffer),
            _ => None,
        }
    }
}

fn length_u16(len: usize, what: &str) -> SmbResult<u16> {
    u16::try_from(len)
        .map_err(|_| SmbError::Protocol(format!("{what} exceeds its 16-bit length field: {len}")))
}

fn ensure(buf: &[u8], needed: usize, what: &str) -> SmbResult<()> {
    if buf.len() < needed {
        return Err(SmbError::Protocol(format!(
            "{what} truncated: need {needed} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}

fn check_structure_size(found: u16, expected: u16) -> SmbResult<()> {
    if found != expected {
        return Err(SmbError::Protocol(format!(
            "Invalid structure size: expected {expected}, found {found}"
        )));
    }
    Ok(())
}

/// Slice a security buffer whose offset is relative to the header start
fn security_buffer(body: &[u8], offset: u16, length: u16) -> SmbResult<Bytes> {
    if length == 0 {
        return Ok(Bytes::new());
    }
    let start = (offset as usize)
        .checked_sub(SMB2_HEADER_SIZE)
        .ok_or_else(|| SmbError::Protocol(format!("Security buffer offset {offset} in header")))?;
    let end = start + length as usize;
    if end > body.len() {
        return Err(SmbError::Protocol(format!(
            "Security buffer {start}..{end} exceeds body of {} bytes",
            body.len()
        )));
    }
    Ok(Bytes::copy_from_slice(&body[start..end]))
}
