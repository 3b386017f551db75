//! SMB2 and legacy SMB1 headers

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{NtStatus, SmbError, SmbResult};
use crate::flags::{Flag, FlagSet};
use crate::protocol::command::{Command, SMB1_PROTOCOL_ID, SMB2_PROTOCOL_ID};

/// SMB2 header size
pub const SMB2_HEADER_SIZE: usize = 64;

/// SMB1 header size
pub const SMB1_HEADER_SIZE: usize = 32;

/// Byte offset of the flags field inside an SMB2 header
pub const FLAGS_OFFSET: usize = 16;

/// Byte offset of the signature field inside an SMB2 header
pub const SIGNATURE_OFFSET: usize = 48;

/// Signature field length
pub const SIGNATURE_SIZE: usize = 16;

/// SMB2 header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderFlag {
    /// Response flag (server to client)
    Response,
    /// Async command
    AsyncCommand,
    /// Related operations
    RelatedOperations,
    /// Signed message
    Signed,
    /// DFS operation
    DfsOperations,
    /// Replay operation
    ReplayOperation,
}

impl Flag for HeaderFlag {
    const ALL: &'static [Self] = &[
        Self::Response,
        Self::AsyncCommand,
        Self::RelatedOperations,
        Self::Signed,
        Self::DfsOperations,
        Self::ReplayOperation,
    ];

    fn bits(self) -> u32 {
        match self {
            Self::Response => 0x0000_0001,
            Self::AsyncCommand => 0x0000_0002,
            Self::RelatedOperations => 0x0000_0004,
            Self::Signed => 0x0000_0008,
            Self::DfsOperations => 0x1000_0000,
            Self::ReplayOperation => 0x2000_0000,
        }
    }
}

/// Flags field of an SMB2 header
pub type HeaderFlags = FlagSet<HeaderFlag>;

/// SMB2 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Credit charge
    pub credit_charge: u16,
    /// Status (responses only; requests carry the channel sequence instead)
    pub status: NtStatus,
    /// Channel sequence (requests only)
    pub channel_sequence: u16,
    /// Command
    pub command: Command,
    /// Credits requested (request) or granted (response)
    pub credit: u16,
    /// Flags
    pub flags: HeaderFlags,
    /// Next command offset
    pub next_command: u32,
    /// Message ID
    pub message_id: u64,
    /// Async ID (if async)
    pub async_id: u64,
    /// Tree ID (sync only)
    pub tree_id: u32,
    /// Session ID
    pub session_id: u64,
    /// Signature
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Header {
    /// Create a new request header
    pub fn new_request(command: Command, message_id: u64, session_id: u64, tree_id: u32) -> Self {
        Self {
            credit_charge: 1,
            status: NtStatus::Success,
            channel_sequence: 0,
            command,
            credit: 1,
            flags: HeaderFlags::empty(),
            next_command: 0,
            message_id,
            async_id: 0,
            tree_id,
            session_id,
            signature: [0; SIGNATURE_SIZE],
        }
    }

    /// Check if response
    pub fn is_response(&self) -> bool {
        self.flags.contains(HeaderFlag::Response)
    }

    /// Check if async
    pub fn is_async(&self) -> bool {
        self.flags.contains(HeaderFlag::AsyncCommand)
    }

    /// Check if signed
    pub fn is_signed(&self) -> bool {
        self.flags.contains(HeaderFlag::Signed)
    }

    /// Parse header from bytes
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        let raw = RawHeader::parse(buf)?;
        let command = Command::try_from(raw.command)?;
        let flags = HeaderFlags::from_bits(raw.flags);
        let response = flags.contains(HeaderFlag::Response);

        Ok(Self {
            credit_charge: raw.credit_charge,
            status: if response {
                NtStatus::from_u32(raw.status_field)
            } else {
                NtStatus::Success
            },
            channel_sequence: if response {
                0
            } else {
                (raw.status_field & 0xFFFF) as u16
            },
            command,
            credit: raw.credit,
            flags,
            next_command: raw.next_command,
            message_id: raw.message_id,
            async_id: raw.async_id,
            tree_id: raw.tree_id,
            session_id: raw.session_id,
            signature: raw.signature,
        })
    }

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SMB2_PROTOCOL_ID);
        buf.put_u16_le(SMB2_HEADER_SIZE as u16);
        buf.put_u16_le(self.credit_charge);
        if self.is_response() {
            buf.put_u32_le(self.status.as_u32());
        } else {
            buf.put_u16_le(self.channel_sequence);
            buf.put_u16_le(0); // Reserved
        }
        buf.put_u16_le(self.command.code());
        buf.put_u16_le(self.credit);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.next_command);
        buf.put_u64_le(self.message_id);

        if self.is_async() {
            buf.put_u64_le(self.async_id);
        } else {
            buf.put_u32_le(0); // Reserved
            buf.put_u32_le(self.tree_id);
        }

        buf.put_u64_le(self.session_id);
        buf.put_slice(&self.signature);
    }
}

/// SMB2 header with the command left as its raw code
///
/// Used to answer messages whose command code is not in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    /// Credit charge
    pub credit_charge: u16,
    /// Status or channel sequence, depending on direction
    pub status_field: u32,
    /// Raw command code
    pub command: u16,
    /// Credit request/response
    pub credit: u16,
    /// Raw flags
    pub flags: u32,
    /// Next command offset
    pub next_command: u32,
    /// Message ID
    pub message_id: u64,
    /// Async ID (if async)
    pub async_id: u64,
    /// Tree ID (sync only)
    pub tree_id: u32,
    /// Session ID
    pub session_id: u64,
    /// Signature
    pub signature: [u8; SIGNATURE_SIZE],
}

impl RawHeader {
    /// Parse the fixed 64-byte layout without interpreting the command
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        if buf.len() < SMB2_HEADER_SIZE {
            return Err(SmbError::Protocol("Header too short".to_string()));
        }

        if &buf[0..4] != SMB2_PROTOCOL_ID {
            return Err(SmbError::Protocol("Invalid SMB2 protocol ID".to_string()));
        }
        buf.advance(4);

        let structure_size = buf.get_u16_le();
        if structure_size as usize != SMB2_HEADER_SIZE {
            return Err(SmbError::Protocol(format!(
                "Invalid header structure size: {structure_size}"
            )));
        }
        let credit_charge = buf.get_u16_le();
        let status_field = buf.get_u32_le();
        let command = buf.get_u16_le();
        let credit = buf.get_u16_le();
        let flags = buf.get_u32_le();
        let next_command = buf.get_u32_le();
        let message_id = buf.get_u64_le();

        let (async_id, tree_id) = if flags & HeaderFlag::AsyncCommand.bits() != 0 {
            (buf.get_u64_le(), 0)
        } else {
            let _reserved = buf.get_u32_le();
            (0, buf.get_u32_le())
        };

        let session_id = buf.get_u64_le();
        let mut signature = [0u8; SIGNATURE_SIZE];
        buf.copy_to_slice(&mut signature);

        Ok(Self {
            credit_charge,
            status_field,
            command,
            credit,
            flags,
            next_command,
            message_id,
            async_id,
            tree_id,
            session_id,
            signature,
        })
    }

    /// Check if async
    pub fn is_async(&self) -> bool {
        self.flags & HeaderFlag::AsyncCommand.bits() != 0
    }

    /// Check if response
    pub fn is_response(&self) -> bool {
        self.flags & HeaderFlag::Response.bits() != 0
    }

    /// Check if signed
    pub fn is_signed(&self) -> bool {
        self.flags & HeaderFlag::Signed.bits() != 0
    }

    /// Status of a response
    pub fn status(&self) -> NtStatus {
        NtStatus::from_u32(self.status_field)
    }
}

/// SMB1 header (32 bytes), as sent in a multi-protocol negotiate
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacyHeader {
    /// SMB1 command (0x72 for negotiate)
    pub command: u8,
    /// Status
    pub status: u32,
    /// Flags
    pub flags: u8,
    /// Flags2
    pub flags2: u16,
    /// High 16 bits of the process ID
    pub pid_high: u16,
    /// Security features
    pub security_features: [u8; 8],
    /// Tree ID
    pub tid: u16,
    /// Low 16 bits of the process ID
    pub pid_low: u16,
    /// User ID
    pub uid: u16,
    /// Multiplex ID
    pub mid: u16,
}

impl LegacyHeader {
    /// SMB_COM_NEGOTIATE
    pub const COM_NEGOTIATE: u8 = 0x72;

    /// Parse header from bytes
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        if buf.len() < SMB1_HEADER_SIZE {
            return Err(SmbError::Protocol("SMB1 header too short".to_string()));
        }
        if &buf[0..4] != SMB1_PROTOCOL_ID {
            return Err(SmbError::Protocol("Invalid SMB1 protocol ID".to_string()));
        }
        buf.advance(4);

        let command = buf.get_u8();
        let status = buf.get_u32_le();
        let flags = buf.get_u8();
        let flags2 = buf.get_u16_le();
        let pid_high = buf.get_u16_le();
        let mut security_features = [0u8; 8];
        buf.copy_to_slice(&mut security_features);
        let _reserved = buf.get_u16_le();
        let tid = buf.get_u16_le();
        let pid_low = buf.get_u16_le();
        let uid = buf.get_u16_le();
        let mid = buf.get_u16_le();

        Ok(Self {
            command,
            status,
            flags,
            flags2,
            pid_high,
            security_features,
            tid,
            pid_low,
            uid,
            mid,
        })
    }

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SMB1_PROTOCOL_ID);
        buf.put_u8(self.command);
        buf.put_u32_le(self.status);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.flags2);
        buf.put_u16_le(self.pid_high);
        buf.put_slice(&self.security_features);
        buf.put_u16_le(0); // Reserved
        buf.put_u16_le(self.tid);
        buf.put_u16_le(self.pid_low);
        buf.put_u16_le(self.uid);
        buf.put_u16_le(self.mid);
    }
}
