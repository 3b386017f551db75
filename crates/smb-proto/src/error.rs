//! SMB error types
//!
//! Defines the engine error type and the NTSTATUS codes carried in SMB2 headers.

use std::io;

use thiserror::Error;

/// SMB-specific result type
pub type SmbResult<T> = Result<T, SmbError>;

/// SMB error types
#[derive(Debug, Error)]
pub enum SmbError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Outer transport frame is malformed; the connection must be torn down
    #[error("Framing error: {0}")]
    Framing(String),

    /// Message could not be parsed or violates the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command code outside the known command table
    #[error("Unknown command code: 0x{0:04X}")]
    UnknownCommand(u16),

    /// Peer answered with a failing NTSTATUS
    #[error("NTSTATUS: {0}")]
    NtStatus(NtStatus),

    /// Signature missing or wrong on a message that must be signed
    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// Dialect or security negotiation failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Authentication mechanism rejected the exchange
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Request abandoned after its deadline passed
    #[error("Request timed out")]
    Timeout,

    /// Connection closed before the operation finished
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<NtStatus> for SmbError {
    fn from(status: NtStatus) -> Self {
        SmbError::NtStatus(status)
    }
}

impl SmbError {
    /// NTSTATUS to report to the peer when this error fails a request
    pub fn status(&self) -> NtStatus {
        match self {
            SmbError::NtStatus(s) => *s,
            SmbError::UnknownCommand(_) => NtStatus::InvalidParameter,
            SmbError::Signature(_) => NtStatus::AccessDenied,
            SmbError::AuthFailed(_) | SmbError::Negotiation(_) => NtStatus::LogonFailure,
            SmbError::NotSupported(_) => NtStatus::NotSupported,
            SmbError::Timeout => NtStatus::IoTimeout,
            SmbError::Protocol(_) | SmbError::Framing(_) => NtStatus::InvalidParameter,
            SmbError::Io(_) | SmbError::ConnectionClosed => NtStatus::InsufficientResources,
        }
    }

    /// Whether the connection can no longer be used after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmbError::Io(_) | SmbError::Framing(_) | SmbError::ConnectionClosed
        )
    }
}

/// NT Status codes (subset used by the SMB2 engine)
///
/// Codes outside the table are preserved as [`NtStatus::Other`] so that a
/// decoded header re-encodes to the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NtStatus {
    /// Success
    #[default]
    Success,
    /// Pending (interim response to an async operation)
    Pending,
    /// Buffer overflow (warning, not error)
    BufferOverflow,
    /// Invalid handle
    InvalidHandle,
    /// Invalid parameter
    InvalidParameter,
    /// More processing required (session setup continues)
    MoreProcessingRequired,
    /// Access denied
    AccessDenied,
    /// Logon failure
    LogonFailure,
    /// Insufficient resources
    InsufficientResources,
    /// Not supported
    NotSupported,
    /// Network name deleted
    NetworkNameDeleted,
    /// Request not accepted
    RequestNotAccepted,
    /// IO timeout
    IoTimeout,
    /// Cancelled
    Cancelled,
    /// User session deleted
    UserSessionDeleted,
    /// Network session expired
    NetworkSessionExpired,
    /// SMB bad command
    SmbBadCommand,
    /// Any other status value
    Other(u32),
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(&self) -> bool {
        self.as_u32() < 0x4000_0000
    }

    /// Check if this is a warning (informational)
    pub fn is_warning(&self) -> bool {
        let val = self.as_u32();
        (0x8000_0000..0xC000_0000).contains(&val)
    }

    /// Check if this is an error
    pub fn is_error(&self) -> bool {
        self.as_u32() >= 0xC000_0000
    }

    /// Get the raw value
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Success => 0x0000_0000,
            Self::Pending => 0x0000_0103,
            Self::BufferOverflow => 0x8000_0005,
            Self::InvalidHandle => 0xC000_0008,
            Self::InvalidParameter => 0xC000_000D,
            Self::MoreProcessingRequired => 0xC000_0016,
            Self::AccessDenied => 0xC000_0022,
            Self::LogonFailure => 0xC000_006D,
            Self::InsufficientResources => 0xC000_009A,
            Self::NotSupported => 0xC000_00BB,
            Self::NetworkNameDeleted => 0xC000_00C9,
            Self::RequestNotAccepted => 0xC000_00D0,
            Self::IoTimeout => 0xC000_00B5,
            Self::Cancelled => 0xC000_0120,
            Self::UserSessionDeleted => 0xC000_0203,
            Self::NetworkSessionExpired => 0xC000_035C,
            Self::SmbBadCommand => 0x0016_0002,
            Self::Other(val) => *val,
        }
    }

    /// Create from raw value
    pub fn from_u32(val: u32) -> Self {
        match val {
            0x0000_0000 => Self::Success,
            0x0000_0103 => Self::Pending,
            0x8000_0005 => Self::BufferOverflow,
            0xC000_0008 => Self::InvalidHandle,
            0xC000_000D => Self::InvalidParameter,
            0xC000_0016 => Self::MoreProcessingRequired,
            0xC000_0022 => Self::AccessDenied,
            0xC000_006D => Self::LogonFailure,
            0xC000_009A => Self::InsufficientResources,
            0xC000_00BB => Self::NotSupported,
            0xC000_00C9 => Self::NetworkNameDeleted,
            0xC000_00D0 => Self::RequestNotAccepted,
            0xC000_00B5 => Self::IoTimeout,
            0xC000_0120 => Self::Cancelled,
            0xC000_0203 => Self::UserSessionDeleted,
            0xC000_035C => Self::NetworkSessionExpired,
            0x0016_0002 => Self::SmbBadCommand,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, self.as_u32())
    }
}
