//! Command codes and protocol-version discriminant

use crate::error::SmbError;

/// SMB2 protocol ID
pub const SMB2_PROTOCOL_ID: &[u8; 4] = b"\xFESMB";

/// SMB1 protocol ID (for negotiation)
pub const SMB1_PROTOCOL_ID: &[u8; 4] = b"\xFFSMB";

/// Header format family, told apart by the 4-byte magic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// SMB1 header (only used for the multi-protocol negotiate)
    Legacy,
    /// SMB2/SMB3 header
    Current,
}

impl ProtocolVersion {
    /// Identify the header format from the leading bytes of a message
    pub fn detect(message: &[u8]) -> Option<Self> {
        match message.get(..4)? {
            m if m == SMB2_PROTOCOL_ID => Some(Self::Current),
            m if m == SMB1_PROTOCOL_ID => Some(Self::Legacy),
            _ => None,
        }
    }

    /// Magic bytes for this format
    pub fn magic(&self) -> &'static [u8; 4] {
        match self {
            Self::Legacy => SMB1_PROTOCOL_ID,
            Self::Current => SMB2_PROTOCOL_ID,
        }
    }
}

/// SMB2 command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Negotiate protocol version
    Negotiate = 0x0000,
    /// Session setup
    SessionSetup = 0x0001,
    /// Session logoff
    Logoff = 0x0002,
    /// Tree connect (mount share)
    TreeConnect = 0x0003,
    /// Tree disconnect
    TreeDisconnect = 0x0004,
    /// Create/Open file
    Create = 0x0005,
    /// Close file
    Close = 0x0006,
    /// Flush buffers
    Flush = 0x0007,
    /// Read data
    Read = 0x0008,
    /// Write data
    Write = 0x0009,
    /// Lock/Unlock byte ranges
    Lock = 0x000A,
    /// IOCTL
    Ioctl = 0x000B,
    /// Cancel request
    Cancel = 0x000C,
    /// Echo (keepalive)
    Echo = 0x000D,
    /// Query directory
    QueryDirectory = 0x000E,
    /// Change notify
    ChangeNotify = 0x000F,
    /// Query info
    QueryInfo = 0x0010,
    /// Set info
    SetInfo = 0x0011,
    /// Oplock break
    OplockBreak = 0x0012,
    /// Server-to-client notification
    ServerToClientNotification = 0x0013,
}

impl Command {
    /// Raw command code
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this command is part of connection/session establishment
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Negotiate | Self::SessionSetup)
    }
}

impl TryFrom<u16> for Command {
    type Error = SmbError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::Negotiate),
            0x0001 => Ok(Self::SessionSetup),
            0x0002 => Ok(Self::Logoff),
            0x0003 => Ok(Self::TreeConnect),
            0x0004 => Ok(Self::TreeDisconnect),
            0x0005 => Ok(Self::Create),
            0x0006 => Ok(Self::Close),
            0x0007 => Ok(Self::Flush),
            0x0008 => Ok(Self::Read),
            0x0009 => Ok(Self::Write),
            0x000A => Ok(Self::Lock),
            0x000B => Ok(Self::Ioctl),
            0x000C => Ok(Self::Cancel),
            0x000D => Ok(Self::Echo),
            0x000E => Ok(Self::QueryDirectory),
            0x000F => Ok(Self::ChangeNotify),
            0x0010 => Ok(Self::QueryInfo),
            0x0011 => Ok(Self::SetInfo),
            0x0012 => Ok(Self::OplockBreak),
            0x0013 => Ok(Self::ServerToClientNotification),
            other => Err(SmbError::UnknownCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        for code in 0x0000..=0x0013u16 {
            let command = Command::try_from(code).unwrap();
            assert_eq!(command.code(), code);
        }
    }

    #[test]
    fn test_unknown_command() {
        match Command::try_from(0x0014) {
            Err(SmbError::UnknownCommand(0x0014)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_protocol_detect() {
        assert_eq!(
            ProtocolVersion::detect(b"\xFESMB\x40\x00"),
            Some(ProtocolVersion::Current)
        );
        assert_eq!(
            ProtocolVersion::detect(b"\xFFSMBr"),
            Some(ProtocolVersion::Legacy)
        );
        assert_eq!(ProtocolVersion::detect(b"\xFDSMB"), None);
        assert_eq!(ProtocolVersion::detect(b"\xFE"), None);
    }
}
