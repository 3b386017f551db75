//! SMB2/SMB3 protocol model
//!
//! Headers, command bodies and whole messages, plus the scalar wire types and
//! dialect negotiation they depend on.

pub mod body;
pub mod command;
pub mod dialect;
pub mod header;
pub mod legacy;
pub mod message;
pub mod types;

pub use body::{
    security_mode, Body, Capabilities, Capability, ErrorResponse, NegotiateRequest,
    NegotiateResponse, SecurityMode, SecurityModeFlag, SessionFlag, SessionFlags,
    SessionSetupFlag, SessionSetupFlags, SessionSetupRequest, SessionSetupResponse,
};
pub use command::{Command, ProtocolVersion, SMB1_PROTOCOL_ID, SMB2_PROTOCOL_ID};
pub use dialect::{negotiate_dialect, Dialect, DialectRange};
pub use header::{
    Header, HeaderFlag, HeaderFlags, LegacyHeader, RawHeader, FLAGS_OFFSET, SIGNATURE_OFFSET,
    SIGNATURE_SIZE, SMB1_HEADER_SIZE, SMB2_HEADER_SIZE,
};
pub use legacy::{LegacyNegotiate, DIALECT_SMB2_002, DIALECT_SMB2_WILDCARD};
pub use message::{encode_raw_error, mirror, Message, Packet, Reply, Response, ResponseHeader};
pub use types::{FileTime, Guid};
