//! SMB2/SMB3 wire engine
//!
//! Protocol model, transport framing, credit accounting, packet signing and
//! SPNEGO negotiation for SMB2/SMB3 connections. Everything here is
//! synchronous and transport-agnostic; the tokio connection drivers live in
//! `smb-conn`.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ spnego  (session-setup blob) │
//! ├──────────────────────────────┤
//! │ protocol (header + bodies)   │
//! ├──────────────┬───────────────┤
//! │ signing      │ window        │
//! ├──────────────┴───────────────┤
//! │ framing (0x00 + u24 length)  │
//! └──────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod flags;
pub mod framing;
pub mod protocol;
pub mod signing;
pub mod spnego;
pub mod window;

pub use error::{NtStatus, SmbError, SmbResult};
pub use framing::{ClientCodec, Codec, Decoded, ServerCodec};
pub use protocol::{
    Body, Command, Dialect, DialectRange, Guid, Header, Message, Packet, Reply, Response,
};
pub use signing::{PacketSigner, SessionDetails, SigningAlgorithm};
pub use window::{CreditPolicy, SequenceWindow};
