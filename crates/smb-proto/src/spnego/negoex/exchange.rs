//! NEGOEX as a SPNEGO mechanism driving one auth scheme

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tracing::debug;

use super::{Checksum, MessageType, Nego, NegoexBody, NegoexMessage, CHECKSUM_SCHEME_RFC3961};
use crate::error::{SmbError, SmbResult};
use crate::protocol::Guid;
use crate::spnego::context::{MechStep, Mechanism};
use crate::spnego::der::Oid;

/// Key usage for checksums made by the initiator
pub const KEY_USAGE_INITIATOR_CHECKSUM: u32 = 23;

/// Key usage for checksums made by the acceptor
pub const KEY_USAGE_ACCEPTOR_CHECKSUM: u32 = 25;

/// Security mechanism negotiated inside NEGOEX
pub trait AuthScheme: Send {
    /// Scheme identifier
    fn scheme_id(&self) -> Guid;

    /// RFC 3961 checksum type of [`checksum`](Self::checksum)
    fn checksum_type(&self) -> u32;

    /// Consume the peer's exchange payload (none on the initiator's first leg)
    fn step(&mut self, input: Option<&[u8]>) -> SmbResult<MechStep>;

    /// Exported session key once complete
    fn session_key(&self) -> Option<Vec<u8>>;

    /// Keyed checksum over the conversation transcript
    fn checksum(&self, key_usage: u32, data: &[u8]) -> SmbResult<Vec<u8>>;

    /// Check a checksum made by the peer
    fn verify_checksum(&self, key_usage: u32, data: &[u8], checksum: &[u8]) -> SmbResult<()>;
}

/// Side of the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client
    Initiator,
    /// Server
    Acceptor,
}

impl Role {
    fn own_usage(self) -> u32 {
        match self {
            Role::Initiator => KEY_USAGE_INITIATOR_CHECKSUM,
            Role::Acceptor => KEY_USAGE_ACCEPTOR_CHECKSUM,
        }
    }

    fn peer_usage(self) -> u32 {
        match self {
            Role::Initiator => KEY_USAGE_ACCEPTOR_CHECKSUM,
            Role::Acceptor => KEY_USAGE_INITIATOR_CHECKSUM,
        }
    }
}

/// NEGOEX mechanism
///
/// Every non-VERIFY message sent or received is appended to the transcript
/// that both VERIFY checksums cover.
pub struct NegoexMechanism {
    role: Role,
    scheme: Box<dyn AuthScheme>,
    conversation_id: Guid,
    next_sequence: u32,
    transcript: Vec<u8>,
    scheme_complete: bool,
    verify_sent: bool,
    peer_verified: bool,
}

impl NegoexMechanism {
    /// Create for one side of the conversation
    pub fn new(role: Role, scheme: Box<dyn AuthScheme>) -> Self {
        Self {
            role,
            scheme,
            conversation_id: Guid::NIL,
            next_sequence: 0,
            transcript: Vec::new(),
            scheme_complete: false,
            verify_sent: false,
            peer_verified: false,
        }
    }

    /// Conversation ID (set by the initiator's first message)
    pub fn conversation_id(&self) -> Guid {
        self.conversation_id
    }

    fn is_complete(&self) -> bool {
        self.scheme_complete && self.verify_sent && self.peer_verified
    }

    fn push(&mut self, out: &mut BytesMut, message_type: MessageType, body: NegoexBody) -> SmbResult<()> {
        let message = NegoexMessage {
            message_type,
            sequence_num: self.next_sequence,
            conversation_id: self.conversation_id,
            body,
        };
        self.next_sequence += 1;
        let start = out.len();
        message.encode(out)?;
        if message_type != MessageType::Verify {
            self.transcript.extend_from_slice(&out[start..]);
        }
        Ok(())
    }

    fn push_nego(&mut self, out: &mut BytesMut, message_type: MessageType) -> SmbResult<()> {
        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);
        let nego = Nego {
            random,
            protocol_version: 0,
            auth_schemes: vec![self.scheme.scheme_id()],
            extensions: Vec::new(),
        };
        self.push(out, message_type, NegoexBody::Nego(nego))
    }

    fn push_exchange(&mut self, out: &mut BytesMut, message_type: MessageType, payload: Vec<u8>) -> SmbResult<()> {
        let auth_scheme = self.scheme.scheme_id();
        self.push(
            out,
            message_type,
            NegoexBody::Exchange {
                auth_scheme,
                exchange: Bytes::from(payload),
            },
        )
    }

    fn push_verify(&mut self, out: &mut BytesMut) -> SmbResult<()> {
        let value = self.scheme.checksum(self.role.own_usage(), &self.transcript)?;
        let body = NegoexBody::Verify {
            auth_scheme: self.scheme.scheme_id(),
            checksum: Checksum {
                scheme: CHECKSUM_SCHEME_RFC3961,
                checksum_type: self.scheme.checksum_type(),
                value: Bytes::from(value),
            },
        };
        self.push(out, MessageType::Verify, body)?;
        self.verify_sent = true;
        Ok(())
    }

    /// Run the scheme and queue its output
    fn advance_scheme(&mut self, input: Option<&[u8]>, out: &mut BytesMut) -> SmbResult<()> {
        let token_type = match self.role {
            Role::Initiator => MessageType::ApRequest,
            Role::Acceptor => MessageType::Challenge,
        };
        match self.scheme.step(input)? {
            MechStep::Continue(token) => self.push_exchange(out, token_type, token),
            MechStep::Complete(token) => {
                self.scheme_complete = true;
                if let Some(token) = token {
                    self.push_exchange(out, token_type, token)?;
                }
                Ok(())
            }
        }
    }

    /// Absorb every message of an inbound token
    ///
    /// Returns the payload of the last exchange message addressed to the
    /// scheme, if any.
    fn absorb(&mut self, input: &[u8]) -> SmbResult<Option<Vec<u8>>> {
        let mut payload = None;
        for (message, raw) in NegoexMessage::parse_all(input)? {
            if message.sequence_num != self.next_sequence {
                return Err(SmbError::Protocol(format!(
                    "NEGOEX sequence {} out of order, expected {}",
                    message.sequence_num, self.next_sequence
                )));
            }
            self.next_sequence += 1;

            match (self.role, message.message_type) {
                (Role::Acceptor, MessageType::InitiatorNego) => {
                    self.conversation_id = message.conversation_id;
                }
                _ if message.conversation_id != self.conversation_id => {
                    return Err(SmbError::Protocol(
                        "NEGOEX conversation ID changed".to_string(),
                    ));
                }
                _ => {}
            }

            match message.body {
                NegoexBody::Nego(nego) => {
                    if !nego.auth_schemes.contains(&self.scheme.scheme_id()) {
                        return Err(SmbError::AuthFailed(format!(
                            "Peer offered no usable NEGOEX scheme: {:?}",
                            nego.auth_schemes
                        )));
                    }
                }
                NegoexBody::Exchange {
                    auth_scheme,
                    exchange,
                } => {
                    if auth_scheme == self.scheme.scheme_id()
                        && matches!(
                            message.message_type,
                            MessageType::ApRequest | MessageType::Challenge
                        )
                    {
                        payload = Some(exchange.to_vec());
                    }
                }
                NegoexBody::Verify { checksum, .. } => {
                    self.scheme.verify_checksum(
                        self.role.peer_usage(),
                        &self.transcript,
                        &checksum.value,
                    )?;
                    self.peer_verified = true;
                    debug!(role = ?self.role, "NEGOEX peer checksum verified");
                    continue;
                }
                NegoexBody::Alert { error_code, .. } => {
                    debug!(error_code, "NEGOEX alert");
                }
            }
            self.transcript.extend_from_slice(raw);
        }
        Ok(payload)
    }
}

impl Mechanism for NegoexMechanism {
    fn oid(&self) -> Oid {
        Oid::NEGOEX
    }

    fn step(&mut self, input: Option<&[u8]>) -> SmbResult<MechStep> {
        let mut out = BytesMut::new();

        match (self.role, input) {
            (Role::Initiator, None) => {
                self.conversation_id = Guid::random();
                self.push_nego(&mut out, MessageType::InitiatorNego)?;
                self.advance_scheme(None, &mut out)?;
            }
            (Role::Acceptor, None) => {
                return Err(SmbError::Protocol(
                    "NEGOEX acceptor needs an initiator token".to_string(),
                ))
            }
            (role, Some(input)) => {
                let first_leg = role == Role::Acceptor && self.next_sequence == 0;
                let payload = self.absorb(input)?;
                if first_leg {
                    self.push_nego(&mut out, MessageType::AcceptorNego)?;
                }
                if let Some(payload) = payload {
                    if self.scheme_complete {
                        return Err(SmbError::Protocol(
                            "NEGOEX exchange after scheme completion".to_string(),
                        ));
                    }
                    self.advance_scheme(Some(&payload), &mut out)?;
                }
            }
        }

        if self.scheme_complete && !self.verify_sent {
            self.push_verify(&mut out)?;
        }

        let token = (!out.is_empty()).then(|| out.to_vec());
        if self.is_complete() {
            debug!(role = ?self.role, "NEGOEX complete");
            Ok(MechStep::Complete(token))
        } else {
            token.map(MechStep::Continue).ok_or_else(|| {
                SmbError::Protocol("NEGOEX stalled with nothing to send".to_string())
            })
        }
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        if self.is_complete() {
            self.scheme.session_key()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for NegoexMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegoexMechanism")
            .field("role", &self.role)
            .field("conversation_id", &self.conversation_id)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}
