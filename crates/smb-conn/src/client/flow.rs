//! Client handshake: NEGOTIATE then SESSION_SETUP legs until SPNEGO settles
//!
//! The flow is a plain state machine. It never touches the transport; the
//! connection driver feeds it handshake responses and sends whatever it
//! returns.

use bytes::Bytes;
use smb_proto::protocol::{
    security_mode, Body, Capabilities, Command, Dialect, DialectRange, Guid, Message,
    NegotiateRequest, SecurityModeFlag, SessionFlag, SessionFlags, SessionSetupRequest,
};
use smb_proto::signing::{SessionDetails, SigningAlgorithm};
use smb_proto::spnego::{Mechanism, SecurityStatus, SpnegoInitiator};
use smb_proto::{NtStatus, SmbError, SmbResult};
use tracing::debug;

use crate::config::ClientConfig;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Nothing sent yet
    NotStarted,
    /// NEGOTIATE in flight
    NegotiateSent,
    /// SESSION_SETUP legs in flight
    AwaitingSessionSetup,
    /// Session established
    Complete,
    /// Handshake failed
    Failed,
}

/// Request the flow wants sent; the driver assigns the message id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// NEGOTIATE or SESSION_SETUP
    pub command: Command,
    /// Session the request belongs to (0 before the server assigns one)
    pub session_id: u64,
    /// Request body
    pub body: Body,
}

/// Parameters of an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    /// Negotiated dialect
    pub dialect: Dialect,
    /// GUID the server reported
    pub server_guid: Guid,
    /// Session ID assigned by the server
    pub session_id: u64,
    /// Whether every message on the session must be signed
    pub signing_required: bool,
    /// Server capabilities
    pub capabilities: Capabilities,
    /// Session flags from the final SESSION_SETUP response
    pub session_flags: SessionFlags,
    /// Max transaction size
    pub max_transact_size: u32,
    /// Max read size
    pub max_read_size: u32,
    /// Max write size
    pub max_write_size: u32,
}

impl NegotiatedSession {
    /// Guest and anonymous sessions are never signed
    pub fn is_guest_or_null(&self) -> bool {
        self.session_flags.contains(SessionFlag::IsGuest)
            || self.session_flags.contains(SessionFlag::IsNull)
    }
}

/// What the driver should do after a handshake response
#[derive(Debug)]
pub enum FlowAction {
    /// Send the next handshake request
    Send(HandshakeRequest),
    /// Handshake complete; keys are absent for guest or anonymous sessions
    Established(NegotiatedSession, Option<SessionDetails>),
    /// Handshake failed
    Failed(SmbError),
}

struct ServerOffer {
    dialect: Dialect,
    server_guid: Guid,
    capabilities: Capabilities,
    max_transact_size: u32,
    max_read_size: u32,
    max_write_size: u32,
}

/// Client negotiation state machine
pub struct NegotiationFlow {
    state: FlowState,
    range: DialectRange,
    client_guid: Guid,
    capabilities: Capabilities,
    client_signing_required: bool,
    signing_required: bool,
    spnego: SpnegoInitiator,
    spnego_done: bool,
    offer: Option<ServerOffer>,
    session_id: u64,
}

impl NegotiationFlow {
    /// Create a flow over the client's mechanisms, in preference order
    pub fn new(config: &ClientConfig, mechs: Vec<Box<dyn Mechanism>>) -> SmbResult<Self> {
        let range = config
            .dialect_range()
            .map_err(|e| SmbError::Negotiation(e.to_string()))?;
        Ok(Self {
            state: FlowState::NotStarted,
            range,
            client_guid: config.client_guid,
            capabilities: config.capability_set(),
            client_signing_required: config.signing_required,
            signing_required: config.signing_required,
            spnego: SpnegoInitiator::new(mechs)?,
            spnego_done: false,
            offer: None,
            session_id: 0,
        })
    }

    /// Current state
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Dialect chosen by the server, once known
    pub fn dialect(&self) -> Option<Dialect> {
        self.offer.as_ref().map(|o| o.dialect)
    }

    /// Build the NEGOTIATE request
    pub fn start(&mut self) -> HandshakeRequest {
        self.state = FlowState::NegotiateSent;
        debug!(dialects = ?self.range.dialects(), "Sending NEGOTIATE");
        HandshakeRequest {
            command: Command::Negotiate,
            session_id: 0,
            body: Body::NegotiateRequest(NegotiateRequest {
                security_mode: security_mode(self.client_signing_required),
                capabilities: self.capabilities,
                client_guid: self.client_guid,
                dialects: self.range.dialects(),
            }),
        }
    }

    /// Advance on a handshake response
    pub fn on_response(&mut self, response: &Message) -> FlowAction {
        let result = match (self.state, response.header.command) {
            (FlowState::NegotiateSent, Command::Negotiate) => self.on_negotiate(response),
            (FlowState::AwaitingSessionSetup, Command::SessionSetup) => {
                self.on_session_setup(response)
            }
            (state, command) => Err(SmbError::Protocol(format!(
                "Unexpected {command:?} response in state {state:?}"
            ))),
        };
        match result {
            Ok(action) => action,
            Err(e) => {
                debug!(error = %e, "Handshake failed");
                self.state = FlowState::Failed;
                FlowAction::Failed(e)
            }
        }
    }

    fn on_negotiate(&mut self, response: &Message) -> SmbResult<FlowAction> {
        let status = response.status();
        if !status.is_success() {
            return Err(SmbError::Negotiation(format!("NEGOTIATE failed: {status}")));
        }
        let Body::NegotiateResponse(body) = &response.body else {
            return Err(SmbError::Protocol(
                "NEGOTIATE response without a negotiate body".to_string(),
            ));
        };
        if !self.range.contains(body.dialect) {
            return Err(SmbError::Negotiation(format!(
                "Server selected {} outside {}..{}",
                body.dialect, self.range.min, self.range.max
            )));
        }

        self.signing_required |= body
            .security_mode
            .contains(SecurityModeFlag::SigningRequired);
        if self.signing_required {
            SigningAlgorithm::for_dialect(body.dialect)?;
        }

        let hint = Some(&body.security_buffer[..]).filter(|h| !h.is_empty());
        let token = self.spnego.initial_token(hint)?;
        debug!(
            dialect = %body.dialect,
            server_guid = %body.server_guid,
            signing_required = self.signing_required,
            "NEGOTIATE complete"
        );

        self.offer = Some(ServerOffer {
            dialect: body.dialect,
            server_guid: body.server_guid,
            capabilities: body.capabilities,
            max_transact_size: body.max_transact_size,
            max_read_size: body.max_read_size,
            max_write_size: body.max_write_size,
        });
        self.state = FlowState::AwaitingSessionSetup;
        Ok(FlowAction::Send(self.session_setup(token)))
    }

    fn on_session_setup(&mut self, response: &Message) -> SmbResult<FlowAction> {
        let status = response.status();
        let more = match status {
            NtStatus::MoreProcessingRequired => true,
            NtStatus::Success => false,
            other => {
                return Err(SmbError::Negotiation(format!(
                    "SESSION_SETUP failed: {other}"
                )))
            }
        };
        let Body::SessionSetupResponse(body) = &response.body else {
            return Err(SmbError::Protocol(
                "SESSION_SETUP response without a session setup body".to_string(),
            ));
        };
        self.session_id = response.header.session_id;

        if !self.spnego_done {
            let blob = &body.security_buffer;
            if blob.is_empty() {
                return Err(SmbError::Negotiation(
                    "Server ended the security exchange without a token".to_string(),
                ));
            }
            match self.spnego.step(blob)? {
                SecurityStatus::Continue(token) if more => {
                    debug!(session_id = self.session_id, "SESSION_SETUP continues");
                    return Ok(FlowAction::Send(self.session_setup(token)));
                }
                SecurityStatus::Continue(_) => {
                    return Err(SmbError::Negotiation(
                        "Server completed the session while SPNEGO continues".to_string(),
                    ));
                }
                SecurityStatus::Accept(token) => {
                    self.spnego_done = true;
                    if more {
                        let token = token.ok_or_else(|| {
                            SmbError::Protocol(
                                "Server wants more after SPNEGO accepted".to_string(),
                            )
                        })?;
                        return Ok(FlowAction::Send(self.session_setup(token)));
                    }
                }
                SecurityStatus::Reject => {
                    return Err(SmbError::Negotiation(
                        "Authentication rejected by the server".to_string(),
                    ));
                }
            }
        } else if more {
            return Err(SmbError::Protocol(
                "Server wants more after SPNEGO accepted".to_string(),
            ));
        }

        self.establish(body.session_flags)
    }

    fn establish(&mut self, session_flags: SessionFlags) -> SmbResult<FlowAction> {
        let offer = self
            .offer
            .as_ref()
            .ok_or_else(|| SmbError::Protocol("Session without a negotiated dialect".to_string()))?;
        let session = NegotiatedSession {
            dialect: offer.dialect,
            server_guid: offer.server_guid,
            session_id: self.session_id,
            signing_required: self.signing_required,
            capabilities: offer.capabilities,
            session_flags,
            max_transact_size: offer.max_transact_size,
            max_read_size: offer.max_read_size,
            max_write_size: offer.max_write_size,
        };

        let keys = match self.spnego.session_key() {
            Some(key) => Some(SessionDetails::new(self.session_id, offer.dialect, &key)?),
            None if session.is_guest_or_null() => None,
            None => {
                return Err(SmbError::AuthFailed(
                    "Mechanism exported no session key".to_string(),
                ))
            }
        };

        debug!(
            session_id = self.session_id,
            mech = %self.spnego.selected_mech(),
            "Session established"
        );
        self.state = FlowState::Complete;
        Ok(FlowAction::Established(session, keys))
    }

    fn session_setup(&self, token: Vec<u8>) -> HandshakeRequest {
        HandshakeRequest {
            command: Command::SessionSetup,
            session_id: self.session_id,
            body: Body::SessionSetupRequest(SessionSetupRequest {
                security_mode: security_mode(self.client_signing_required),
                capabilities: self.capabilities,
                security_buffer: Bytes::from(token),
                ..Default::default()
            }),
        }
    }
}

impl std::fmt::Debug for NegotiationFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationFlow")
            .field("state", &self.state)
            .field("range", &self.range)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
