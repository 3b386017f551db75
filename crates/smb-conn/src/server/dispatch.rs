//! Request dispatch
//!
//! [`CoreDispatcher`] owns the protocol-level commands of one connection
//! (NEGOTIATE, SESSION_SETUP, LOGOFF, ECHO) and hands everything else to an
//! application [`RequestDispatcher`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use smb_proto::protocol::{
    negotiate_dialect, security_mode, Body, Capabilities, Capability, Command, Dialect,
    FileTime, LegacyNegotiate, Message, NegotiateRequest, NegotiateResponse, Reply,
    SessionFlags, SessionSetupResponse,
};
use smb_proto::signing::{PacketSigner, SessionDetails};
use smb_proto::spnego::{Mechanism, SecurityStatus, SpnegoAcceptor};
use smb_proto::{NtStatus, SmbError, SmbResult};
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// Produces the response content for one request
///
/// The connection mirrors the header and grants credits; implementations
/// only fill in command-specific fields. An `Err` becomes an error response
/// carrying [`SmbError::status`].
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    /// Handle one request
    async fn dispatch(&self, request: &Message) -> SmbResult<Reply>;
}

/// Application dispatcher that supports nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NotSupportedDispatcher;

#[async_trait]
impl RequestDispatcher for NotSupportedDispatcher {
    async fn dispatch(&self, request: &Message) -> SmbResult<Reply> {
        debug!(command = ?request.header.command, "No handler for command");
        Err(SmbError::NtStatus(NtStatus::NotSupported))
    }
}

/// Builds a fresh set of acceptor mechanisms for each session setup
pub type MechanismFactory = Arc<dyn Fn() -> Vec<Box<dyn Mechanism>> + Send + Sync>;

/// Change to the connection's signer map requested by a reply
#[derive(Debug)]
pub enum SessionEffect {
    /// Session established: install before signing the reply
    InstallSigner(u64, PacketSigner),
    /// Session logged off: remove after signing the reply
    RemoveSigner(u64),
}

/// Dispatch outcome
#[derive(Debug)]
pub struct Dispatched {
    /// Reply to mirror and send
    pub reply: Reply,
    /// Signer change that goes with it
    pub effect: Option<SessionEffect>,
}

impl From<Reply> for Dispatched {
    fn from(reply: Reply) -> Self {
        Self {
            reply,
            effect: None,
        }
    }
}

/// Protocol-level dispatcher for one connection
pub struct CoreDispatcher {
    config: Arc<ServerConfig>,
    app: Arc<dyn RequestDispatcher>,
    mechanisms: MechanismFactory,
    session_ids: Arc<AtomicU64>,
    start_time: FileTime,
    dialect: Option<Dialect>,
    in_progress: HashMap<u64, SpnegoAcceptor>,
    sessions: HashSet<u64>,
}

impl CoreDispatcher {
    /// Create the dispatcher of a new connection
    ///
    /// `session_ids` is shared by every connection of a server so session
    /// ids stay unique.
    pub fn new(
        config: Arc<ServerConfig>,
        app: Arc<dyn RequestDispatcher>,
        mechanisms: MechanismFactory,
        session_ids: Arc<AtomicU64>,
        start_time: FileTime,
    ) -> Self {
        Self {
            config,
            app,
            mechanisms,
            session_ids,
            start_time,
            dialect: None,
            in_progress: HashMap::new(),
            sessions: HashSet::new(),
        }
    }

    /// Dialect agreed so far (`Wildcard` after a legacy negotiate)
    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    /// Whether a session finished SESSION_SETUP and has not logged off
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains(&session_id)
    }

    /// Answer an SMB1 multi-protocol negotiate
    pub fn negotiate_legacy(&mut self, request: &LegacyNegotiate) -> Reply {
        if self.dialect.is_some() {
            return Reply::error(NtStatus::InvalidParameter);
        }
        let supported = &self.config.dialects;
        let dialect = match request.smb2_dialect() {
            Some(Dialect::Wildcard) if supported.iter().any(|d| *d != Dialect::Smb202) => {
                Dialect::Wildcard
            }
            Some(_) if supported.contains(&Dialect::Smb202) => Dialect::Smb202,
            _ => {
                debug!(offered = ?request.dialects, "Legacy negotiate without a usable SMB2 dialect");
                return Reply::error(NtStatus::NotSupported);
            }
        };
        debug!(%dialect, "Answering legacy negotiate");
        self.dialect = Some(dialect);
        Reply::ok(Body::NegotiateResponse(self.negotiate_response(dialect)))
    }

    /// Handle one SMB2 request
    pub async fn dispatch(&mut self, request: &Message) -> Dispatched {
        let command = request.header.command;
        let result = match (&request.body, command) {
            (Body::NegotiateRequest(body), _) => self.negotiate(body).map(Dispatched::from),
            (_, Command::SessionSetup) => self.session_setup(request),
            (_, Command::Logoff) => self.logoff(request.header.session_id),
            (_, Command::Echo) => Ok(Reply::ok(Body::Empty).into()),
            _ if self.sessions.contains(&request.header.session_id) => {
                let app = Arc::clone(&self.app);
                app.dispatch(request).await.map(Dispatched::from)
            }
            _ => Err(SmbError::NtStatus(NtStatus::UserSessionDeleted)),
        };
        result.unwrap_or_else(|e| {
            warn!(?command, message_id = request.header.message_id, error = %e, "Request failed");
            Reply::error(e.status()).into()
        })
    }

    fn negotiate(&mut self, request: &NegotiateRequest) -> SmbResult<Reply> {
        if self.dialect.is_some_and(|d| d.is_known()) {
            return Err(SmbError::Protocol("Repeated NEGOTIATE".to_string()));
        }
        let dialect = match negotiate_dialect(&request.dialects, &self.config.dialects) {
            Ok(dialect) => dialect,
            Err(e) => {
                debug!(error = %e, client_guid = %request.client_guid, "Dialect negotiation failed");
                return Ok(Reply::error(NtStatus::NotSupported));
            }
        };
        debug!(%dialect, client_guid = %request.client_guid, "Dialect selected");
        self.dialect = Some(dialect);
        Ok(Reply::ok(Body::NegotiateResponse(
            self.negotiate_response(dialect),
        )))
    }

    fn negotiate_response(&self, dialect: Dialect) -> NegotiateResponse {
        let capabilities = if dialect.supports_multi_credit() {
            Capabilities::from(Capability::LargeMtu)
        } else {
            Capabilities::empty()
        };
        let hint = SpnegoAcceptor::new((self.mechanisms)()).hint_token();
        NegotiateResponse {
            security_mode: security_mode(self.config.signing_required),
            dialect,
            server_guid: self.config.server_guid,
            capabilities,
            max_transact_size: self.config.max_transact_size,
            max_read_size: self.config.max_read_size,
            max_write_size: self.config.max_write_size,
            system_time: FileTime::now(),
            server_start_time: self.start_time,
            security_buffer: Bytes::from(hint),
        }
    }

    fn session_setup(&mut self, request: &Message) -> SmbResult<Dispatched> {
        let dialect = self
            .dialect
            .filter(|d| d.is_known())
            .ok_or_else(|| SmbError::Protocol("SESSION_SETUP before NEGOTIATE".to_string()))?;
        let Body::SessionSetupRequest(body) = &request.body else {
            return Err(SmbError::Protocol("Malformed SESSION_SETUP".to_string()));
        };

        let session_id = match request.header.session_id {
            0 => {
                let id = self.session_ids.fetch_add(1, Ordering::Relaxed);
                self.in_progress
                    .insert(id, SpnegoAcceptor::new((self.mechanisms)()));
                debug!(session_id = id, "Session setup started");
                id
            }
            id if self.in_progress.contains_key(&id) => id,
            id if self.sessions.contains(&id) => {
                return Err(SmbError::NotSupported(format!(
                    "Re-authentication of session {id:#x}"
                )))
            }
            _ => return Err(SmbError::NtStatus(NtStatus::UserSessionDeleted)),
        };

        let Some(acceptor) = self.in_progress.get_mut(&session_id) else {
            return Err(SmbError::NtStatus(NtStatus::UserSessionDeleted));
        };
        let status = match acceptor.step(&body.security_buffer) {
            Ok(status) => status,
            Err(e) => {
                self.in_progress.remove(&session_id);
                return Ok(with_session(Reply::error(e.status()), session_id).into());
            }
        };

        match status {
            SecurityStatus::Continue(token) => {
                let mut reply = setup_reply(token);
                reply.header.status = Some(NtStatus::MoreProcessingRequired);
                Ok(with_session(reply, session_id).into())
            }
            SecurityStatus::Accept(token) => {
                let key = self
                    .in_progress
                    .remove(&session_id)
                    .and_then(|acceptor| acceptor.session_key());
                let Some(key) = key else {
                    warn!(session_id, "Mechanism completed without a session key");
                    return Ok(with_session(Reply::error(NtStatus::LogonFailure), session_id).into());
                };
                let effect = match SessionDetails::new(session_id, dialect, &key)?.signer() {
                    Ok(signer) => Some(SessionEffect::InstallSigner(session_id, signer)),
                    Err(e) if self.config.signing_required => {
                        return Ok(with_session(Reply::error(e.status()), session_id).into())
                    }
                    Err(e) => {
                        debug!(session_id, error = %e, "Session will not be signed");
                        None
                    }
                };
                self.sessions.insert(session_id);
                debug!(session_id, %dialect, "Session established");
                Ok(Dispatched {
                    reply: with_session(setup_reply(token.unwrap_or_default()), session_id),
                    effect,
                })
            }
            SecurityStatus::Reject => {
                self.in_progress.remove(&session_id);
                debug!(session_id, "Authentication rejected");
                Ok(with_session(Reply::error(NtStatus::LogonFailure), session_id).into())
            }
        }
    }

    fn logoff(&mut self, session_id: u64) -> SmbResult<Dispatched> {
        if !self.sessions.remove(&session_id) {
            return Err(SmbError::NtStatus(NtStatus::UserSessionDeleted));
        }
        debug!(session_id, "Session logged off");
        Ok(Dispatched {
            reply: Reply::ok(Body::Empty),
            effect: Some(SessionEffect::RemoveSigner(session_id)),
        })
    }
}

impl std::fmt::Debug for CoreDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreDispatcher")
            .field("dialect", &self.dialect)
            .field("in_progress", &self.in_progress.len())
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

fn setup_reply(token: Vec<u8>) -> Reply {
    Reply::ok(Body::SessionSetupResponse(SessionSetupResponse {
        session_flags: SessionFlags::empty(),
        security_buffer: Bytes::from(token),
    }))
}

fn with_session(mut reply: Reply, session_id: u64) -> Reply {
    reply.header.session_id = Some(session_id);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use smb_proto::protocol::{Guid, Header, SessionSetupRequest};
    use smb_proto::spnego::{MechStep, NegotiationToken, Oid};

    /// Accepts any token in one leg
    struct Anything {
        done: bool,
    }

    impl Mechanism for Anything {
        fn oid(&self) -> Oid {
            Oid::NTLM
        }

        fn step(&mut self, input: Option<&[u8]>) -> SmbResult<MechStep> {
            match input {
                Some(b"let me in") => {
                    self.done = true;
                    Ok(MechStep::Complete(None))
                }
                _ => Err(SmbError::AuthFailed("wrong token".to_string())),
            }
        }

        fn session_key(&self) -> Option<Vec<u8>> {
            self.done.then(|| vec![7; 16])
        }
    }

    fn dispatcher(dialects: &str) -> CoreDispatcher {
        let config = ServerConfig::from_pairs([
            ("server_guid", "996e16b1-e7fb-9464-6b35-35057de29f07"),
            ("dialects", dialects),
        ])
        .unwrap();
        let factory: MechanismFactory =
            Arc::new(|| vec![Box::new(Anything { done: false }) as Box<dyn Mechanism>]);
        CoreDispatcher::new(
            Arc::new(config),
            Arc::new(NotSupportedDispatcher),
            factory,
            Arc::new(AtomicU64::new(0x100)),
            FileTime::new(0),
        )
    }

    fn negotiate(dialects: Vec<Dialect>) -> Message {
        Message::new(
            Header::new_request(Command::Negotiate, 0, 0, 0),
            Body::NegotiateRequest(NegotiateRequest {
                security_mode: security_mode(false),
                capabilities: Capabilities::empty(),
                client_guid: Guid::random(),
                dialects,
            }),
        )
    }

    fn setup(session_id: u64, mech_token: &[u8]) -> Message {
        let token = NegotiationToken::Init(smb_proto::spnego::NegTokenInit {
            mech_types: vec![Oid::NTLM],
            mech_token: Some(Bytes::copy_from_slice(mech_token)),
            ..Default::default()
        })
        .encode();
        Message::new(
            Header::new_request(Command::SessionSetup, 1, session_id, 0),
            Body::SessionSetupRequest(SessionSetupRequest {
                security_buffer: Bytes::from(token),
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn test_negotiate_picks_highest_common() {
        let mut core = dispatcher("3.0");
        let out = core
            .dispatch(&negotiate(vec![Dialect::Smb202, Dialect::Smb300, Dialect::Smb311]))
            .await;
        let Body::NegotiateResponse(body) = out.reply.body else {
            panic!("expected negotiate response");
        };
        assert_eq!(body.dialect, Dialect::Smb300);
        assert_eq!(body.server_guid.to_string(), "996e16b1-e7fb-9464-6b35-35057de29f07");
        assert!(!body.security_buffer.is_empty());
        assert_eq!(core.dialect(), Some(Dialect::Smb300));
    }

    #[tokio::test]
    async fn test_disjoint_dialects_not_supported() {
        let mut core = dispatcher("3.0");
        let out = core.dispatch(&negotiate(vec![Dialect::Smb202])).await;
        assert_eq!(out.reply.header.status, Some(NtStatus::NotSupported));
        assert_eq!(core.dialect(), None);
    }

    #[tokio::test]
    async fn test_repeated_negotiate_fails() {
        let mut core = dispatcher("3.0");
        core.dispatch(&negotiate(vec![Dialect::Smb300])).await;
        let out = core.dispatch(&negotiate(vec![Dialect::Smb300])).await;
        assert_eq!(out.reply.header.status, Some(NtStatus::InvalidParameter));
    }

    #[tokio::test]
    async fn test_session_setup_installs_signer() {
        let mut core = dispatcher("3.0");
        core.dispatch(&negotiate(vec![Dialect::Smb300])).await;

        let out = core.dispatch(&setup(0, b"let me in")).await;
        assert_eq!(out.reply.header.status, None);
        assert_eq!(out.reply.header.session_id, Some(0x100));
        assert!(matches!(out.effect, Some(SessionEffect::InstallSigner(0x100, _))));
        assert!(core.has_session(0x100));

        let mut logoff = Message::new(Header::new_request(Command::Logoff, 2, 0x100, 0), Body::Empty);
        let out = core.dispatch(&logoff).await;
        assert!(matches!(out.effect, Some(SessionEffect::RemoveSigner(0x100))));
        assert!(!core.has_session(0x100));

        logoff.header.message_id = 3;
        let out = core.dispatch(&logoff).await;
        assert_eq!(out.reply.header.status, Some(NtStatus::UserSessionDeleted));
    }

    #[tokio::test]
    async fn test_bad_token_is_logon_failure() {
        let mut core = dispatcher("2.1");
        core.dispatch(&negotiate(vec![Dialect::Smb210])).await;
        let out = core.dispatch(&setup(0, b"guess")).await;
        assert_eq!(out.reply.header.status, Some(NtStatus::LogonFailure));
        assert!(out.effect.is_none());
    }

    #[tokio::test]
    async fn test_session_setup_before_negotiate() {
        let mut core = dispatcher("3.0");
        let out = core.dispatch(&setup(0, b"let me in")).await;
        assert_eq!(out.reply.header.status, Some(NtStatus::InvalidParameter));
    }

    #[tokio::test]
    async fn test_other_commands_need_session() {
        let mut core = dispatcher("3.0");
        core.dispatch(&negotiate(vec![Dialect::Smb300])).await;

        let read = Message::new(
            Header::new_request(Command::Read, 1, 0x55, 1),
            Body::Opaque(Bytes::from_static(&[0; 8])),
        );
        let out = core.dispatch(&read).await;
        assert_eq!(out.reply.header.status, Some(NtStatus::UserSessionDeleted));

        core.dispatch(&setup(0, b"let me in")).await;
        let read = Message::new(
            Header::new_request(Command::Read, 2, 0x100, 1),
            Body::Opaque(Bytes::from_static(&[0; 8])),
        );
        let out = core.dispatch(&read).await;
        assert_eq!(out.reply.header.status, Some(NtStatus::NotSupported));
    }

    #[test]
    fn test_legacy_wildcard() {
        let mut core = dispatcher("2.0.2,2.1,3.0");
        let reply = core.negotiate_legacy(&LegacyNegotiate::new(["NT LM 0.12", "SMB 2.002", "SMB 2.???"]));
        let Body::NegotiateResponse(body) = reply.body else {
            panic!("expected negotiate response");
        };
        assert_eq!(body.dialect, Dialect::Wildcard);
        assert_eq!(core.dialect(), Some(Dialect::Wildcard));

        let mut core = dispatcher("2.0.2");
        let reply = core.negotiate_legacy(&LegacyNegotiate::new(["SMB 2.???"]));
        let Body::NegotiateResponse(body) = reply.body else {
            panic!("expected negotiate response");
        };
        assert_eq!(body.dialect, Dialect::Smb202);

        let mut core = dispatcher("3.0");
        let reply = core.negotiate_legacy(&LegacyNegotiate::new(["NT LM 0.12"]));
        assert_eq!(reply.header.status, Some(NtStatus::NotSupported));
    }

    #[tokio::test]
    async fn test_negotiate_after_wildcard() {
        let mut core = dispatcher("2.1,3.0");
        core.negotiate_legacy(&LegacyNegotiate::new(["SMB 2.???"]));
        let out = core.dispatch(&negotiate(vec![Dialect::Smb210, Dialect::Smb300])).await;
        assert_eq!(out.reply.header.status, None);
        assert_eq!(core.dialect(), Some(Dialect::Smb300));
    }
}
