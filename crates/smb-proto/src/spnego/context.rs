//! SPNEGO initiator and acceptor contexts

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{SmbError, SmbResult};
use crate::spnego::der::Oid;
use crate::spnego::token::{
    encode_mech_list, NegHints, NegState, NegTokenInit, NegTokenResp, NegotiationToken,
    NEG_HINT_NAME,
};

/// Outcome of one mechanism leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechStep {
    /// Send this token and wait for the peer
    Continue(Vec<u8>),
    /// Context established; send the final token if there is one
    Complete(Option<Vec<u8>>),
}

/// Authentication mechanism negotiated through SPNEGO
///
/// NTLM and Kerberos internals live behind this trait.
pub trait Mechanism: Send {
    /// Mechanism OID
    fn oid(&self) -> Oid;

    /// Consume the peer's token (none on the initiator's first leg)
    fn step(&mut self, input: Option<&[u8]>) -> SmbResult<MechStep>;

    /// Exported session key once the context is complete
    fn session_key(&self) -> Option<Vec<u8>>;

    /// MIC over `data`, if the mechanism supports integrity
    fn get_mic(&self, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Check a MIC produced by the peer
    fn verify_mic(&self, _data: &[u8], _mic: &[u8]) -> SmbResult<()> {
        Err(SmbError::NotSupported(format!(
            "mechListMIC for {}",
            self.oid()
        )))
    }
}

/// Result of feeding a token to a SPNEGO context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityStatus {
    /// Send the token and expect another leg
    Continue(Vec<u8>),
    /// Authentication finished; send the final token if any
    Accept(Option<Vec<u8>>),
    /// Authentication failed
    Reject,
}

/// Client side of SPNEGO
pub struct SpnegoInitiator {
    mechs: Vec<Box<dyn Mechanism>>,
    selected: usize,
    mech_list: Vec<u8>,
    mech_complete: bool,
    started: bool,
}

impl SpnegoInitiator {
    /// Create over mechanisms in preference order
    pub fn new(mechs: Vec<Box<dyn Mechanism>>) -> SmbResult<Self> {
        if mechs.is_empty() {
            return Err(SmbError::Negotiation(
                "No authentication mechanisms configured".to_string(),
            ));
        }
        Ok(Self {
            mechs,
            selected: 0,
            mech_list: Vec::new(),
            mech_complete: false,
            started: false,
        })
    }

    /// Mechanism currently selected
    pub fn selected_mech(&self) -> Oid {
        self.mechs[self.selected].oid()
    }

    /// Session key of the selected mechanism
    pub fn session_key(&self) -> Option<Vec<u8>> {
        self.mechs[self.selected].session_key()
    }

    /// Build the first token
    ///
    /// `hint` is the security buffer of the NEGOTIATE response. When present,
    /// mechanisms the server does not list are dropped.
    pub fn initial_token(&mut self, hint: Option<&[u8]>) -> SmbResult<Vec<u8>> {
        if let Some(hint) = hint.filter(|h| !h.is_empty()) {
            self.apply_hint(hint)?;
        }

        let mech_types: Vec<Oid> = self.mechs.iter().map(|m| m.oid()).collect();
        self.mech_list = encode_mech_list(&mech_types);
        self.selected = 0;
        self.started = true;

        let mech_token = match self.mechs[0].step(None)? {
            MechStep::Continue(token) => token,
            MechStep::Complete(token) => {
                self.mech_complete = true;
                token.unwrap_or_default()
            }
        };
        debug!(mech = %mech_types[0], "SPNEGO initial token");

        Ok(NegotiationToken::Init(NegTokenInit {
            mech_types,
            mech_token: Some(Bytes::from(mech_token)),
            ..Default::default()
        })
        .encode())
    }

    fn apply_hint(&mut self, hint: &[u8]) -> SmbResult<()> {
        let offered = match NegotiationToken::decode(hint)? {
            NegotiationToken::Init(init) => init.mech_types,
            NegotiationToken::Resp(_) => {
                return Err(SmbError::Protocol(
                    "Server hint is not a NegTokenInit".to_string(),
                ))
            }
        };
        self.mechs.retain(|m| offered.contains(&m.oid()));
        if self.mechs.is_empty() {
            return Err(SmbError::Negotiation(format!(
                "No mechanism in common with server offer {offered:?}"
            )));
        }
        Ok(())
    }

    /// Process an acceptor token
    pub fn step(&mut self, input: &[u8]) -> SmbResult<SecurityStatus> {
        if !self.started {
            return Err(SmbError::Protocol(
                "SPNEGO step before initial token".to_string(),
            ));
        }
        let resp = match NegotiationToken::decode(input)? {
            NegotiationToken::Resp(resp) => resp,
            NegotiationToken::Init(_) => {
                return Err(SmbError::Protocol(
                    "Unexpected NegTokenInit from acceptor".to_string(),
                ))
            }
        };

        if resp.neg_state == Some(NegState::Reject) {
            debug!("SPNEGO rejected by acceptor");
            return Ok(SecurityStatus::Reject);
        }

        let mut out_token = None;
        if let Some(mech) = &resp.supported_mech {
            if *mech != self.selected_mech() {
                // Acceptor picked a later mechanism: restart with it
                self.selected = self
                    .mechs
                    .iter()
                    .position(|m| m.oid() == *mech)
                    .ok_or_else(|| {
                        SmbError::Negotiation(format!("Acceptor selected unoffered {mech}"))
                    })?;
                self.mech_complete = false;
                out_token = Some(self.drive(None)?);
            }
        }

        if let Some(token) = &resp.response_token {
            out_token = Some(self.drive(Some(token))?);
        }

        if let Some(mic) = &resp.mech_list_mic {
            self.mechs[self.selected].verify_mic(&self.mech_list, mic)?;
        }

        let completed = resp.neg_state == Some(NegState::AcceptCompleted);
        match out_token.flatten() {
            Some(token) => {
                let mech_list_mic = if self.mech_complete {
                    self.mechs[self.selected]
                        .get_mic(&self.mech_list)
                        .map(Bytes::from)
                } else {
                    None
                };
                let encoded = NegotiationToken::Resp(NegTokenResp {
                    response_token: Some(Bytes::from(token)),
                    mech_list_mic,
                    ..Default::default()
                })
                .encode();
                if completed && self.mech_complete {
                    Ok(SecurityStatus::Accept(Some(encoded)))
                } else {
                    Ok(SecurityStatus::Continue(encoded))
                }
            }
            None if completed && self.mech_complete => Ok(SecurityStatus::Accept(None)),
            None if completed => Err(SmbError::AuthFailed(
                "Acceptor completed before the mechanism".to_string(),
            )),
            None => Err(SmbError::Protocol(
                "Acceptor asked for another leg without a token".to_string(),
            )),
        }
    }

    /// Run the selected mechanism; `None` when it has nothing to send
    fn drive(&mut self, input: Option<&[u8]>) -> SmbResult<Option<Vec<u8>>> {
        match self.mechs[self.selected].step(input)? {
            MechStep::Continue(token) => Ok(Some(token)),
            MechStep::Complete(token) => {
                self.mech_complete = true;
                Ok(token)
            }
        }
    }
}

impl std::fmt::Debug for SpnegoInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpnegoInitiator")
            .field("selected", &self.selected_mech())
            .field("mech_complete", &self.mech_complete)
            .finish_non_exhaustive()
    }
}

/// Server side of SPNEGO
pub struct SpnegoAcceptor {
    mechs: Vec<Box<dyn Mechanism>>,
    selected: Option<usize>,
    mech_list: Vec<u8>,
    complete: bool,
}

impl SpnegoAcceptor {
    /// Create over the mechanisms the server accepts
    pub fn new(mechs: Vec<Box<dyn Mechanism>>) -> Self {
        Self {
            mechs,
            selected: None,
            mech_list: Vec::new(),
            complete: false,
        }
    }

    /// NegTokenInit2 for the NEGOTIATE response security buffer
    pub fn hint_token(&self) -> Vec<u8> {
        NegotiationToken::Init(NegTokenInit {
            mech_types: self.mechs.iter().map(|m| m.oid()).collect(),
            neg_hints: Some(NegHints {
                hint_name: Some(NEG_HINT_NAME.to_string()),
                hint_address: None,
            }),
            ..Default::default()
        })
        .encode()
    }

    /// Whether authentication finished successfully
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Session key of the selected mechanism
    pub fn session_key(&self) -> Option<Vec<u8>> {
        self.selected.and_then(|i| self.mechs[i].session_key())
    }

    /// Process an initiator token
    pub fn step(&mut self, input: &[u8]) -> SmbResult<SecurityStatus> {
        match NegotiationToken::decode(input)? {
            NegotiationToken::Init(init) => self.accept_init(init),
            NegotiationToken::Resp(resp) => self.accept_resp(resp),
        }
    }

    fn accept_init(&mut self, init: NegTokenInit) -> SmbResult<SecurityStatus> {
        if self.selected.is_some() {
            return Err(SmbError::Protocol("Repeated NegTokenInit".to_string()));
        }
        self.mech_list = encode_mech_list(&init.mech_types);

        // First initiator preference we support
        let Some((position, index)) = init.mech_types.iter().enumerate().find_map(|(pos, oid)| {
            self.mechs
                .iter()
                .position(|m| m.oid() == *oid)
                .map(|idx| (pos, idx))
        }) else {
            warn!(offered = ?init.mech_types, "No acceptable SPNEGO mechanism");
            return Ok(SecurityStatus::Reject);
        };
        self.selected = Some(index);
        let oid = self.mechs[index].oid();
        debug!(mech = %oid, "SPNEGO mechanism selected");

        // The optimistic token only belongs to the initiator's first choice
        let token = if position == 0 { init.mech_token } else { None };
        match token {
            Some(token) => self.run(Some(oid), &token, init.mech_list_mic.as_deref()),
            None => Ok(SecurityStatus::Continue(
                NegotiationToken::Resp(NegTokenResp {
                    neg_state: Some(NegState::AcceptIncomplete),
                    supported_mech: Some(oid),
                    ..Default::default()
                })
                .encode(),
            )),
        }
    }

    fn accept_resp(&mut self, resp: NegTokenResp) -> SmbResult<SecurityStatus> {
        if self.selected.is_none() {
            return Err(SmbError::Protocol(
                "NegTokenResp before NegTokenInit".to_string(),
            ));
        }
        if self.complete {
            return Err(SmbError::Protocol(
                "Token after SPNEGO completion".to_string(),
            ));
        }
        let token = resp.response_token.ok_or_else(|| {
            SmbError::Protocol("NegTokenResp without responseToken".to_string())
        })?;
        self.run(None, &token, resp.mech_list_mic.as_deref())
    }

    fn run(
        &mut self,
        supported_mech: Option<Oid>,
        token: &[u8],
        peer_mic: Option<&[u8]>,
    ) -> SmbResult<SecurityStatus> {
        let index = self
            .selected
            .ok_or_else(|| SmbError::Protocol("No SPNEGO mechanism selected".to_string()))?;
        let mech = &mut self.mechs[index];

        match mech.step(Some(token)) {
            Ok(MechStep::Continue(out)) => Ok(SecurityStatus::Continue(
                NegotiationToken::Resp(NegTokenResp {
                    neg_state: Some(NegState::AcceptIncomplete),
                    supported_mech,
                    response_token: Some(Bytes::from(out)),
                    mech_list_mic: None,
                })
                .encode(),
            )),
            Ok(MechStep::Complete(out)) => {
                if let Some(mic) = peer_mic {
                    mech.verify_mic(&self.mech_list, mic)?;
                }
                let mech_list_mic = mech.get_mic(&self.mech_list).map(Bytes::from);
                self.complete = true;
                debug!("SPNEGO accept completed");
                Ok(SecurityStatus::Accept(Some(
                    NegotiationToken::Resp(NegTokenResp {
                        neg_state: Some(NegState::AcceptCompleted),
                        supported_mech,
                        response_token: out.map(Bytes::from),
                        mech_list_mic,
                    })
                    .encode(),
                )))
            }
            Err(SmbError::AuthFailed(reason)) => {
                warn!(%reason, "Mechanism rejected initiator token");
                Ok(SecurityStatus::Reject)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for SpnegoAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpnegoAcceptor")
            .field("selected", &self.selected)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}
