//! SMB2 client connection
//!
//! [`SmbClient`] is a cheap, cloneable handle. The connection itself is owned
//! by one driver task which does all framing, signing and credit accounting;
//! handles talk to it over a channel and wait on oneshot replies.

pub mod flow;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use smb_proto::framing::{ClientCodec, Codec, Decoded, FRAME_HEADER_SIZE};
use smb_proto::protocol::{
    Body, Command, Dialect, Header, HeaderFlag, Message, RawHeader, Response,
};
use smb_proto::signing::SessionDetails;
use smb_proto::spnego::Mechanism;
use smb_proto::{NtStatus, SmbError, SmbResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::details::ConnectionDetails;
use crate::pending::{PendingEntry, PendingTable, Waiter};

pub use flow::{FlowAction, FlowState, HandshakeRequest, NegotiatedSession, NegotiationFlow};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A request for the connection to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command code
    pub command: Command,
    /// Tree the request targets (0 for none)
    pub tree_id: u32,
    /// Request body
    pub body: Body,
}

impl Request {
    /// Request outside any tree
    pub fn new(command: Command, body: Body) -> Self {
        Self {
            command,
            tree_id: 0,
            body,
        }
    }

    /// Target a tree
    pub fn on_tree(mut self, tree_id: u32) -> Self {
        self.tree_id = tree_id;
        self
    }
}

enum DriverCommand {
    Send {
        ticket: u64,
        request: Request,
        reply: oneshot::Sender<SmbResult<Message>>,
    },
    Cancel {
        ticket: u64,
    },
}

/// Handle to an established SMB2 connection
#[derive(Clone)]
pub struct SmbClient {
    commands: mpsc::UnboundedSender<DriverCommand>,
    tickets: Arc<AtomicU64>,
    session: Arc<Mutex<Option<NegotiatedSession>>>,
    timeout: Duration,
}

impl SmbClient {
    /// Connect over TCP and complete the handshake
    pub async fn connect_tcp<A: ToSocketAddrs>(
        addr: A,
        config: ClientConfig,
        mechs: Vec<Box<dyn Mechanism>>,
    ) -> SmbResult<Self> {
        let stream = tokio::time::timeout(config.request_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| SmbError::Timeout)??;
        stream.set_nodelay(true)?;
        Self::connect(stream, config, mechs).await
    }

    /// Run the handshake over an established transport
    ///
    /// Resolves once SESSION_SETUP completes, or with the negotiation error
    /// that stopped it.
    pub async fn connect<S>(
        stream: S,
        config: ClientConfig,
        mechs: Vec<Box<dyn Mechanism>>,
    ) -> SmbResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config
            .validate()
            .map_err(|e| SmbError::Negotiation(format!("Invalid client configuration: {e}")))?;
        let flow = NegotiationFlow::new(&config, mechs)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let session = Arc::new(Mutex::new(None));
        let timeout = config.request_timeout();

        let driver = Driver::new(config, flow, connected_tx, Arc::clone(&session));
        tokio::spawn(driver.run(stream, command_rx));

        let negotiated = tokio::time::timeout(timeout, connected_rx)
            .await
            .map_err(|_| SmbError::Timeout)?
            .map_err(|_| SmbError::ConnectionClosed)??;
        debug!(
            dialect = %negotiated.dialect,
            session_id = negotiated.session_id,
            "Connected"
        );

        Ok(Self {
            commands,
            tickets: Arc::new(AtomicU64::new(1)),
            session,
            timeout,
        })
    }

    /// Parameters of the current session; `None` after logoff
    pub fn session(&self) -> Option<NegotiatedSession> {
        self.session.lock().clone()
    }

    /// Negotiated dialect of the current session
    pub fn dialect(&self) -> Option<Dialect> {
        self.session.lock().as_ref().map(|s| s.dialect)
    }

    /// Send a request and wait for its final response
    ///
    /// Error statuses come back as [`SmbError::NtStatus`].
    pub async fn request(&self, command: Command, body: Body) -> SmbResult<Message> {
        self.send(Request::new(command, body)).await
    }

    /// Send a request with the configured deadline
    pub async fn send(&self, request: Request) -> SmbResult<Message> {
        self.send_with_timeout(request, self.timeout).await
    }

    /// Send a request with an explicit deadline
    ///
    /// When the deadline passes the request is cancelled on the wire and the
    /// call fails with [`SmbError::Timeout`].
    pub async fn send_with_timeout(&self, request: Request, timeout: Duration) -> SmbResult<Message> {
        if request.command.is_handshake() {
            return Err(SmbError::NotSupported(format!(
                "{:?} is driven by the connection",
                request.command
            )));
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::Send {
                ticket,
                request,
                reply,
            })
            .map_err(|_| SmbError::ConnectionClosed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(result) => result.map_err(|_| SmbError::ConnectionClosed)?,
            Err(_) => {
                debug!(ticket, "Request deadline passed, cancelling");
                let _ = self.commands.send(DriverCommand::Cancel { ticket });
                Err(SmbError::Timeout)
            }
        }
    }

    /// ECHO round trip
    pub async fn echo(&self) -> SmbResult<()> {
        self.request(Command::Echo, Body::Empty).await.map(|_| ())
    }

    /// End the session; its signer is dropped once the server confirms
    pub async fn logoff(&self) -> SmbResult<()> {
        self.request(Command::Logoff, Body::Empty).await.map(|_| ())
    }
}

impl std::fmt::Debug for SmbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbClient")
            .field("session", &*self.session.lock())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Request waiting for a message id
#[derive(Debug)]
struct Outgoing {
    command: Command,
    session_id: u64,
    tree_id: u32,
    body: Body,
    waiter: Waiter,
}

struct Driver {
    codec: ClientCodec,
    details: ConnectionDetails<Outgoing>,
    pending: PendingTable,
    flow: Option<NegotiationFlow>,
    connected: Option<oneshot::Sender<SmbResult<NegotiatedSession>>>,
    session: Arc<Mutex<Option<NegotiatedSession>>>,
    session_id: u64,
    signing_required: bool,
    out: BytesMut,
}

impl Driver {
    fn new(
        config: ClientConfig,
        flow: NegotiationFlow,
        connected: oneshot::Sender<SmbResult<NegotiatedSession>>,
        session: Arc<Mutex<Option<NegotiatedSession>>>,
    ) -> Self {
        Self {
            codec: ClientCodec::new(config.max_frame_size),
            details: ConnectionDetails::new(config.credits),
            pending: PendingTable::new(),
            flow: Some(flow),
            connected: Some(connected),
            session,
            session_id: 0,
            signing_required: config.signing_required,
            out: BytesMut::new(),
        }
    }

    async fn run<S>(mut self, stream: S, commands: mpsc::UnboundedReceiver<DriverCommand>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let result = self.drive(stream, commands).await;
        match &result {
            Ok(()) => debug!("Connection closed"),
            Err(e) => debug!(error = %e, "Connection terminated"),
        }
        self.shutdown(result.err());
    }

    async fn drive<S>(
        &mut self,
        stream: S,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    ) -> SmbResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        if let Some(flow) = self.flow.as_mut() {
            let request = flow.start();
            self.submit(handshake(request));
        }

        loop {
            if !self.out.is_empty() {
                writer.write_all(&self.out).await?;
                writer.flush().await?;
                self.out.clear();
            }

            tokio::select! {
                read = reader.read_buf(&mut read_buf) => {
                    if read? == 0 {
                        return Err(SmbError::ConnectionClosed);
                    }
                    loop {
                        match self.codec.decode(&mut read_buf) {
                            Ok(Some(decoded)) => self.on_message(decoded)?,
                            Ok(None) => break,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => warn!(error = %e, "Dropping frame without a readable header"),
                        }
                    }
                }
                command = commands.recv() => match command {
                    Some(DriverCommand::Send { ticket, request, reply }) => {
                        self.submit(Outgoing {
                            command: request.command,
                            session_id: self.session_id,
                            tree_id: request.tree_id,
                            body: request.body,
                            waiter: Waiter::Caller { ticket, reply },
                        });
                    }
                    Some(DriverCommand::Cancel { ticket }) => self.cancel(ticket),
                    None if self.connected.is_none() => return Ok(()),
                    // The connect future went away mid-handshake
                    None => return Err(SmbError::ConnectionClosed),
                },
            }
        }
    }

    /// Send now if a credit is free, otherwise queue
    fn submit(&mut self, outgoing: Outgoing) {
        if let Some((message_id, outgoing)) = self.details.allocate(outgoing) {
            self.transmit(message_id, outgoing);
        }
    }

    fn transmit(&mut self, message_id: u64, outgoing: Outgoing) {
        let Outgoing {
            command,
            session_id,
            tree_id,
            body,
            waiter,
        } = outgoing;

        let mut header = Header::new_request(command, message_id, session_id, tree_id);
        header.credit = self.details.credit_policy().request_for(command);
        let message = Message::new(header, body);

        if let Err(e) = self.write_message(&message, session_id) {
            warn!(message_id, ?command, error = %e, "Failed to encode request");
            waiter.resolve(Err(e));
            return;
        }
        trace!(message_id, ?command, session_id, "Request sent");
        self.pending.insert(message_id, command, session_id, waiter);
    }

    fn write_message(&mut self, message: &Message, session_id: u64) -> SmbResult<()> {
        let offset = self.codec.encode(message, &mut self.out)?;
        if let Some(signer) = self.details.signer(session_id) {
            if let Err(e) = signer.sign_outbound(&mut self.out[offset..]) {
                self.out.truncate(offset - FRAME_HEADER_SIZE);
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_message(&mut self, decoded: Decoded<Response>) -> SmbResult<()> {
        let Decoded { message, raw } = decoded;
        match message {
            Response::Decoded(message) => self.on_response(message, raw),
            Response::Undecodable { header, error } => {
                self.on_undecodable(&header, error, &raw)
            }
        }
    }

    fn on_response(&mut self, message: Message, raw: Bytes) -> SmbResult<()> {
        let header = &message.header;
        if !header.is_response() {
            warn!(command = ?header.command, "Dropping request received by a client");
            return Ok(());
        }
        let message_id = header.message_id;
        let status = header.status;

        // Interim responses are not signed
        if status != NtStatus::Pending {
            if let Err(e) = self.check_signature(header.session_id, header.is_signed(), &raw) {
                return self.reject(message_id, header.session_id, e);
            }
        }
        self.absorb_credits(header.credit);

        if status == NtStatus::Pending {
            if self.pending.mark_async(message_id, header.async_id) {
                trace!(message_id, async_id = header.async_id, "Interim response");
            } else {
                warn!(message_id, "Interim response for unknown request");
            }
            return Ok(());
        }

        let Some(entry) = self.pending.take(message_id) else {
            warn!(message_id, command = ?header.command, %status, "Orphaned response dropped");
            return Ok(());
        };

        match entry.waiter {
            Waiter::Handshake => self.on_handshake(message, raw),
            waiter => {
                if entry.command == Command::Logoff && status.is_success() {
                    self.logged_off(entry.session_id);
                }
                if status.is_error() {
                    waiter.resolve(Err(SmbError::NtStatus(status)));
                } else {
                    waiter.resolve(Ok(message));
                }
                Ok(())
            }
        }
    }

    /// A response whose header decoded but whose body did not
    ///
    /// The credits still count and the waiter gets the decode error.
    fn on_undecodable(
        &mut self,
        header: &RawHeader,
        error: SmbError,
        raw: &[u8],
    ) -> SmbResult<()> {
        if !header.is_response() {
            warn!(command = header.command, "Dropping request received by a client");
            return Ok(());
        }
        let message_id = header.message_id;
        let status = header.status();

        if status != NtStatus::Pending {
            if let Err(e) = self.check_signature(header.session_id, header.is_signed(), raw) {
                return self.reject(message_id, header.session_id, e);
            }
        }
        self.absorb_credits(header.credit);
        warn!(
            message_id,
            command = header.command,
            %status,
            error = %error,
            "Undecodable response"
        );

        if status == NtStatus::Pending {
            if !self.pending.mark_async(message_id, header.async_id) {
                warn!(message_id, "Interim response for unknown request");
            }
            return Ok(());
        }

        match self.pending.take(message_id) {
            Some(PendingEntry {
                waiter: Waiter::Handshake,
                ..
            }) => {
                self.flow = None;
                self.fail_handshake(error)
            }
            Some(entry) => {
                entry.waiter.resolve(Err(error));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_signature(&self, session_id: u64, signed: bool, raw: &[u8]) -> SmbResult<()> {
        let Some(signer) = self.details.signer(session_id) else {
            return Ok(());
        };
        if signed {
            signer.verify_inbound_signature(raw)
        } else if self.signing_required {
            Err(SmbError::Signature(
                "Unsigned response on a signed session".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Fail the waiter of a response that did not verify
    ///
    /// Its credits are not taken. When signing is required the connection
    /// closes too.
    fn reject(&mut self, message_id: u64, session_id: u64, error: SmbError) -> SmbResult<()> {
        warn!(message_id, session_id, error = %error, "Response failed signature check");
        let reason = error.to_string();
        match self.pending.take(message_id) {
            Some(PendingEntry {
                waiter: Waiter::Handshake,
                ..
            }) => {
                self.flow = None;
                return self.fail_handshake(error);
            }
            Some(entry) => entry.waiter.resolve(Err(error)),
            None => {}
        }
        if self.signing_required {
            return Err(SmbError::Signature(reason));
        }
        Ok(())
    }

    fn absorb_credits(&mut self, granted: u16) {
        for (id, outgoing) in self.details.accept_granted(granted) {
            self.transmit(id, outgoing);
        }
    }

    fn on_handshake(&mut self, message: Message, raw: Bytes) -> SmbResult<()> {
        let Some(flow) = self.flow.as_mut() else {
            warn!(command = ?message.header.command, "Handshake response after handshake finished");
            return Ok(());
        };

        match flow.on_response(&message) {
            FlowAction::Send(request) => {
                if self.details.dialect().is_none() {
                    if let Some(dialect) = flow.dialect() {
                        self.details.set_dialect(dialect);
                    }
                }
                self.submit(handshake(request));
                Ok(())
            }
            FlowAction::Established(session, keys) => {
                self.flow = None;
                match self.establish(&session, keys, &message, &raw) {
                    Ok(()) => {
                        self.session_id = session.session_id;
                        *self.session.lock() = Some(session.clone());
                        if let Some(connected) = self.connected.take() {
                            let _ = connected.send(Ok(session));
                        }
                        Ok(())
                    }
                    Err(e) => self.fail_handshake(e),
                }
            }
            FlowAction::Failed(e) => {
                self.flow = None;
                self.fail_handshake(e)
            }
        }
    }

    /// Install the session signer, checking the final response with it
    fn establish(
        &mut self,
        session: &NegotiatedSession,
        keys: Option<SessionDetails>,
        message: &Message,
        raw: &[u8],
    ) -> SmbResult<()> {
        self.signing_required |= session.signing_required;

        let signer = match keys {
            Some(_) if session.is_guest_or_null() => None,
            Some(keys) => match keys.signer() {
                Ok(signer) => Some(signer),
                Err(e) if self.signing_required => return Err(e),
                Err(e) => {
                    debug!(error = %e, "Session will not be signed");
                    None
                }
            },
            None => None,
        };

        match signer {
            Some(signer) => {
                if message.header.is_signed() {
                    signer.verify_inbound_signature(raw)?;
                } else if self.signing_required {
                    return Err(SmbError::Signature(
                        "Final SESSION_SETUP response is not signed".to_string(),
                    ));
                }
                self.details.insert_signer(session.session_id, signer);
            }
            None if self.signing_required => {
                return Err(SmbError::Signature(
                    "Signing required but the session has no signing key".to_string(),
                ));
            }
            None => {}
        }
        Ok(())
    }

    fn fail_handshake(&mut self, error: SmbError) -> SmbResult<()> {
        warn!(error = %error, "Handshake failed");
        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Err(error));
        }
        Err(SmbError::ConnectionClosed)
    }

    fn logged_off(&mut self, session_id: u64) {
        self.details.remove_signer(session_id);
        if self.session_id == session_id {
            self.session_id = 0;
            *self.session.lock() = None;
        }
        debug!(session_id, "Logged off");
    }

    /// Abandon a caller's request after its deadline
    fn cancel(&mut self, ticket: u64) {
        if let Some(outgoing) = self
            .details
            .remove_queued(|o| o.waiter.ticket() == Some(ticket))
        {
            trace!(ticket, "Cancelled request before it was sent");
            outgoing.waiter.resolve(Err(SmbError::Timeout));
            return;
        }

        let Some((message_id, entry)) = self.pending.cancel(ticket) else {
            return;
        };
        entry.waiter.resolve(Err(SmbError::Timeout));

        // CANCEL reuses the target's message id and consumes no credit
        let mut header = Header::new_request(Command::Cancel, message_id, entry.session_id, 0);
        header.credit = 0;
        if let Some(async_id) = entry.async_id {
            header.flags.insert(HeaderFlag::AsyncCommand);
            header.async_id = async_id;
        }
        let cancel = Message::new(header, Body::Empty);
        match self.write_message(&cancel, entry.session_id) {
            Ok(()) => debug!(message_id, async_id = ?entry.async_id, "CANCEL sent"),
            Err(e) => warn!(message_id, error = %e, "Failed to send CANCEL"),
        }
    }

    fn shutdown(&mut self, error: Option<SmbError>) {
        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Err(error.unwrap_or(SmbError::ConnectionClosed)));
        }
        self.pending.fail_all(|| SmbError::ConnectionClosed);
        for outgoing in self.details.drain_queued() {
            outgoing.waiter.resolve(Err(SmbError::ConnectionClosed));
        }
        *self.session.lock() = None;
    }
}

fn handshake(request: HandshakeRequest) -> Outgoing {
    Outgoing {
        command: request.command,
        session_id: request.session_id,
        tree_id: 0,
        body: request.body,
        waiter: Waiter::Handshake,
    }
}
