//! SMB2 server
//!
//! [`SmbServer`] accepts TCP connections and runs one [`ServerConnection`]
//! task per socket. Each connection owns its framing, signer map and
//! [`CoreDispatcher`]; only configuration, the application dispatcher and the
//! session-id counter are shared.

pub mod dispatch;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use smb_proto::framing::{write_frame, Codec, Decoded, ServerCodec};
use smb_proto::protocol::{
    encode_raw_error, mirror, Command, Dialect, FileTime, Header, LegacyNegotiate, Message,
    Packet, RawHeader, Reply,
};
use smb_proto::{NtStatus, SmbError, SmbResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::details::ConnectionDetails;

pub use dispatch::{
    CoreDispatcher, Dispatched, MechanismFactory, NotSupportedDispatcher, RequestDispatcher,
    SessionEffect,
};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Live connection as seen by the server
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Peer address
    pub peer: SocketAddr,
    /// When the connection was accepted
    pub accepted_at: FileTime,
}

/// SMB server
pub struct SmbServer {
    config: Arc<ServerConfig>,
    mechanisms: MechanismFactory,
    app: Arc<dyn RequestDispatcher>,
    session_ids: Arc<AtomicU64>,
    connection_ids: AtomicU64,
    connections: Arc<DashMap<u64, ConnectionInfo>>,
    start_time: FileTime,
}

impl SmbServer {
    /// Create a server that only handles the protocol-level commands
    pub fn new(config: ServerConfig, mechanisms: MechanismFactory) -> Self {
        Self::with_dispatcher(config, mechanisms, Arc::new(NotSupportedDispatcher))
    }

    /// Create a server delegating other commands to `app`
    pub fn with_dispatcher(
        config: ServerConfig,
        mechanisms: MechanismFactory,
        app: Arc<dyn RequestDispatcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            mechanisms,
            app,
            session_ids: Arc::new(AtomicU64::new(1)),
            connection_ids: AtomicU64::new(1),
            connections: Arc::new(DashMap::new()),
            start_time: FileTime::now(),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Open connections
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> SmbResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> SmbResult<()> {
        info!(
            addr = %listener.local_addr()?,
            server_guid = %self.config.server_guid,
            dialects = ?self.config.dialects,
            "SMB server listening"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let id = self.connection_ids.fetch_add(1, Ordering::Relaxed);
                    self.connections.insert(
                        id,
                        ConnectionInfo {
                            peer,
                            accepted_at: FileTime::now(),
                        },
                    );
                    info!(connection = id, %peer, "Accepted connection");

                    let connection = self.connection();
                    let connections = Arc::clone(&self.connections);
                    tokio::spawn(async move {
                        match connection.run(stream).await {
                            Ok(()) => debug!(connection = id, "Connection closed"),
                            Err(e) => debug!(connection = id, error = %e, "Connection terminated"),
                        }
                        connections.remove(&id);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Serve one transport until it closes
    pub async fn serve_connection<S>(&self, stream: S) -> SmbResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.connection().run(stream).await
    }

    fn connection(&self) -> ServerConnection {
        ServerConnection::new(
            Arc::clone(&self.config),
            CoreDispatcher::new(
                Arc::clone(&self.config),
                Arc::clone(&self.app),
                Arc::clone(&self.mechanisms),
                Arc::clone(&self.session_ids),
                self.start_time,
            ),
        )
    }
}

impl std::fmt::Debug for SmbServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbServer")
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

/// Server side of one transport connection
#[derive(Debug)]
pub struct ServerConnection {
    config: Arc<ServerConfig>,
    codec: ServerCodec,
    details: ConnectionDetails,
    core: CoreDispatcher,
    out: BytesMut,
}

impl ServerConnection {
    /// Create a connection around its dispatcher
    pub fn new(config: Arc<ServerConfig>, core: CoreDispatcher) -> Self {
        Self {
            codec: ServerCodec::new(config.max_frame_size),
            details: ConnectionDetails::new(config.credits),
            config,
            core,
            out: BytesMut::new(),
        }
    }

    /// Read, dispatch and answer requests until the peer closes
    ///
    /// A clean close returns `Ok`; framing errors, unparseable headers and
    /// signature failures under mandatory signing end the connection with
    /// the error.
    pub async fn run<S>(mut self, stream: S) -> SmbResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            if reader.read_buf(&mut read_buf).await? == 0 {
                return Ok(());
            }
            let mut keep_open = true;
            while keep_open {
                let Some(decoded) = self.codec.decode(&mut read_buf)? else {
                    break;
                };
                keep_open = self.handle(decoded).await?;
            }
            if !self.out.is_empty() {
                writer.write_all(&self.out).await?;
                writer.flush().await?;
                self.out.clear();
            }
            if !keep_open {
                return Err(SmbError::Signature(
                    "Signature failure on a connection that requires signing".to_string(),
                ));
            }
        }
    }

    /// Handle one inbound packet; `false` closes the connection
    async fn handle(&mut self, decoded: Decoded<Packet>) -> SmbResult<bool> {
        let Decoded { message, raw } = decoded;
        match message {
            Packet::Legacy(negotiate) => {
                self.legacy(&negotiate)?;
                Ok(true)
            }
            Packet::Undecodable { header, error } => {
                self.undecodable(&header, &error)?;
                Ok(true)
            }
            Packet::Current(request) => self.request(request, &raw).await,
        }
    }

    fn legacy(&mut self, negotiate: &LegacyNegotiate) -> SmbResult<()> {
        trace!(dialects = ?negotiate.dialects, "Legacy negotiate");
        let reply = self.core.negotiate_legacy(negotiate);
        let request = Header::new_request(Command::Negotiate, 0, 0, 0);
        self.respond(&request, reply)
    }

    fn undecodable(&mut self, header: &RawHeader, error: &SmbError) -> SmbResult<()> {
        warn!(
            command = header.command,
            message_id = header.message_id,
            error = %error,
            "Rejecting undecodable request"
        );
        let credit = header.credit.clamp(1, self.config.credits.max_credits.max(1));
        let mut payload = BytesMut::new();
        encode_raw_error(header, error.status(), credit, &mut payload);
        write_frame(&payload, &mut self.out)
    }

    async fn request(&mut self, request: Message, raw: &[u8]) -> SmbResult<bool> {
        let header = &request.header;
        if header.is_response() {
            warn!(message_id = header.message_id, "Dropping response sent to a server");
            return Ok(true);
        }
        if header.command == Command::Cancel {
            // Requests are answered in order, so there is nothing to cancel
            debug!(message_id = header.message_id, "CANCEL for a completed request");
            return Ok(true);
        }

        if let Err(e) = self.check_signature(header, raw) {
            warn!(
                message_id = header.message_id,
                session_id = header.session_id,
                error = %e,
                "Request failed signature check"
            );
            self.respond(header, Reply::error(NtStatus::AccessDenied))?;
            return Ok(!self.config.signing_required);
        }

        let Dispatched { reply, effect } = self.core.dispatch(&request).await;
        if let Some(dialect) = self.core.dialect().filter(Dialect::is_known) {
            if self.details.dialect().is_none() {
                self.details.set_dialect(dialect);
            }
        }

        match effect {
            Some(SessionEffect::InstallSigner(session_id, signer)) => {
                self.details.insert_signer(session_id, signer);
                self.respond(&request.header, reply)?;
            }
            Some(SessionEffect::RemoveSigner(session_id)) => {
                self.respond(&request.header, reply)?;
                self.details.remove_signer(session_id);
            }
            None => self.respond(&request.header, reply)?,
        }
        Ok(true)
    }

    fn check_signature(&self, header: &Header, raw: &[u8]) -> SmbResult<()> {
        let Some(signer) = self.details.signer(header.session_id) else {
            return Ok(());
        };
        if header.is_signed() {
            signer.verify_inbound_signature(raw)
        } else if self.config.signing_required {
            Err(SmbError::Signature(
                "Unsigned request on a signed session".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Mirror, grant credits, encode and sign a response
    fn respond(&mut self, request: &Header, mut reply: Reply) -> SmbResult<()> {
        let granted = self
            .details
            .credit_policy()
            .grant_for(request.command, request.credit);
        reply.header.credit_response = Some(granted);

        let mut response = mirror(request, reply);
        let offset = match self.codec.encode(&response, &mut self.out) {
            Ok(offset) => offset,
            Err(e) => {
                warn!(
                    message_id = request.message_id,
                    command = ?request.command,
                    error = %e,
                    "Reply does not encode, answering with an error status"
                );
                let mut fallback = Reply::error(e.status());
                fallback.header.credit_response = Some(granted);
                response = mirror(request, fallback);
                self.codec.encode(&response, &mut self.out)?
            }
        };
        if let Some(signer) = self.details.signer(response.header.session_id) {
            signer.sign_outbound(&mut self.out[offset..])?;
        }
        trace!(
            message_id = response.header.message_id,
            command = ?response.header.command,
            status = %response.header.status,
            credit = granted,
            "Response queued"
        );
        Ok(())
    }
}
