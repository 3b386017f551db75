//! Shared fixtures for the connection tests
#![allow(dead_code)]

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use bytes::BytesMut;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use smb_conn::{ClientConfig, CoreDispatcher, MechanismFactory, NotSupportedDispatcher, ServerConfig, SmbClient, SmbServer};
use smb_proto::framing::{write_frame, Codec, ServerCodec};
use smb_proto::protocol::{mirror, FileTime, Guid, Message, Packet, Reply};
use smb_proto::spnego::negoex::{AuthScheme, NegoexMechanism, Role};
use smb_proto::spnego::{MechStep, Mechanism, Oid};
use smb_proto::{SmbError, SmbResult};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

type HmacSha256 = Hmac<Sha256>;

pub const SERVER_GUID: &str = "996e16b1-e7fb-9464-6b35-35057de29f07";
pub const SECRET: &[u8] = b"correct horse";

fn hmac(key: &[u8], label: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap();
    mac.update(label);
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Two-leg mechanism keyed by a shared secret
///
/// The initiator sends a nonce, the acceptor a challenge, and the initiator
/// proves the secret over both. The session key is an HMAC of the transcript.
pub struct SharedSecret {
    secret: Vec<u8>,
    initiator: bool,
    transcript: Vec<u8>,
    complete: bool,
}

impl SharedSecret {
    pub fn initiator(secret: &[u8]) -> Self {
        Self::new(secret, true)
    }

    pub fn acceptor(secret: &[u8]) -> Self {
        Self::new(secret, false)
    }

    fn new(secret: &[u8], initiator: bool) -> Self {
        Self {
            secret: secret.to_vec(),
            initiator,
            transcript: Vec::new(),
            complete: false,
        }
    }
}

impl Mechanism for SharedSecret {
    fn oid(&self) -> Oid {
        Oid::NTLM
    }

    fn step(&mut self, input: Option<&[u8]>) -> SmbResult<MechStep> {
        match (self.initiator, input) {
            (true, None) => {
                self.transcript.extend_from_slice(b"nonce-i");
                Ok(MechStep::Continue(b"nonce-i".to_vec()))
            }
            (true, Some(challenge)) => {
                self.transcript.extend_from_slice(challenge);
                self.complete = true;
                Ok(MechStep::Complete(Some(hmac(&self.secret, b"proof", &self.transcript))))
            }
            (false, Some(token)) if self.transcript.is_empty() => {
                self.transcript.extend_from_slice(token);
                self.transcript.extend_from_slice(b"challenge");
                Ok(MechStep::Continue(b"challenge".to_vec()))
            }
            (false, Some(proof)) => {
                if proof != hmac(&self.secret, b"proof", &self.transcript) {
                    return Err(SmbError::AuthFailed("bad proof".to_string()));
                }
                self.complete = true;
                Ok(MechStep::Complete(None))
            }
            (false, None) => Err(SmbError::Protocol("acceptor needs input".to_string())),
        }
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        self.complete
            .then(|| hmac(&self.secret, b"key", &self.transcript))
    }

    fn get_mic(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.complete.then(|| hmac(&self.secret, b"mic", data))
    }

    fn verify_mic(&self, data: &[u8], mic: &[u8]) -> SmbResult<()> {
        if hmac(&self.secret, b"mic", data) == mic {
            Ok(())
        } else {
            Err(SmbError::AuthFailed("mechListMIC mismatch".to_string()))
        }
    }
}

/// Two-leg NEGOEX auth scheme keyed by a shared secret
pub struct SecretScheme {
    secret: Vec<u8>,
    initiator: bool,
    complete: bool,
}

impl SecretScheme {
    pub fn boxed(secret: &[u8], initiator: bool) -> Box<dyn AuthScheme> {
        Box::new(Self {
            secret: secret.to_vec(),
            initiator,
            complete: false,
        })
    }

    fn mac(&self, usage: u32, data: &[u8]) -> Vec<u8> {
        hmac(&self.secret, &usage.to_le_bytes(), data)[..16].to_vec()
    }
}

impl AuthScheme for SecretScheme {
    fn scheme_id(&self) -> Guid {
        "5c33530d-eaf9-0d4d-b2ec-4ae3786ec308".parse().unwrap()
    }

    fn checksum_type(&self) -> u32 {
        16
    }

    fn step(&mut self, input: Option<&[u8]>) -> SmbResult<MechStep> {
        match (self.initiator, input) {
            (true, None) => Ok(MechStep::Continue(b"ap-req".to_vec())),
            (true, Some(b"challenge")) => {
                self.complete = true;
                Ok(MechStep::Complete(Some(b"ap-req-final".to_vec())))
            }
            (false, Some(b"ap-req")) => Ok(MechStep::Continue(b"challenge".to_vec())),
            (false, Some(b"ap-req-final")) => {
                self.complete = true;
                Ok(MechStep::Complete(None))
            }
            _ => Err(SmbError::AuthFailed("unexpected scheme token".to_string())),
        }
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        self.complete.then(|| self.mac(0, b"session"))
    }

    fn checksum(&self, key_usage: u32, data: &[u8]) -> SmbResult<Vec<u8>> {
        Ok(self.mac(key_usage, data))
    }

    fn verify_checksum(&self, key_usage: u32, data: &[u8], checksum: &[u8]) -> SmbResult<()> {
        if self.mac(key_usage, data) == checksum {
            Ok(())
        } else {
            Err(SmbError::AuthFailed("NEGOEX checksum mismatch".to_string()))
        }
    }
}

pub fn shared_secret_factory(secret: &'static [u8]) -> MechanismFactory {
    Arc::new(move || vec![Box::new(SharedSecret::acceptor(secret)) as Box<dyn Mechanism>])
}

pub fn negoex_factory(secret: &'static [u8]) -> MechanismFactory {
    Arc::new(move || {
        vec![Box::new(NegoexMechanism::new(
            Role::Acceptor,
            SecretScheme::boxed(secret, false),
        )) as Box<dyn Mechanism>]
    })
}

pub fn client_mechs(secret: &[u8]) -> Vec<Box<dyn Mechanism>> {
    vec![Box::new(SharedSecret::initiator(secret))]
}

pub fn negoex_client_mechs(secret: &[u8]) -> Vec<Box<dyn Mechanism>> {
    vec![Box::new(NegoexMechanism::new(
        Role::Initiator,
        SecretScheme::boxed(secret, true),
    ))]
}

pub fn server_config(extra: &[(&str, &str)]) -> ServerConfig {
    let mut pairs = vec![("server_guid", SERVER_GUID)];
    pairs.extend_from_slice(extra);
    ServerConfig::from_pairs(pairs).unwrap()
}

pub fn client_config(pairs: &[(&str, &str)]) -> ClientConfig {
    let mut pairs = pairs.to_vec();
    pairs.push(("request_timeout_ms", "5000"));
    ClientConfig::from_pairs(pairs).unwrap()
}

/// Serve one end of an in-memory pipe and return the other
pub fn spawn_server(server: Arc<SmbServer>) -> DuplexStream {
    let (client_io, server_io) = duplex(256 * 1024);
    tokio::spawn(async move {
        let _ = server.serve_connection(server_io).await;
    });
    client_io
}

/// Connect a client to a fresh in-memory connection of `server`
pub async fn connect(
    server: Arc<SmbServer>,
    config: ClientConfig,
    mechs: Vec<Box<dyn Mechanism>>,
) -> SmbResult<SmbClient> {
    SmbClient::connect(spawn_server(server), config, mechs).await
}

/// Hand-driven server end for ordering and credit tests
///
/// Runs the real handshake through [`CoreDispatcher`] on 3.1.1 so no signing
/// is involved, then leaves every response to the test.
pub struct FakeServer {
    io: DuplexStream,
    codec: ServerCodec,
    core: CoreDispatcher,
    buf: BytesMut,
}

impl FakeServer {
    pub fn new(io: DuplexStream) -> Self {
        let config = Arc::new(server_config(&[("dialects", "3.1.1")]));
        let core = CoreDispatcher::new(
            Arc::clone(&config),
            Arc::new(NotSupportedDispatcher),
            shared_secret_factory(SECRET),
            Arc::new(AtomicU64::new(0x4000)),
            FileTime::now(),
        );
        Self {
            io,
            codec: ServerCodec::new(config.max_frame_size),
            core,
            buf: BytesMut::new(),
        }
    }

    /// Next request from the client; cancel safe
    pub async fn recv(&mut self) -> Message {
        loop {
            if let Some(decoded) = self.codec.decode(&mut self.buf).unwrap() {
                match decoded.message {
                    Packet::Current(message) => return message,
                    _ => panic!("expected an SMB2 request"),
                }
            }
            let n = self.io.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    /// Answer `request`, granting `credit` credits
    pub async fn reply(&mut self, request: &Message, reply: Reply, credit: u16) {
        let payload = Self::response_bytes(request, reply, credit);
        self.send_raw(&payload).await;
    }

    /// Encoded response to `request`, for tests that alter it before sending
    pub fn response_bytes(request: &Message, mut reply: Reply, credit: u16) -> BytesMut {
        reply.header.credit_response = Some(credit);
        let mut payload = BytesMut::new();
        mirror(&request.header, reply).encode(&mut payload).unwrap();
        payload
    }

    /// Send message bytes as one frame
    pub async fn send_raw(&mut self, payload: &[u8]) {
        let mut out = BytesMut::new();
        write_frame(payload, &mut out).unwrap();
        self.io.write_all(&out).await.unwrap();
    }

    /// Answer NEGOTIATE and SESSION_SETUP until the session is up
    ///
    /// Every handshake response grants one credit except the last, which
    /// grants `final_grant`.
    pub async fn handshake(&mut self, final_grant: u16) {
        let negotiate = self.recv().await;
        let out = self.core.dispatch(&negotiate).await;
        self.reply(&negotiate, out.reply, 1).await;

        loop {
            let setup = self.recv().await;
            let out = self.core.dispatch(&setup).await;
            assert!(out.effect.is_none(), "3.1.1 sessions are not signed");
            let done = out.reply.header.status.is_none();
            let grant = if done { final_grant } else { 1 };
            self.reply(&setup, out.reply, grant).await;
            if done {
                return;
            }
        }
    }
}

/// Client connected to a [`FakeServer`] that has completed the handshake
pub async fn connect_fake(final_grant: u16) -> (SmbClient, FakeServer) {
    let (client_io, server_io) = duplex(256 * 1024);
    let mut fake = FakeServer::new(server_io);
    let config = client_config(&[("min_dialect", "3.1.1"), ("max_dialect", "3.1.1")]);
    let (client, ()) = tokio::join!(
        SmbClient::connect(client_io, config, client_mechs(SECRET)),
        fake.handshake(final_grant),
    );
    (client.unwrap(), fake)
}
