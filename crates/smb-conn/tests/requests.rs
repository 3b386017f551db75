//! Requests over an established session

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::*;
use smb_conn::{Request, RequestDispatcher, SmbClient, SmbServer};
use smb_proto::protocol::{Body, Command, Message, Reply, SessionSetupResponse};
use smb_proto::{NtStatus, SmbError, SmbResult};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

/// Answers READ with the request body reversed and FLUSH with a reply too
/// large to encode
struct Mirror;

#[async_trait]
impl RequestDispatcher for Mirror {
    async fn dispatch(&self, request: &Message) -> SmbResult<Reply> {
        match (&request.header.command, &request.body) {
            (Command::Read, Body::Opaque(data)) => {
                let reversed: Vec<u8> = data.iter().rev().copied().collect();
                Ok(Reply::ok(Body::Opaque(Bytes::from(reversed))))
            }
            // A reply whose security buffer overflows its length field
            (Command::Flush, _) => Ok(Reply::ok(Body::SessionSetupResponse(
                SessionSetupResponse {
                    security_buffer: Bytes::from(vec![0u8; 70_000]),
                    ..Default::default()
                },
            ))),
            _ => Err(SmbError::NtStatus(NtStatus::NotSupported)),
        }
    }
}

fn server(extra: &[(&str, &str)]) -> Arc<SmbServer> {
    Arc::new(SmbServer::with_dispatcher(
        server_config(extra),
        shared_secret_factory(SECRET),
        Arc::new(Mirror),
    ))
}

#[tokio::test]
async fn test_echo_then_logoff() {
    let client = connect(server(&[]), client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    client.echo().await.unwrap();
    client.echo().await.unwrap();
    client.logoff().await.unwrap();
    assert!(client.session().is_none());
    assert_eq!(client.dialect(), None);

    // ECHO needs no session
    client.echo().await.unwrap();
    let err = client
        .request(Command::Read, Body::Opaque(Bytes::from_static(b"abc")))
        .await
        .unwrap_err();
    assert!(matches!(err, SmbError::NtStatus(NtStatus::UserSessionDeleted)));
}

#[tokio::test]
async fn test_application_commands_reach_dispatcher() {
    let client = connect(server(&[]), client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let response = client
        .request(Command::Read, Body::Opaque(Bytes::from_static(b"abc")))
        .await
        .unwrap();
    assert!(response.header.is_response());
    assert!(response.header.is_signed());
    assert_eq!(response.status(), NtStatus::Success);
    assert_eq!(response.body, Body::Opaque(Bytes::from_static(b"cba")));
}

#[tokio::test]
async fn test_unhandled_command_is_not_supported() {
    let client = connect(server(&[]), client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let err = client
        .request(Command::Write, Body::Opaque(Bytes::from_static(b"xyz")))
        .await
        .unwrap_err();
    assert!(matches!(err, SmbError::NtStatus(NtStatus::NotSupported)));

    // The connection survives an error status
    client.echo().await.unwrap();
}

#[tokio::test]
async fn test_unencodable_reply_becomes_error_status() {
    let client = connect(server(&[]), client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let err = client
        .request(Command::Flush, Body::Opaque(Bytes::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SmbError::NtStatus(NtStatus::InvalidParameter)));
    client.echo().await.unwrap();
}

#[tokio::test]
async fn test_default_server_rejects_application_commands() {
    let server = Arc::new(SmbServer::new(
        server_config(&[]),
        shared_secret_factory(SECRET),
    ));
    let client = connect(server, client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let err = client
        .request(Command::Create, Body::Opaque(Bytes::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SmbError::NtStatus(NtStatus::NotSupported)));
}

#[tokio::test]
async fn test_handshake_commands_are_refused() {
    let client = connect(server(&[]), client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let err = client
        .request(Command::Negotiate, Body::Empty)
        .await
        .unwrap_err();
    assert!(matches!(err, SmbError::NotSupported(_)));
}

#[tokio::test]
async fn test_concurrent_requests_share_connection() {
    let client = connect(
        server(&[]),
        client_config(&[("credits.default_credits", "8")]),
        client_mechs(SECRET),
    )
    .await
    .unwrap();

    let requests = (0..16u8).map(|i| {
        let client = client.clone();
        tokio::spawn(async move {
            let response = client
                .request(Command::Read, Body::Opaque(Bytes::from(vec![i, 0xFF])))
                .await
                .unwrap();
            (i, response)
        })
    });
    let handles: Vec<_> = requests.collect();
    for handle in handles {
        let (i, response) = handle.await.unwrap();
        assert_eq!(response.body, Body::Opaque(Bytes::from(vec![0xFF, i])));
    }
}

const FLAGS_SIGNED: u8 = 0x08;

fn command_of(payload: &[u8]) -> u16 {
    u16::from_le_bytes([payload[12], payload[13]])
}

fn status_of(payload: &[u8]) -> u32 {
    u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]])
}

fn flip_echo_signature(payload: &mut [u8]) {
    if command_of(payload) == Command::Echo as u16 {
        payload[48] ^= 0x01;
    }
}

fn untouched(_: &mut [u8]) {}

/// Forward frames from `from` to `to`, letting `tamper` rewrite each one
async fn relay<R, W, F>(mut from: R, mut to: W, mut tamper: F)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&mut [u8]),
{
    loop {
        let mut prefix = [0u8; 4];
        if from.read_exact(&mut prefix).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        if from.read_exact(&mut payload).await.is_err() {
            break;
        }
        tamper(&mut payload);
        if to.write_all(&prefix).await.is_err() || to.write_all(&payload).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown().await;
}

/// Client end of a connection to `server` that passes through tampering relays
fn relayed<U, D>(server: Arc<SmbServer>, upstream: U, downstream: D) -> DuplexStream
where
    U: FnMut(&mut [u8]) + Send + 'static,
    D: FnMut(&mut [u8]) + Send + 'static,
{
    let server_side = spawn_server(server);
    let (client_io, proxy_io) = duplex(256 * 1024);
    let (proxy_read, proxy_write) = tokio::io::split(proxy_io);
    let (server_read, server_write) = tokio::io::split(server_side);
    tokio::spawn(relay(proxy_read, server_write, upstream));
    tokio::spawn(relay(server_read, proxy_write, downstream));
    client_io
}

fn signed_server() -> Arc<SmbServer> {
    server(&[("dialects", "3.0"), ("signing_required", "true")])
}

#[tokio::test]
async fn test_tampered_request_closes_signed_connection() {
    let io = relayed(signed_server(), flip_echo_signature, untouched);
    let client = SmbClient::connect(io, client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();
    assert!(client.session().unwrap().signing_required);

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::NtStatus(NtStatus::AccessDenied)));

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::ConnectionClosed));
}

#[tokio::test]
async fn test_tampered_response_closes_signed_connection() {
    let io = relayed(signed_server(), untouched, flip_echo_signature);
    let client = SmbClient::connect(io, client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::Signature(_)));

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::ConnectionClosed));
}

#[tokio::test]
async fn test_unsigned_response_closes_signed_connection() {
    let strip = |payload: &mut [u8]| {
        if command_of(payload) == Command::Echo as u16 {
            payload[16] &= !FLAGS_SIGNED;
        }
    };
    let io = relayed(signed_server(), untouched, strip);
    let client = SmbClient::connect(io, client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::Signature(_)));

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::ConnectionClosed));
}

#[tokio::test]
async fn test_unsigned_final_session_setup_fails_connect() {
    let strip = |payload: &mut [u8]| {
        if command_of(payload) == Command::SessionSetup as u16
            && status_of(payload) == NtStatus::Success.as_u32()
        {
            payload[16] &= !FLAGS_SIGNED;
        }
    };
    let io = relayed(signed_server(), untouched, strip);
    let result = SmbClient::connect(io, client_config(&[]), client_mechs(SECRET)).await;
    assert!(matches!(result, Err(SmbError::Signature(_))));
}

#[tokio::test]
async fn test_tampered_response_fails_request_on_optional_signing() {
    let mut tampered = false;
    let flip_first = move |payload: &mut [u8]| {
        if !tampered && command_of(payload) == Command::Echo as u16 {
            tampered = true;
            flip_echo_signature(payload);
        }
    };
    let io = relayed(server(&[("dialects", "3.0")]), untouched, flip_first);
    let client = SmbClient::connect(io, client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();
    assert!(!client.session().unwrap().signing_required);

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::Signature(_)));
    // Only the request is failed, the connection stays up
    client.echo().await.unwrap();
}

#[tokio::test]
async fn test_rejected_response_grants_no_credits() {
    let mut tampered = false;
    let flip_first = move |payload: &mut [u8]| {
        if !tampered && command_of(payload) == Command::Echo as u16 {
            tampered = true;
            flip_echo_signature(payload);
        }
    };
    // One credit per response keeps the client at exactly one in flight
    let server = server(&[
        ("dialects", "3.0"),
        ("credits.setup_credits", "1"),
        ("credits.default_credits", "1"),
        ("credits.max_credits", "1"),
    ]);
    let io = relayed(server, untouched, flip_first);
    let client = SmbClient::connect(io, client_config(&[]), client_mechs(SECRET))
        .await
        .unwrap();

    let err = client.echo().await.unwrap_err();
    assert!(matches!(err, SmbError::Signature(_)));

    // The rejected response's credit never arrived, so nothing can be sent
    let err = client
        .send_with_timeout(
            Request::new(Command::Echo, Body::Empty),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SmbError::Timeout));
}
