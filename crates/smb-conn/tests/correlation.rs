//! Response correlation, interim responses and credit flow against a
//! scripted server

mod common;

use std::time::Duration;

use common::*;
use smb_conn::Request;
use smb_proto::protocol::{Body, Command, Reply, SMB2_HEADER_SIZE};
use smb_proto::{NtStatus, SmbError};

#[tokio::test]
async fn test_out_of_order_responses() {
    let (client, mut fake) = connect_fake(8).await;

    let c = client.clone();
    let requests = tokio::spawn(async move {
        tokio::join!(
            c.request(Command::Echo, Body::Empty),
            c.request(Command::Echo, Body::Empty),
        )
    });

    let first = fake.recv().await;
    let second = fake.recv().await;
    assert_ne!(first.header.message_id, second.header.message_id);
    fake.reply(&second, Reply::ok(Body::Empty), 1).await;
    fake.reply(&first, Reply::ok(Body::Empty), 1).await;

    let (a, b) = requests.await.unwrap();
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.header.message_id, first.header.message_id);
    assert_eq!(b.header.message_id, second.header.message_id);
}

#[tokio::test]
async fn test_interim_response_then_final() {
    let (client, mut fake) = connect_fake(8).await;

    let c = client.clone();
    let request = tokio::spawn(async move { c.request(Command::Echo, Body::Empty).await });

    let echo = fake.recv().await;
    let mut interim = Reply::error(NtStatus::Pending);
    interim.header.async_id = Some(0x77);
    fake.reply(&echo, interim, 1).await;

    // The caller is still waiting after the interim response
    tokio::task::yield_now().await;
    assert!(!request.is_finished());

    let mut done = Reply::ok(Body::Empty);
    done.header.async_id = Some(0x77);
    fake.reply(&echo, done, 1).await;

    let response = request.await.unwrap().unwrap();
    assert!(response.header.is_async());
    assert_eq!(response.header.async_id, 0x77);
    assert_eq!(response.header.message_id, echo.header.message_id);
    assert_eq!(response.status(), NtStatus::Success);
}

#[tokio::test]
async fn test_requests_wait_for_credits() {
    let (client, mut fake) = connect_fake(1).await;

    let c = client.clone();
    let requests = tokio::spawn(async move {
        tokio::join!(
            c.request(Command::Echo, Body::Empty),
            c.request(Command::Echo, Body::Empty),
            c.request(Command::Echo, Body::Empty),
        )
    });

    let first = fake.recv().await;
    // No credit is left for the other two
    assert!(tokio::time::timeout(Duration::from_millis(50), fake.recv())
        .await
        .is_err());

    fake.reply(&first, Reply::ok(Body::Empty), 2).await;
    let second = fake.recv().await;
    let third = fake.recv().await;
    assert_eq!(second.header.message_id, first.header.message_id + 1);
    assert_eq!(third.header.message_id, first.header.message_id + 2);

    fake.reply(&third, Reply::ok(Body::Empty), 1).await;
    fake.reply(&second, Reply::ok(Body::Empty), 1).await;

    let (a, b, c) = requests.await.unwrap();
    assert_eq!(a.unwrap().header.message_id, first.header.message_id);
    assert_eq!(b.unwrap().header.message_id, second.header.message_id);
    assert_eq!(c.unwrap().header.message_id, third.header.message_id);
}

#[tokio::test]
async fn test_error_status_surfaces_to_caller() {
    let (client, mut fake) = connect_fake(8).await;

    let c = client.clone();
    let request = tokio::spawn(async move { c.request(Command::Echo, Body::Empty).await });

    let echo = fake.recv().await;
    fake.reply(&echo, Reply::error(NtStatus::AccessDenied), 1).await;
    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, SmbError::NtStatus(NtStatus::AccessDenied)));
}

#[tokio::test]
async fn test_timeout_cancels_async_request() {
    let (client, mut fake) = connect_fake(8).await;

    let c = client.clone();
    let request = tokio::spawn(async move {
        c.send_with_timeout(Request::new(Command::Echo, Body::Empty), Duration::from_millis(100))
            .await
    });

    let echo = fake.recv().await;
    let mut interim = Reply::error(NtStatus::Pending);
    interim.header.async_id = Some(0x99);
    fake.reply(&echo, interim, 1).await;

    let cancel = fake.recv().await;
    assert_eq!(cancel.header.command, Command::Cancel);
    assert_eq!(cancel.header.message_id, echo.header.message_id);
    assert_eq!(cancel.header.credit, 0);
    assert!(cancel.header.is_async());
    assert_eq!(cancel.header.async_id, 0x99);

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, SmbError::Timeout));

    // The late final response is dropped and its credits still count
    let mut cancelled = Reply::error(NtStatus::Cancelled);
    cancelled.header.async_id = Some(0x99);
    fake.reply(&echo, cancelled, 1).await;

    let c = client.clone();
    let next = tokio::spawn(async move { c.request(Command::Echo, Body::Empty).await });
    let echo2 = fake.recv().await;
    assert!(echo2.header.message_id > echo.header.message_id);
    fake.reply(&echo2, Reply::ok(Body::Empty), 1).await;
    next.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_timeout_before_send_never_reaches_wire() {
    let (client, mut fake) = connect_fake(1).await;

    let c = client.clone();
    let held = tokio::spawn(async move { c.request(Command::Echo, Body::Empty).await });
    let first = fake.recv().await;

    // No credits: this one stays queued and times out locally
    let err = client
        .send_with_timeout(
            Request::new(Command::Echo, Body::Empty),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SmbError::Timeout));

    fake.reply(&first, Reply::ok(Body::Empty), 1).await;
    held.await.unwrap().unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(50), fake.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_undecodable_response_fails_request_and_keeps_credits() {
    let (client, mut fake) = connect_fake(1).await;

    let c = client.clone();
    let request = tokio::spawn(async move {
        c.send_with_timeout(Request::new(Command::Echo, Body::Empty), Duration::from_secs(2))
            .await
    });
    let echo = fake.recv().await;
    let mut payload = FakeServer::response_bytes(&echo, Reply::ok(Body::Empty), 5);
    // ECHO StructureSize must be 4
    payload[SMB2_HEADER_SIZE] = 5;
    fake.send_raw(&payload).await;

    let err = tokio::time::timeout(Duration::from_millis(500), request)
        .await
        .expect("caller resolved before its deadline")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SmbError::Protocol(_)));

    // The five credits of the bad response let five requests out at once
    let c = client.clone();
    let burst = tokio::spawn(async move {
        tokio::join!(
            c.request(Command::Echo, Body::Empty),
            c.request(Command::Echo, Body::Empty),
            c.request(Command::Echo, Body::Empty),
            c.request(Command::Echo, Body::Empty),
            c.request(Command::Echo, Body::Empty),
        )
    });
    let mut echoes = Vec::new();
    for _ in 0..5 {
        echoes.push(fake.recv().await);
    }
    for echo in &echoes {
        fake.reply(echo, Reply::ok(Body::Empty), 1).await;
    }
    let (a, b, c, d, e) = burst.await.unwrap();
    for result in [a, b, c, d, e] {
        result.unwrap();
    }
}

#[tokio::test]
async fn test_server_close_fails_pending_requests() {
    let (client, mut fake) = connect_fake(8).await;

    let c = client.clone();
    let request = tokio::spawn(async move { c.request(Command::Echo, Body::Empty).await });
    let _echo = fake.recv().await;
    drop(fake);

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, SmbError::ConnectionClosed));
    assert!(matches!(client.echo().await, Err(SmbError::ConnectionClosed)));
}
