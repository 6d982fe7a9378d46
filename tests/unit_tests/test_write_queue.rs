// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use http_server_rs::{
    connection::write_queue::{FlushEvent, WriteQueue},
    error::ConnectionError,
};
use tokio::io::AsyncReadExt;

#[tokio::test]
async fn bytes_reach_the_wire_in_call_order() {
    let queue = WriteQueue::new();
    let (mut server, mut client) = tokio::io::duplex(1024);

    let d1 = queue.write(b"hello ", false);
    let d2 = queue.write(b"world", false);
    assert!(queue.pending_bytes() > 0);

    let event = queue.flush(&mut server).await.expect("flush");
    assert_eq!(event, FlushEvent::Drained);
    assert_eq!(queue.pending_bytes(), 0);

    d1.wait().await.expect("first drain");
    d2.wait().await.expect("second drain");

    let mut out = [0u8; 11];
    client.read_exact(&mut out).await.expect("read");
    assert_eq!(&out, b"hello world");
}

#[tokio::test]
async fn empty_write_with_empty_buffer_completes_immediately() {
    let queue = WriteQueue::new();
    let drain = queue.write(b"", false);
    assert!(drain.is_ready());
    drain.wait().await.expect("ready drain");
}

#[tokio::test]
async fn writes_behind_an_outstanding_drain_share_its_boundary() {
    let queue = WriteQueue::new();
    let (mut server, mut client) = tokio::io::duplex(1024);

    let first = queue.write(b"a", false);
    // Issued while the first drain is outstanding: same boundary.
    let second = queue.write(b"", false);
    assert!(!second.is_ready());

    queue.flush(&mut server).await.expect("flush");
    first.wait().await.expect("first");
    second.wait().await.expect("second");

    let mut out = [0u8; 1];
    client.read_exact(&mut out).await.expect("read");
    assert_eq!(&out, b"a");
}

#[tokio::test]
async fn flush_on_idle_queue_reports_idle() {
    let queue = WriteQueue::new();
    let (mut server, _client) = tokio::io::duplex(64);
    let event = queue.flush(&mut server).await.expect("flush");
    assert_eq!(event, FlushEvent::Idle);
}

#[tokio::test]
async fn close_after_rejects_later_writes_and_requests_shutdown() {
    let queue = WriteQueue::new();
    let (mut server, mut client) = tokio::io::duplex(1024);

    let last = queue.write(b"bye", true);
    assert!(queue.is_write_closed());

    let refused = queue.write(b"more", false);
    assert!(matches!(
        refused.wait().await,
        Err(ConnectionError::Disconnected)
    ));

    let event = queue.flush(&mut server).await.expect("flush");
    assert_eq!(event, FlushEvent::Shutdown);
    last.wait().await.expect("final drain");

    let mut out = [0u8; 3];
    client.read_exact(&mut out).await.expect("read");
    assert_eq!(&out, b"bye");
}

#[tokio::test]
async fn peer_loss_fails_the_drain_and_later_writes() {
    let queue = WriteQueue::new();
    let (mut server, client) = tokio::io::duplex(8);
    drop(client);

    let pending = queue.write(b"lost", false);
    let err = queue.flush(&mut server).await.expect_err("flush must fail");
    assert!(matches!(
        err,
        ConnectionError::Disconnected | ConnectionError::Io(_)
    ));
    assert!(matches!(
        pending.wait().await,
        Err(ConnectionError::Disconnected)
    ));

    let refused = queue.write(b"x", false);
    assert!(matches!(
        refused.wait().await,
        Err(ConnectionError::Disconnected)
    ));
}
