// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use http_server_rs::server::server::ServerStatus;
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};

use crate::integration_tests::common::{SleepHandler, start_server, options};

#[tokio::test]
#[serial]
async fn graceful_stop_drains_the_inflight_response() {
    let (server, addr) =
        start_server(options(), Arc::new(SleepHandler(Duration::from_millis(500)))).await;

    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(b"GET /slow HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");

    // Let the request reach the handler before stopping.
    sleep(Duration::from_millis(150)).await;

    server.stop(Duration::from_secs(2)).await.expect("stop");
    assert_eq!(server.status(), ServerStatus::Stopped);

    // The in-flight response completed within the drain window.
    let mut response = String::new();
    client.read_to_string(&mut response).await.expect("read");
    assert!(response.contains("200 OK"), "{response}");
    assert!(response.ends_with("slept:/slow"), "{response}");

    // The listener is gone: no new accept can occur.
    match TcpStream::connect(addr).await {
        Err(_) => {},
        Ok(mut stream) => {
            let mut buf = [0u8; 1];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            assert_eq!(n, 0, "no listener may serve new connections");
        },
    }
}

#[tokio::test]
#[serial]
async fn stop_force_closes_connections_past_the_deadline() {
    let (server, addr) =
        start_server(options(), Arc::new(SleepHandler(Duration::from_secs(5)))).await;

    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(b"GET /very-slow HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    sleep(Duration::from_millis(150)).await;

    let before = tokio::time::Instant::now();
    server.stop(Duration::from_millis(300)).await.expect("stop");
    assert!(before.elapsed() < Duration::from_secs(3));
    assert_eq!(server.status(), ServerStatus::Stopped);

    // The straggler was force-closed without its response.
    let mut response = String::new();
    client.read_to_string(&mut response).await.expect("read");
    assert!(!response.contains("200 OK"), "{response}");
}
