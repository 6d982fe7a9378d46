// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use http_server_rs::{
    connection::stream::DetachedSocket,
    handler::RequestHandler,
    http::{
        request::Request,
        response::{Response, UpgradeHandler},
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::integration_tests::common::{options, read_until, start_server, wait_for};

/// Echoes one line back with a marker, then drops the socket, which is what
/// releases the server-side bookkeeping.
struct LineEcho;

#[async_trait]
impl UpgradeHandler for LineEcho {
    async fn handle(&self, socket: DetachedSocket) {
        let mut socket = BufReader::new(socket);
        let mut line = String::new();
        if socket.read_line(&mut line).await.is_ok() {
            let reply = format!("detached:{}", line.trim_end());
            let _ = socket.get_mut().write_all(reply.as_bytes()).await;
            let _ = socket.get_mut().shutdown().await;
        }
    }
}

struct UpgradingHandler;

#[async_trait]
impl RequestHandler for UpgradingHandler {
    async fn handle(&self, _request: Request) -> Result<Response> {
        Ok(Response::new(200).with_upgrade(Arc::new(LineEcho)))
    }
}

#[tokio::test]
async fn export_hands_the_socket_to_the_upgrade_owner() {
    let (server, addr) = start_server(options(), Arc::new(UpgradingHandler)).await;

    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(b"GET /upgrade HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .expect("write request");

    // Wait for the full response head before speaking the detached protocol.
    let head = read_until(&mut client, "\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");

    // The server still tracks the exported connection until the detached
    // owner finishes.
    assert_eq!(server.client_count(), 1);

    client.write_all(b"ping\n").await.expect("write line");
    let mut reply = String::new();
    client.read_to_string(&mut reply).await.expect("read reply");
    assert_eq!(reply, "detached:ping");

    // Dropping the surrogate fired the on-close hooks.
    assert!(wait_for(|| server.client_count() == 0).await);
    server.stop(Duration::from_secs(1)).await.expect("stop");
}
