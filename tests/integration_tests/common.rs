// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared fixtures: a minimal HTTP/1.1-flavored driver, a few handlers, and
//! socket helpers. The driver exists so the lifecycle engine has a protocol
//! to pump; it parses a request head up to the blank line and serializes
//! `status line + headers + Content-Length + body`, closing after the
//! response when the request asked for `Connection: close`.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use http_server_rs::{
    cfg::config::ServerOptions,
    connection::connection::{ClientContext, ClientFactory, Connection, DefaultClientFactory},
    driver::{HttpDriver, HttpDriverFactory, ParseStep, RequestParser},
    handler::RequestHandler,
    http::{request::Request, response::Response},
    server::{acceptor::Listener, server::Server},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};

pub struct TestParser {
    buf: Vec<u8>,
}

impl RequestParser for TestParser {
    fn step(&mut self, input: Option<&[u8]>) -> Result<ParseStep> {
        if let Some(input) = input {
            self.buf.extend_from_slice(input);
        }
        match parse_head(&mut self.buf) {
            Some(request) => Ok(ParseStep::Request(request)),
            None => Ok(ParseStep::NeedInput),
        }
    }
}

/// Takes one `request line + headers + blank line` head off the front of
/// `buf`, if a complete one is buffered.
pub fn parse_head(buf: &mut Vec<u8>) -> Option<Request> {
    let head_end = find(buf, b"\r\n\r\n")?;

    let head: Vec<u8> = buf.drain(..head_end + 4).collect();
    let text = String::from_utf8_lossy(&head[..head_end]).into_owned();
    let mut lines = text.split("\r\n");

    let mut parts = lines.next().unwrap_or_default().split(' ');
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or("/").to_string();

    let mut request = Request::new(method, target);
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            request.headers.insert(name.trim(), value.trim());
        }
    }
    Some(request)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Default)]
pub struct TestDriver;

#[async_trait]
impl HttpDriver for TestDriver {
    fn setup(&self, _conn: &Arc<Connection>) -> Box<dyn RequestParser> {
        Box::new(TestParser { buf: Vec::new() })
    }

    fn pending_requests(&self) -> usize {
        // Requests are dispatched as soon as they are parsed; nothing queues.
        0
    }

    async fn write_response(
        &self,
        conn: &Arc<Connection>,
        request: &Request,
        response: Response,
    ) -> Result<()> {
        let close = request
            .headers
            .get("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));

        let mut wire = format!(
            "{} {} {}\r\n",
            request.version, response.status, response.reason
        )
        .into_bytes();
        for (name, value) in response.headers.iter() {
            wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        wire.extend_from_slice(
            format!("Content-Length: {}\r\n\r\n", response.body.len()).as_bytes(),
        );
        wire.extend_from_slice(&response.body);

        conn.write(&wire, close).wait().await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct TestDriverFactory {
    driver: Arc<TestDriver>,
}

impl HttpDriverFactory for TestDriverFactory {
    fn select(&self, _conn: &Connection) -> Arc<dyn HttpDriver> {
        self.driver.clone()
    }
}

/// 200 with `echo:<target>` as the body.
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        Ok(Response::new(200).with_body(format!("echo:{}", request.target)))
    }
}

/// Sleeps before answering; used to exercise drain windows and the
/// busy-connection deferral.
pub struct SleepHandler(pub Duration);

#[async_trait]
impl RequestHandler for SleepHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        sleep(self.0).await;
        Ok(Response::new(200).with_body(format!("slept:{}", request.target)))
    }
}

/// Always fails, to exercise the exception-response paths.
pub struct FailHandler;

#[async_trait]
impl RequestHandler for FailHandler {
    async fn handle(&self, _request: Request) -> Result<Response> {
        anyhow::bail!("handler exploded <deliberately>")
    }
}

/// Client factory that records every connection it builds, so tests can
/// reach the `Connection` values behind a live server.
#[derive(Default)]
pub struct CapturingFactory {
    inner: DefaultClientFactory,
    captured: Mutex<Vec<Arc<Connection>>>,
}

impl CapturingFactory {
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.captured.lock().expect("captured lock").clone()
    }
}

impl ClientFactory for CapturingFactory {
    fn create(&self, ctx: ClientContext) -> Arc<Connection> {
        let conn = self.inner.create(ctx);
        self.captured
            .lock()
            .expect("captured lock")
            .push(conn.clone());
        conn
    }
}

/// Boots a server with the test driver on an ephemeral loopback port.
pub async fn start_server(
    options: ServerOptions,
    handler: Arc<dyn RequestHandler>,
) -> (Arc<Server>, SocketAddr) {
    let server = Server::new(options, handler, Arc::new(TestDriverFactory::default()));
    server
        .add_listener(Listener::bind("127.0.0.1:0").await.expect("bind"))
        .expect("add listener");
    server.start().expect("start");
    let addr = server.local_addrs()[0];
    (server, addr)
}

/// One-shot request: connect, write the raw bytes, read to EOF. The request
/// should carry `Connection: close` so the server ends the stream.
pub async fn http_request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw.as_bytes()).await.expect("write");
    let mut out = String::new();
    stream.read_to_string(&mut out).await.expect("read");
    out
}

/// Reads from `stream` until the accumulated text contains `pattern`.
pub async fn read_until(stream: &mut TcpStream, pattern: &str) -> String {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let text = String::from_utf8_lossy(&out).into_owned();
        if text.contains(pattern) {
            return text;
        }
        let n = stream.read(&mut chunk).await.expect("read");
        assert!(n > 0, "stream closed before {pattern:?} arrived");
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Polls `cond` for up to five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

pub fn options() -> ServerOptions {
    ServerOptions::default()
}
