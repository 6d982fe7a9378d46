// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The seam between the lifecycle engine and the protocol wire code.
//!
//! A driver owns everything HTTP-shaped: it parses bytes into requests and
//! serializes responses back through the connection's `write`. The engine
//! only pumps bytes, spawns respond tasks, and enforces lifecycle rules.

use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    connection::connection::Connection,
    http::{request::Request, response::Response},
};

/// Resolves when a paused parser is ready to continue. Resolving with an
/// error closes the connection.
pub type ResumeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// One advancement of the request parser.
pub enum ParseStep {
    /// The parser consumed everything it was given; feed it the next read.
    NeedInput,
    /// Backpressure: stop reading until the future resolves, then step the
    /// parser once with no input.
    Wait(ResumeFuture),
    /// A complete request came off the wire. Step again with no input to
    /// drain any pipelined remainder.
    Request(Request),
}

/// Incremental request parser state machine produced by a driver for one
/// connection. Driven exclusively by that connection's I/O task.
pub trait RequestParser: Send {
    /// Advances the parser. `None` input is a bare step: priming at start,
    /// the post-`Wait` resume, and the continuation after an emitted
    /// request.
    fn step(&mut self, input: Option<&[u8]>) -> Result<ParseStep>;
}

/// Per-connection protocol driver.
///
/// Contract: `write_response` serializes responses in the order requests
/// were parsed; the single write queue preserves that order on the wire.
#[async_trait]
pub trait HttpDriver: Send + Sync {
    /// Builds the parser for this connection. Called once, after the TLS
    /// handshake (if any) completed.
    fn setup(&self, conn: &Arc<Connection>) -> Box<dyn RequestParser>;

    /// Requests parsed but not yet answered. The timeout reaper compares
    /// this against the connection's pending responses to detect an
    /// actively-writing connection.
    fn pending_requests(&self) -> usize;

    /// Streams `response` out through `conn.write`, honoring drain
    /// backpressure between body chunks.
    async fn write_response(
        &self,
        conn: &Arc<Connection>,
        request: &Request,
        response: Response,
    ) -> Result<()>;
}

/// Picks a driver for a freshly accepted connection, typically from the
/// negotiated ALPN protocol (`conn.tls_info()`).
pub trait HttpDriverFactory: Send + Sync {
    fn select(&self, conn: &Connection) -> Arc<dyn HttpDriver>;
}
