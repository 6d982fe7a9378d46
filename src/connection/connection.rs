// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Notify, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    cfg::config::ServerOptions,
    connection::{
        stream::{DetachedSocket, Peer, ServerStream, TlsInfo, TlsNegotiator},
        write_queue::{Drain, FlushEvent, WriteQueue},
    },
    driver::{HttpDriver, HttpDriverFactory, ParseStep, RequestParser, ResumeFuture},
    error::{ConnectionError, StateError, is_client_disconnected},
    handler::{ErrorHandler, RequestHandler},
    http::{
        request::Request,
        response::{Response, UpgradeHandler},
        templates,
    },
    server::timeout_cache::TimeoutCache,
};

bitflags::bitflags! {
    /// Close status bits. Transitions are monotonic; full-closed is both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloseState: u8 {
        const READ_CLOSED = 0b0000_0001;
        const WRITE_CLOSED = 0b0000_0010;
        const CLOSED = Self::READ_CLOSED.bits() | Self::WRITE_CLOSED.bits();
    }
}

type OnClose = Box<dyn FnOnce(&Connection) + Send>;

/// Everything a factory needs to build a connection.
pub struct ClientContext {
    pub id: u64,
    pub io: ServerStream,
    pub local: Option<SocketAddr>,
    pub peer: Peer,
    pub tls: Option<TlsNegotiator>,
    pub driver_factory: Arc<dyn HttpDriverFactory>,
    pub handler: Arc<dyn RequestHandler>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub options: Arc<ServerOptions>,
    pub timeouts: Arc<TimeoutCache>,
}

/// Builds connections for the acceptor. Replaceable while the server is
/// stopped; the default simply constructs [`Connection`].
pub trait ClientFactory: Send + Sync {
    fn create(&self, ctx: ClientContext) -> Arc<Connection>;
}

#[derive(Debug, Default)]
pub struct DefaultClientFactory;

impl ClientFactory for DefaultClientFactory {
    fn create(&self, ctx: ClientContext) -> Arc<Connection> {
        Connection::new(ctx)
    }
}

struct ExportedIo {
    io: ServerStream,
    readahead: Bytes,
}

enum LoopExit {
    Close,
    Export,
}

/// Server-side per-socket state machine.
///
/// All socket I/O happens on the connection's own task (spawned by
/// [`start`](Self::start)); respond work runs in one task per parsed
/// request. The write queue serializes outbound bytes, the cancellation
/// token is the close primitive.
pub struct Connection {
    id: u64,
    local: Option<SocketAddr>,
    peer: Peer,

    status: AtomicU8,
    paused: AtomicBool,
    reads_suspended: AtomicBool,
    exported: AtomicBool,
    closed: AtomicBool,
    started: AtomicBool,
    pending_responses: AtomicUsize,

    write_q: WriteQueue,
    cancel: CancellationToken,
    export_wake: Notify,
    export_slot: Mutex<Option<oneshot::Sender<ExportedIo>>>,
    io_slot: Mutex<Option<ServerStream>>,
    on_close: Mutex<Vec<OnClose>>,

    crypto: OnceCell<TlsInfo>,
    driver: OnceCell<Arc<dyn HttpDriver>>,

    tls: Option<TlsNegotiator>,
    driver_factory: Arc<dyn HttpDriverFactory>,
    handler: Arc<dyn RequestHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    options: Arc<ServerOptions>,
    timeouts: Arc<TimeoutCache>,
}

impl Connection {
    pub fn new(ctx: ClientContext) -> Arc<Self> {
        Arc::new(Self {
            id: ctx.id,
            local: ctx.local,
            peer: ctx.peer,
            status: AtomicU8::new(CloseState::empty().bits()),
            paused: AtomicBool::new(false),
            reads_suspended: AtomicBool::new(false),
            exported: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            pending_responses: AtomicUsize::new(0),
            write_q: WriteQueue::new(),
            cancel: CancellationToken::new(),
            export_wake: Notify::new(),
            export_slot: Mutex::new(None),
            io_slot: Mutex::new(Some(ctx.io)),
            on_close: Mutex::new(Vec::new()),
            crypto: OnceCell::new(),
            driver: OnceCell::new(),
            tls: ctx.tls,
            driver_factory: ctx.driver_factory,
            handler: ctx.handler,
            error_handler: ctx.error_handler,
            options: ctx.options,
            timeouts: ctx.timeouts,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Handshake metadata; `None` iff the connection is plaintext.
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.crypto.get()
    }

    pub fn status(&self) -> CloseState {
        CloseState::from_bits_retain(self.status.load(Ordering::SeqCst))
    }

    /// Handler invocations not yet fully written.
    pub fn pending_responses(&self) -> usize {
        self.pending_responses.load(Ordering::SeqCst)
    }

    /// The read pump is suspended on a parser-returned future.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_exported(&self) -> bool {
        self.exported.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &Arc<ServerOptions> {
        &self.options
    }

    /// Still writing a response: more handler invocations in flight than the
    /// driver has unanswered requests. The timeout reaper defers such
    /// connections instead of closing them.
    pub fn is_busy(&self) -> bool {
        let parsed = self.driver.get().map_or(0, |d| d.pending_requests());
        self.pending_responses() > parsed
    }

    /// Appends bytes to the outbound buffer; see [`WriteQueue::write`].
    /// `close_after` additionally marks the connection write-closed, which
    /// stops the read pump.
    pub fn write(&self, bytes: &[u8], close_after: bool) -> Drain {
        if close_after {
            self.set_status(CloseState::WRITE_CLOSED);
        }
        self.write_q.write(bytes, close_after)
    }

    /// The outstanding drain boundary, if the buffer has not emptied since
    /// the last write.
    pub fn pending_drain(&self) -> Option<Drain> {
        self.write_q.pending_drain()
    }

    /// Registers a callback to run when the connection closes. Callbacks
    /// fire exactly once; registering on an already-closed connection runs
    /// the callback immediately.
    pub fn on_close(&self, callback: impl FnOnce(&Connection) + Send + 'static) {
        if self.is_closed() {
            callback(self);
            return;
        }
        let mut callbacks = self.on_close.lock().expect("on-close list poisoned");
        if self.is_closed() {
            drop(callbacks);
            callback(self);
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// Spawns the I/O task. Not idempotent: a second call fails with
    /// [`StateError::ConnectionStarted`]. Safe after `close()` (no-op).
    pub fn start(self: &Arc<Self>) -> Result<(), StateError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StateError::ConnectionStarted);
        }
        let Some(io) = self.io_slot.lock().expect("io slot poisoned").take() else {
            debug!(id = self.id, "connection closed before start");
            return Ok(());
        };
        tokio::spawn(run(self.clone(), io));
        Ok(())
    }

    /// Idempotent teardown: sets full-closed, clears the timeout entry,
    /// fails the outstanding drain, cancels the I/O task (which shuts the
    /// socket down), and fires the on-close callbacks exactly once. Valid
    /// from any state, including mid-handshake and before `start`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_status(CloseState::CLOSED);
        self.timeouts.clear(self.id);
        self.write_q.mark_disconnected();
        self.cancel.cancel();
        drop(self.io_slot.lock().expect("io slot poisoned").take());

        let callbacks = {
            let mut guard = self.on_close.lock().expect("on-close list poisoned");
            std::mem::take(&mut *guard)
        };
        for callback in callbacks {
            callback(self);
        }
        debug!(id = self.id, peer = %self.peer, "connection closed");
    }

    /// Stops all connection I/O and takes the raw socket out of the I/O
    /// task. `None` when the connection already closed or was exported
    /// before.
    pub(crate) async fn export(self: &Arc<Self>) -> Option<DetachedSocket> {
        if self.exported.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.timeouts.clear(self.id);
        let (tx, rx) = oneshot::channel();
        *self.export_slot.lock().expect("export slot poisoned") = Some(tx);
        self.export_wake.notify_one();
        let parts = rx.await.ok()?;
        Some(DetachedSocket::new(parts.io, parts.readahead, self.clone()))
    }

    fn set_status(&self, flags: CloseState) {
        self.status.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// EOF or read error from the socket: close outright unless responses
    /// are still being written, in which case only the read side closes and
    /// the respond tasks finish the teardown.
    fn on_read_closed(&self) {
        if self.status().contains(CloseState::WRITE_CLOSED) || self.pending_responses() == 0 {
            self.close();
        } else {
            self.set_status(CloseState::READ_CLOSED);
            debug!(id = self.id, "peer closed read side, draining responses");
        }
    }

    /// Advances the parser until it wants input. Returns `false` when the
    /// parser failed and the connection closed.
    fn pump_parser(
        self: &Arc<Self>,
        parser: &mut dyn RequestParser,
        input: Option<&[u8]>,
        resume: &mut Option<ResumeFuture>,
    ) -> bool {
        let mut input = input;
        loop {
            match parser.step(input.take()) {
                Ok(ParseStep::NeedInput) => return true,
                Ok(ParseStep::Wait(fut)) => {
                    self.paused.store(true, Ordering::SeqCst);
                    *resume = Some(fut);
                    return true;
                },
                Ok(ParseStep::Request(request)) => self.dispatch(request),
                Err(err) => {
                    // The parser is not expected to fail; treat it as fatal.
                    error!(id = self.id, "parser failure, closing connection: {err:#}");
                    self.close();
                    return false;
                },
            }
        }
    }

    /// Launches the respond task for a parsed request.
    fn dispatch(self: &Arc<Self>, request: Request) {
        let Some(driver) = self.driver.get().cloned() else {
            error!(id = self.id, "request dispatched before driver setup");
            return;
        };
        self.pending_responses.fetch_add(1, Ordering::SeqCst);
        let conn = self.clone();
        tokio::spawn(conn.respond(driver, request));
    }

    /// validate → handle → write → finalize, per request.
    async fn respond(self: Arc<Self>, driver: Arc<dyn HttpDriver>, request: Request) {
        let outcome = self.respond_inner(&driver, &request).await;
        let remaining = self.pending_responses.fetch_sub(1, Ordering::SeqCst) - 1;

        match outcome {
            Err(err) => {
                debug!(id = self.id, "response abandoned: {err}");
                self.close();
            },
            Ok(upgrade) => {
                if self.status().contains(CloseState::READ_CLOSED) && remaining == 0 {
                    self.close();
                } else if let Some(upgrade) = upgrade {
                    if let Some(socket) = self.export().await {
                        tokio::spawn(async move { upgrade.handle(socket).await });
                    }
                } else if !self.is_closed() {
                    self.timeouts.renew(self.id);
                }
            },
        }
    }

    async fn respond_inner(
        self: &Arc<Self>,
        driver: &Arc<dyn HttpDriver>,
        request: &Request,
    ) -> Result<Option<Arc<dyn UpgradeHandler>>, ConnectionError> {
        let mut response = self.produce_response(request).await?;
        let upgrade = response.take_upgrade();
        if upgrade.is_some() {
            // Bytes arriving from here on belong to the detached owner, not
            // the parser.
            self.reads_suspended.store(true, Ordering::SeqCst);
        }

        if let Err(err) = driver.write_response(self, request, response).await {
            if !is_client_disconnected(&err) {
                error!(id = self.id, "driver failed to write response: {err:#}");
            }
            return Err(ConnectionError::Disconnected);
        }

        if let Some(drain) = self.pending_drain() {
            drain.wait().await?;
        }

        Ok(upgrade)
    }

    /// Built-in method handling, then the application handler with the
    /// engine's error rendering around it. Only a client disconnect escapes
    /// as an error.
    async fn produce_response(&self, request: &Request) -> Result<Response, ConnectionError> {
        let allow = self.options.allow_header();

        if !request.is_known_method() {
            return Ok(templates::method_response(501, &allow));
        }
        if !self.options.is_method_allowed(&request.method) {
            return Ok(templates::method_response(405, &allow));
        }
        if request.method == "OPTIONS" && request.target == "*" {
            return Ok(templates::method_response(200, &allow));
        }

        match self.handler.handle(request.clone()).await {
            Ok(response) => Ok(response),
            Err(err) if is_client_disconnected(&err) => {
                debug!(id = self.id, "client disconnected while handling request");
                Err(ConnectionError::Disconnected)
            },
            Err(err) => {
                error!(id = self.id, "request handler failed: {err:#}");
                if self.options.is_in_debug_mode {
                    return Ok(templates::trace_response(
                        &request.target,
                        "RequestHandler",
                        &err,
                    ));
                }
                match self
                    .error_handler
                    .handle(500, "Internal Server Error", Some(request))
                    .await
                {
                    Ok(response) => Ok(response),
                    Err(err) => {
                        error!(id = self.id, "error handler failed: {err:#}");
                        Ok(templates::error_response(500, "Internal Server Error"))
                    },
                }
            },
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("status", &self.status())
            .field("pending_responses", &self.pending_responses())
            .field("paused", &self.is_paused())
            .field("exported", &self.is_exported())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The connection's private event loop: handshake, parser priming, then
/// interleaved reads, parser resumes, and queue flushes until close or
/// export.
async fn run(conn: Arc<Connection>, mut io: ServerStream) {
    if let Some(negotiator) = conn.tls.clone() {
        let tcp = match io {
            ServerStream::Tcp(tcp) => tcp,
            other => {
                debug!(id = conn.id, "tls requires a tcp socket, got {other:?}");
                conn.close();
                return;
            },
        };
        match negotiator.negotiate(tcp, &conn.cancel).await {
            Ok((stream, info)) => {
                let _ = conn.crypto.set(info);
                io = stream;
            },
            Err(err) => {
                debug!(id = conn.id, "tls handshake failed: {err}");
                conn.close();
                return;
            },
        }
    }

    let driver = conn.driver_factory.select(&conn);
    let _ = conn.driver.set(driver.clone());
    let mut parser = driver.setup(&conn);
    let mut resume: Option<ResumeFuture> = None;

    // Prime the parser once before the first read.
    if !conn.pump_parser(parser.as_mut(), None, &mut resume) {
        let _ = io.shutdown().await;
        return;
    }

    let granularity = conn.options.io_granularity;
    let mut buf = BytesMut::with_capacity(granularity);

    let exit = loop {
        match conn.write_q.flush(&mut io).await {
            Ok(FlushEvent::Shutdown) => break LoopExit::Close,
            Ok(_) => {},
            Err(err) => {
                debug!(id = conn.id, "write failed: {err}");
                break LoopExit::Close;
            },
        }

        if buf.capacity() < granularity {
            buf.reserve(granularity - buf.capacity());
        }
        let want_read = resume.is_none()
            && !conn.reads_suspended.load(Ordering::SeqCst)
            && !conn
                .status()
                .intersects(CloseState::READ_CLOSED | CloseState::WRITE_CLOSED);

        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break LoopExit::Close,
            _ = conn.export_wake.notified() => break LoopExit::Export,
            res = async { resume.as_mut().expect("resume future present").await },
                if resume.is_some() =>
            {
                resume = None;
                conn.paused.store(false, Ordering::SeqCst);
                match res {
                    Ok(()) => {
                        if !conn.pump_parser(parser.as_mut(), None, &mut resume) {
                            break LoopExit::Close;
                        }
                    },
                    Err(err) => {
                        debug!(id = conn.id, "parser resume failed: {err:#}");
                        conn.close();
                        break LoopExit::Close;
                    },
                }
            },
            _ = conn.write_q.writable() => {},
            read = io.read_buf(&mut buf), if want_read => match read {
                Ok(0) => conn.on_read_closed(),
                Ok(_) => {
                    conn.timeouts.renew(conn.id);
                    let chunk = buf.split().freeze();
                    if !conn.pump_parser(parser.as_mut(), Some(&chunk), &mut resume) {
                        break LoopExit::Close;
                    }
                },
                Err(err) => {
                    debug!(id = conn.id, "read failed: {err}");
                    conn.on_read_closed();
                },
            },
        }
    };

    match exit {
        LoopExit::Close => {
            conn.close();
            let _ = io.shutdown().await;
        },
        LoopExit::Export => {
            // The queue dies with this task; writers still waiting on a
            // drain must fail rather than hang.
            conn.write_q.mark_disconnected();
            let parts = ExportedIo {
                io,
                readahead: buf.split().freeze(),
            };
            if let Some(tx) = conn.export_slot.lock().expect("export slot poisoned").take() {
                let _ = tx.send(parts);
            }
        },
    }
}
