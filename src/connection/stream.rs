// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{connection::connection::Connection, error::ConnectionError};

#[cfg(unix)]
use tokio::net::UnixStream;

/// Remote endpoint of an accepted socket. Unix-domain peers carry no
/// address: they are identified by the variant alone and are exempt from
/// per-network admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix,
}

impl Peer {
    pub fn is_unix(&self) -> bool {
        #[cfg(unix)]
        if matches!(self, Peer::Unix) {
            return true;
        }
        false
    }

    pub fn ip(&self) -> Option<std::net::IpAddr> {
        match self {
            Peer::Tcp(addr) => Some(addr.ip()),
            #[cfg(unix)]
            Peer::Unix => None,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Peer::Unix => write!(f, "unix"),
        }
    }
}

/// The byte stream a connection drives: plaintext TCP, TLS over TCP, or a
/// unix-domain socket.
#[derive(Debug)]
pub enum ServerStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Structured handshake result recorded on a connection. Present iff the
/// connection negotiated TLS.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub protocol: String,
    /// Negotiated cipher suite name.
    pub cipher_suite: String,
    /// ALPN protocol selected during the handshake, if any.
    pub alpn: Option<String>,
    /// SNI server name the client asked for, if any.
    pub server_name: Option<String>,
}

impl TlsInfo {
    fn from_session(session: &rustls::ServerConnection) -> Self {
        Self {
            protocol: session
                .protocol_version()
                .map_or_else(String::new, |v| format!("{v:?}")),
            cipher_suite: session
                .negotiated_cipher_suite()
                .map_or_else(String::new, |cs| format!("{:?}", cs.suite())),
            alpn: session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            server_name: session.server_name().map(|n| n.to_string()),
        }
    }
}

/// Drives the non-blocking TLS handshake before the read pump starts.
/// WANT_READ/WANT_WRITE looping is internal to the rustls acceptor; the
/// negotiator bounds the whole exchange with the connection timeout.
#[derive(Clone)]
pub struct TlsNegotiator {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsNegotiator {
    pub fn new(config: Arc<rustls::ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
        }
    }

    pub(crate) async fn negotiate(
        &self,
        tcp: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<(ServerStream, TlsInfo), ConnectionError> {
        let stream = io_with_timeout(
            "tls handshake",
            self.acceptor.accept(tcp),
            self.handshake_timeout,
            cancel,
        )
        .await?;

        let (_, session) = stream.get_ref();
        let info = TlsInfo::from_session(session);
        Ok((ServerStream::Tls(Box::new(stream)), info))
    }
}

impl fmt::Debug for TlsNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsNegotiator")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, ConnectionError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ConnectionError::Disconnected),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ConnectionError::Timeout(label)),
            }
        }
    }
}

/// Raw socket handed to the application after an export.
///
/// Reads serve any bytes the server had consumed but not parsed before
/// delegating to the socket. Dropping the surrogate runs the originating
/// connection's close bookkeeping, which is when the server tables release
/// the entry.
pub struct DetachedSocket {
    io: ServerStream,
    readahead: Bytes,
    conn: Arc<Connection>,
}

impl DetachedSocket {
    pub(crate) fn new(io: ServerStream, readahead: Bytes, conn: Arc<Connection>) -> Self {
        Self {
            io,
            readahead,
            conn,
        }
    }

    /// Id of the connection this socket was exported from.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }
}

impl AsyncRead for DetachedSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.readahead.is_empty() {
            let n = this.readahead.len().min(buf.remaining());
            buf.put_slice(&this.readahead.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for DetachedSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl fmt::Debug for DetachedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedSocket")
            .field("connection_id", &self.conn.id())
            .field("readahead", &self.readahead.len())
            .finish()
    }
}

impl Drop for DetachedSocket {
    fn drop(&mut self) {
        self.conn.close();
    }
}
