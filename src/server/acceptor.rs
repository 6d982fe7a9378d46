// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    connection::{
        connection::{ClientContext, Connection},
        stream::{Peer, ServerStream, TlsNegotiator},
    },
    server::{
        admission::{NetworkId, Verdict},
        server::Server,
    },
};

#[cfg(unix)]
use std::path::Path;
#[cfg(unix)]
use tokio::net::UnixListener;

/// A bound socket the server accepts from: plaintext TCP, TCP with a TLS
/// config, or a unix-domain path. Unix listeners have no local port, which
/// is what marks their clients exempt from per-network admission.
#[derive(Debug)]
pub enum Listener {
    Tcp {
        inner: TcpListener,
        tls: Option<Arc<rustls::ServerConfig>>,
    },
    #[cfg(unix)]
    Unix { inner: UnixListener },
}

pub(crate) struct Accepted {
    pub io: ServerStream,
    pub peer: Peer,
    pub local: Option<SocketAddr>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self::Tcp {
            inner: TcpListener::bind(addr).await?,
            tls: None,
        })
    }

    pub async fn bind_tls(
        addr: impl ToSocketAddrs,
        config: Arc<rustls::ServerConfig>,
    ) -> io::Result<Self> {
        Ok(Self::Tcp {
            inner: TcpListener::bind(addr).await?,
            tls: Some(config),
        })
    }

    #[cfg(unix)]
    pub fn bind_unix(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::Unix {
            inner: UnixListener::bind(path)?,
        })
    }

    /// Local address; `None` for unix-domain listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp { inner, .. } => inner.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Listener::Tcp { inner, tls } => {
                let (stream, peer) = inner.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Accepted {
                    local: stream.local_addr().ok(),
                    io: ServerStream::Tcp(stream),
                    peer: Peer::Tcp(peer),
                    tls: tls.clone(),
                })
            },
            #[cfg(unix)]
            Listener::Unix { inner } => {
                let (stream, _) = inner.accept().await?;
                Ok(Accepted {
                    io: ServerStream::Unix(stream),
                    peer: Peer::Unix,
                    local: None,
                    tls: None,
                })
            },
        }
    }
}

/// One accept loop per listener. Runs until the server's accept token is
/// cancelled; dropping the listener on exit closes the bound socket, so no
/// further accepts can occur.
pub(crate) struct Acceptor {
    pub listener: Listener,
    pub server: Arc<Server>,
    pub cancel: CancellationToken,
}

impl Acceptor {
    pub(crate) async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => self.handle(accepted),
                    Err(err) => {
                        warn!("accept failed: {err}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    },
                },
            }
        }
        debug!(addr = ?self.listener.local_addr(), "listener closed");
    }

    fn handle(&self, accepted: Accepted) {
        let server = &self.server;
        let id = server.next_client_id();
        let peer = accepted.peer;
        let tls = accepted
            .tls
            .map(|config| TlsNegotiator::new(config, server.options().connection_timeout));

        let conn = server.client_factory().create(ClientContext {
            id,
            io: accepted.io,
            local: accepted.local,
            peer: peer.clone(),
            tls,
            driver_factory: server.driver_factory(),
            handler: server.request_handler(),
            error_handler: server.error_handler(),
            options: server.options().clone(),
            timeouts: server.timeouts().clone(),
        });

        match server.admission().admit(&peer) {
            Verdict::DenyTotal => {
                warn!(id, %peer, "client denied: too many existing connections");
                conn.close();
            },
            Verdict::DenyPerNetwork(network_id) => {
                self.register_cleanup(&conn, network_id.clone());
                warn!(
                    id,
                    "client denied: too many existing connections from {network_id}"
                );
                conn.close();
            },
            Verdict::Admit => {
                self.register_cleanup(&conn, NetworkId::from_peer(&peer));
                server.clients().insert(id, conn.clone());
                // Arm the idle timer so a mute client is still reaped.
                server.timeouts().renew(id);
                if let Err(err) = conn.start() {
                    error!(id, "failed to start connection: {err}");
                    conn.close();
                }
            },
        }
    }

    /// The on-close hook undoing exactly what admission incremented, plus
    /// the clients-table removal. This is the only back-reference a
    /// connection holds into the server.
    fn register_cleanup(&self, conn: &Arc<Connection>, network_id: NetworkId) {
        let clients = self.server.clients().clone();
        let admission = self.server.admission().clone();
        let id = conn.id();
        conn.on_close(move |_| {
            clients.remove(&id);
            admission.release(&network_id);
        });
    }
}
