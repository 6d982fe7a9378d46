// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::ServerOptions,
    connection::connection::{ClientFactory, Connection, DefaultClientFactory},
    driver::HttpDriverFactory,
    error::StateError,
    handler::{DefaultErrorHandler, ErrorHandler, RequestHandler},
    server::{
        acceptor::{Acceptor, Listener},
        admission::AdmissionPolicy,
        timeout_cache::{TimeoutCache, now_secs},
    },
};

/// Publicly observable lifecycle state. Transitions are strict:
/// Stopped → Started → Stopping → Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Started,
    Stopping,
}

#[derive(Clone)]
struct RunHandles {
    accept: CancellationToken,
    watcher: CancellationToken,
}

enum Status {
    Stopped,
    Started(RunHandles),
    Stopping,
}

/// Owns the acceptors, the connection tables, and the timeout watcher.
///
/// The server holds the only strong table reference to each connection;
/// connections reach back only through the on-close hooks registered at
/// admission, so a closed connection is dropped as soon as its tasks
/// finish.
pub struct Server {
    options: Arc<ServerOptions>,
    handler: Arc<dyn RequestHandler>,
    timeouts: Arc<TimeoutCache>,
    clients: Arc<DashMap<u64, Arc<Connection>>>,
    admission: Arc<AdmissionPolicy>,
    next_id: AtomicU64,

    status: Mutex<Status>,
    listeners: Mutex<Vec<Listener>>,
    bound_addrs: Mutex<Vec<SocketAddr>>,

    driver_factory: Mutex<Arc<dyn HttpDriverFactory>>,
    client_factory: Mutex<Arc<dyn ClientFactory>>,
    error_handler: Mutex<Arc<dyn ErrorHandler>>,
}

impl Server {
    pub fn new(
        options: ServerOptions,
        handler: Arc<dyn RequestHandler>,
        driver_factory: Arc<dyn HttpDriverFactory>,
    ) -> Arc<Self> {
        let timeouts = Arc::new(TimeoutCache::new(options.connection_timeout));
        let admission = Arc::new(AdmissionPolicy::new(&options));
        Arc::new(Self {
            options: Arc::new(options),
            handler,
            timeouts,
            clients: Arc::new(DashMap::new()),
            admission,
            next_id: AtomicU64::new(1),
            status: Mutex::new(Status::Stopped),
            listeners: Mutex::new(Vec::new()),
            bound_addrs: Mutex::new(Vec::new()),
            driver_factory: Mutex::new(driver_factory),
            client_factory: Mutex::new(Arc::new(DefaultClientFactory)),
            error_handler: Mutex::new(Arc::new(DefaultErrorHandler)),
        })
    }

    pub fn status(&self) -> ServerStatus {
        match *self.status.lock().expect("status lock poisoned") {
            Status::Stopped => ServerStatus::Stopped,
            Status::Started(_) => ServerStatus::Started,
            Status::Stopping => ServerStatus::Stopping,
        }
    }

    /// Active connections across all listeners.
    pub fn client_count(&self) -> usize {
        self.admission.client_count()
    }

    /// Addresses of the TCP listeners added so far, usable after `start`
    /// consumed the listeners themselves.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound_addrs
            .lock()
            .expect("bound addrs lock poisoned")
            .clone()
    }

    /// Adds a listener. Only valid while stopped.
    pub fn add_listener(&self, listener: Listener) -> Result<(), StateError> {
        self.ensure_stopped()?;
        if let Some(addr) = listener.local_addr() {
            self.bound_addrs
                .lock()
                .expect("bound addrs lock poisoned")
                .push(addr);
        }
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .push(listener);
        Ok(())
    }

    /// Replaces the driver factory. Only valid while stopped.
    pub fn set_driver_factory(
        &self,
        factory: Arc<dyn HttpDriverFactory>,
    ) -> Result<(), StateError> {
        self.ensure_stopped()?;
        *self
            .driver_factory
            .lock()
            .expect("driver factory lock poisoned") = factory;
        Ok(())
    }

    /// Replaces the client factory. Only valid while stopped.
    pub fn set_client_factory(&self, factory: Arc<dyn ClientFactory>) -> Result<(), StateError> {
        self.ensure_stopped()?;
        *self
            .client_factory
            .lock()
            .expect("client factory lock poisoned") = factory;
        Ok(())
    }

    /// Replaces the error handler. Only valid while stopped.
    pub fn set_error_handler(&self, handler: Arc<dyn ErrorHandler>) -> Result<(), StateError> {
        self.ensure_stopped()?;
        *self
            .error_handler
            .lock()
            .expect("error handler lock poisoned") = handler;
        Ok(())
    }

    /// Spawns the timeout watcher and one accept task per listener.
    pub fn start(self: &Arc<Self>) -> Result<(), StateError> {
        let mut status = self.status.lock().expect("status lock poisoned");
        match *status {
            Status::Stopped => {},
            Status::Started(_) => return Err(StateError::AlreadyStarted),
            Status::Stopping => return Err(StateError::Stopping),
        }

        let handles = RunHandles {
            accept: CancellationToken::new(),
            watcher: CancellationToken::new(),
        };

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .expect("listeners lock poisoned")
            .drain(..)
            .collect();
        if listeners.is_empty() {
            warn!("server started without listeners");
        }
        for listener in listeners {
            let acceptor = Acceptor {
                listener,
                server: self.clone(),
                cancel: handles.accept.clone(),
            };
            tokio::spawn(acceptor.run());
        }

        tokio::spawn(run_timeout_watcher(self.clone(), handles.watcher.clone()));

        *status = Status::Started(handles);
        info!(listeners = self.local_addrs().len(), "server started");
        Ok(())
    }

    /// Closes the listeners immediately, waits up to `timeout` for live
    /// connections to finish writing pending responses, then force-closes
    /// stragglers and stops the watcher.
    pub async fn stop(&self, timeout: Duration) -> Result<(), StateError> {
        let handles = {
            let mut status = self.status.lock().expect("status lock poisoned");
            match &*status {
                Status::Stopped => return Ok(()),
                Status::Stopping => return Err(StateError::Stopping),
                Status::Started(handles) => {
                    let handles = handles.clone();
                    *status = Status::Stopping;
                    handles
                },
            }
        };

        handles.accept.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let busy = self
                .clients
                .iter()
                .any(|entry| entry.value().pending_responses() > 0);
            if !busy || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stragglers: Vec<Arc<Connection>> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in stragglers {
            conn.close();
        }

        handles.watcher.cancel();
        *self.status.lock().expect("status lock poisoned") = Status::Stopped;
        info!("server stopped");
        Ok(())
    }

    /// One watcher tick: close every expired idle connection, deferring the
    /// ones still writing a response by a second.
    pub(crate) fn reap_idle(&self, now: u64) {
        while let Some(id) = self.timeouts.extract(now) {
            let Some(conn) = self.clients.get(&id).map(|entry| entry.value().clone()) else {
                continue;
            };
            if conn.is_busy() {
                self.timeouts.update(id, now + 1);
            } else {
                debug!(id, "closing idle connection");
                conn.close();
            }
        }
    }

    fn ensure_stopped(&self) -> Result<(), StateError> {
        match *self.status.lock().expect("status lock poisoned") {
            Status::Stopped => Ok(()),
            Status::Started(_) => Err(StateError::NotStopped),
            Status::Stopping => Err(StateError::Stopping),
        }
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn options(&self) -> &Arc<ServerOptions> {
        &self.options
    }

    pub(crate) fn timeouts(&self) -> &Arc<TimeoutCache> {
        &self.timeouts
    }

    pub(crate) fn clients(&self) -> &Arc<DashMap<u64, Arc<Connection>>> {
        &self.clients
    }

    pub(crate) fn admission(&self) -> &Arc<AdmissionPolicy> {
        &self.admission
    }

    pub(crate) fn request_handler(&self) -> Arc<dyn RequestHandler> {
        self.handler.clone()
    }

    pub(crate) fn driver_factory(&self) -> Arc<dyn HttpDriverFactory> {
        self.driver_factory
            .lock()
            .expect("driver factory lock poisoned")
            .clone()
    }

    pub(crate) fn client_factory(&self) -> Arc<dyn ClientFactory> {
        self.client_factory
            .lock()
            .expect("client factory lock poisoned")
            .clone()
    }

    pub(crate) fn error_handler(&self) -> Arc<dyn ErrorHandler> {
        self.error_handler
            .lock()
            .expect("error handler lock poisoned")
            .clone()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("status", &self.status())
            .field("client_count", &self.client_count())
            .field("bound_addrs", &self.local_addrs())
            .finish()
    }
}

async fn run_timeout_watcher(server: Arc<Server>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => server.reap_idle(now_secs()),
        }
    }
}
