// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{connection::stream::DetachedSocket, http::request::Headers};

/// Takes over a socket detached from the server after its response was
/// written. The surrogate is the application's to keep; the connection's
/// on-close bookkeeping runs once the surrogate is dropped.
#[async_trait]
pub trait UpgradeHandler: Send + Sync {
    async fn handle(&self, socket: DetachedSocket);
}

/// A response produced by the application or by the runtime's built-in
/// error paths. Attaching an upgrade handler marks the response detached:
/// after the body is flushed the raw socket is exported to that handler.
#[derive(Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
    upgrade: Option<Arc<dyn UpgradeHandler>>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            upgrade: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_upgrade(mut self, handler: Arc<dyn UpgradeHandler>) -> Self {
        self.upgrade = Some(handler);
        self
    }

    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<Arc<dyn UpgradeHandler>> {
        self.upgrade.take()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.len())
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

/// Canonical reason phrase for the status codes the runtime emits itself.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
