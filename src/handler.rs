// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use async_trait::async_trait;

use crate::http::{
    request::Request,
    response::{Response, reason_phrase},
    templates,
};

/// The application's request handler.
///
/// Failures are rendered by the engine: a recognized client-disconnect
/// closes the connection silently, anything else becomes an exception
/// response (debug trace page or the error handler's output).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> anyhow::Result<Response>;
}

/// Renders error statuses into responses. May itself fail; the engine then
/// falls back to the built-in `{code}/{reason}` template.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(
        &self,
        status: u16,
        reason: &str,
        request: Option<&Request>,
    ) -> anyhow::Result<Response>;
}

/// Error handler shipped with the crate: the minimal templated page.
#[derive(Debug, Default)]
pub struct DefaultErrorHandler;

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle(
        &self,
        status: u16,
        reason: &str,
        _request: Option<&Request>,
    ) -> anyhow::Result<Response> {
        let reason = if reason.is_empty() {
            reason_phrase(status)
        } else {
            reason
        };
        Ok(templates::error_response(status, reason))
    }
}
