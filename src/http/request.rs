// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

/// Every method token the runtime recognizes. A request carrying a token
/// outside this list is answered with 501 before the handler runs.
pub const KNOWN_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "TRACE", "CONNECT",
];

/// Ordered multi-header map. Lookup is case-insensitive on the header name,
/// insertion order is preserved for the writer.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A request as handed to the application. The wire driver produces these;
/// the runtime only inspects `method` and `target` for its built-in
/// responses.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Request target as it appeared on the wire (`/index.html`, `*`, ...).
    pub target: String,
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_known_method(&self) -> bool {
        KNOWN_METHODS.contains(&self.method.as_str())
    }
}
