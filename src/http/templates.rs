// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Built-in HTML pages for the runtime's own responses: the minimal
//! `{code}/{reason}` page every handler failure falls back to, and the
//! debug trace page rendered when the server runs in debug mode.
//!
//! Substitution is plain placeholder replacement; every value is
//! HTML-escaped before it lands in the page.

use crate::http::response::{Response, reason_phrase};

pub const DEFAULT_ERROR_TEMPLATE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><title>{code} {reason}</title></head>\n\
<body>\n\
<h1>{code} {reason}</h1>\n\
<hr/>\n\
</body>\n\
</html>\n";

pub const DEBUG_TRACE_TEMPLATE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><title>Internal server error</title></head>\n\
<body>\n\
<h1>Internal server error</h1>\n\
<p>An exception was thrown while responding to <code>{uri}</code>.</p>\n\
<table>\n\
<tr><td>class</td><td><code>{class}</code></td></tr>\n\
<tr><td>message</td><td><code>{message}</code></td></tr>\n\
<tr><td>file</td><td><code>{file}</code></td></tr>\n\
<tr><td>line</td><td><code>{line}</code></td></tr>\n\
</table>\n\
<pre>{trace}</pre>\n\
</body>\n\
</html>\n";

pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Replaces each `{key}` with its escaped value. Placeholders without a
/// binding stay verbatim.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), &html_escape(value));
    }
    out
}

/// The minimal `{code}/{reason}` page as a full response.
pub fn error_response(status: u16, reason: &str) -> Response {
    let body = render(DEFAULT_ERROR_TEMPLATE, &[
        ("code", status.to_string().as_str()),
        ("reason", reason),
    ]);
    Response::new(status)
        .with_header("Content-Type", "text/html; charset=utf-8")
        .with_body(body)
}

/// The debug trace page for a failed handler invocation.
///
/// `class`/`file`/`line` come from whatever the error chain exposes; Rust
/// erases the dynamic type and throw-site of boxed errors, so the page
/// reports the failing component and the captured backtrace instead.
pub fn trace_response(uri: &str, class: &str, err: &anyhow::Error) -> Response {
    let body = render(DEBUG_TRACE_TEMPLATE, &[
        ("uri", uri),
        ("class", class),
        ("message", format!("{err:#}").as_str()),
        ("file", "<unavailable>"),
        ("line", "0"),
        ("trace", err.backtrace().to_string().as_str()),
    ]);
    Response::new(500)
        .with_header("Content-Type", "text/html; charset=utf-8")
        .with_body(body)
}

/// `405`/`501` page carrying the `Allow` header, and the empty `OPTIONS *`
/// response.
pub fn method_response(status: u16, allow: &str) -> Response {
    let reason = reason_phrase(status);
    let base = if status == 200 {
        Response::new(200)
    } else {
        error_response(status, reason)
    };
    base.with_header("Allow", allow)
}
