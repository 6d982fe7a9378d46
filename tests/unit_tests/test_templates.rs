// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use http_server_rs::http::templates::{
    error_response, html_escape, method_response, render, trace_response,
};

#[test]
fn html_escape_covers_markup_characters() {
    assert_eq!(
        html_escape("<script>alert(\"x&y\")</script>"),
        "&lt;script&gt;alert(&quot;x&amp;y&quot;)&lt;/script&gt;"
    );
    assert_eq!(html_escape("it's"), "it&#39;s");
    assert_eq!(html_escape("plain"), "plain");
}

#[test]
fn render_substitutes_and_escapes() {
    let out = render("<p>{a} and {b}</p>", &[("a", "<x>"), ("b", "y")]);
    assert_eq!(out, "<p>&lt;x&gt; and y</p>");
}

#[test]
fn render_leaves_unbound_placeholders() {
    assert_eq!(render("{a} {b}", &[("a", "1")]), "1 {b}");
}

#[test]
fn error_response_renders_code_and_reason() {
    let response = error_response(404, "Not Found");
    assert_eq!(response.status, 404);
    assert_eq!(
        response.headers.get("Content-Type"),
        Some("text/html; charset=utf-8")
    );
    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("404 Not Found"));
}

#[test]
fn error_response_escapes_the_reason() {
    let response = error_response(500, "<oops>");
    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("&lt;oops&gt;"));
    assert!(!body.contains("<oops>"));
}

#[test]
fn method_responses_carry_allow() {
    let response = method_response(405, "GET, HEAD");
    assert_eq!(response.status, 405);
    assert_eq!(response.headers.get("Allow"), Some("GET, HEAD"));
    assert!(!response.body.is_empty());

    let options_star = method_response(200, "GET, HEAD");
    assert_eq!(options_star.status, 200);
    assert_eq!(options_star.headers.get("Allow"), Some("GET, HEAD"));
    assert!(options_star.body.is_empty());
}

#[test]
fn trace_response_escapes_every_field() {
    let err = anyhow::anyhow!("boom <b>")
        .context("while serving <i>the</i> request");
    let response = trace_response("/evil<script>", "RequestHandler", &err);

    assert_eq!(response.status, 500);
    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("/evil&lt;script&gt;"));
    assert!(body.contains("boom &lt;b&gt;"));
    assert!(body.contains("RequestHandler"));
    assert!(!body.contains("<script>alert"));
}
