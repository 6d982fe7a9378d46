// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use http_server_rs::cfg::config::ServerOptions;

#[test]
fn defaults_are_sane() {
    let opts = ServerOptions::default();
    assert_eq!(opts.connection_limit, 1000);
    assert_eq!(opts.connections_per_ip_limit, 30);
    assert_eq!(opts.io_granularity, 8192);
    assert_eq!(opts.connection_timeout, Duration::from_secs(15));
    assert!(!opts.is_in_debug_mode);
    assert!(opts.is_method_allowed("GET"));
    assert!(opts.is_method_allowed("OPTIONS"));
    assert!(!opts.is_method_allowed("TRACE"));
}

#[test]
fn yaml_overrides_and_normalizes() {
    let opts = ServerOptions::from_yaml_str(
        "connectionLimit: 2\n\
         connectionsPerIpLimit: 1\n\
         ioGranularity: 512\n\
         allowedMethods: [\"get\", \"post\"]\n\
         isInDebugMode: true\n\
         connectionTimeout: 3\n",
    )
    .expect("valid options");

    assert_eq!(opts.connection_limit, 2);
    assert_eq!(opts.connections_per_ip_limit, 1);
    assert_eq!(opts.io_granularity, 512);
    assert_eq!(opts.connection_timeout, Duration::from_secs(3));
    assert!(opts.is_in_debug_mode);
    // Tokens are normalized to the canonical uppercase form.
    assert!(opts.is_method_allowed("GET"));
    assert!(opts.is_method_allowed("POST"));
    assert!(!opts.is_method_allowed("PUT"));
    assert_eq!(opts.allow_header(), "GET, POST");
}

#[test]
fn unknown_keys_are_rejected() {
    assert!(ServerOptions::from_yaml_str("maxWorkers: 8\n").is_err());
}

#[test]
fn invalid_values_are_rejected() {
    assert!(ServerOptions::from_yaml_str("connectionLimit: 0\n").is_err());
    assert!(ServerOptions::from_yaml_str("connectionsPerIpLimit: 0\n").is_err());
    assert!(ServerOptions::from_yaml_str("ioGranularity: 0\n").is_err());
    assert!(ServerOptions::from_yaml_str("connectionTimeout: 0\n").is_err());
    assert!(ServerOptions::from_yaml_str("allowedMethods: []\n").is_err());
    assert!(ServerOptions::from_yaml_str("allowedMethods: [\"BREW\"]\n").is_err());
}

#[test]
fn idle_timeout_is_whole_seconds() {
    let opts = ServerOptions::from_yaml_str("connectionTimeout: 7\n").expect("valid");
    assert_eq!(opts.idle_timeout_secs(), 7);
}
