// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::http::request::KNOWN_METHODS;

/// Runtime options for the connection lifecycle engine. Only the keys below
/// are recognized; anything else in the document is rejected.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    #[serde(rename = "connectionLimit")]
    /// Upper bound on simultaneously tracked connections.
    pub connection_limit: usize,

    #[serde(rename = "connectionsPerIpLimit")]
    /// Upper bound per network id (/56 for IPv6). Loopback and unix-domain
    /// peers are exempt.
    pub connections_per_ip_limit: usize,

    #[serde(rename = "ioGranularity")]
    /// Maximum bytes consumed from a socket per read.
    pub io_granularity: usize,

    #[serde(rename = "allowedMethods")]
    /// Method tokens the server answers. Known-but-absent tokens get 405,
    /// unknown tokens 501.
    pub allowed_methods: Vec<String>,

    #[serde(rename = "isCompressionEnabled")]
    /// Hook consumed by the compression middleware installed outside the
    /// core; the engine itself never compresses.
    pub is_compression_enabled: bool,

    #[serde(rename = "isInDebugMode")]
    /// Render handler failures as HTML trace pages instead of delegating to
    /// the error handler.
    pub is_in_debug_mode: bool,

    #[serde(rename = "connectionTimeout", with = "serde_secs")]
    /// Idle window before a quiet connection is reaped. Also bounds the TLS
    /// handshake.
    pub connection_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            connection_limit: 1000,
            connections_per_ip_limit: 30,
            io_granularity: 8192,
            allowed_methods: ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            is_compression_enabled: true,
            is_in_debug_mode: false,
            connection_timeout: Duration::from_secs(15),
        }
    }
}

impl ServerOptions {
    /// Loads the options from YAML, validates them, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_yaml_str(&s)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let mut opts: ServerOptions =
            serde_yaml::from_str(s).context("failed to parse options YAML")?;
        opts.validate_and_normalize()?;
        Ok(opts)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.connection_limit >= 1, "connectionLimit must be >= 1");
        ensure!(
            self.connections_per_ip_limit >= 1,
            "connectionsPerIpLimit must be >= 1"
        );
        ensure!(self.io_granularity >= 1, "ioGranularity must be >= 1");
        ensure!(
            self.connection_timeout >= Duration::from_secs(1),
            "connectionTimeout must be >= 1s"
        );
        ensure!(
            !self.allowed_methods.is_empty(),
            "allowedMethods must not be empty"
        );

        // Method tokens are case-sensitive on the wire; normalize to the
        // canonical uppercase form and require known tokens.
        for method in &mut self.allowed_methods {
            *method = method.to_ascii_uppercase();
            ensure!(
                KNOWN_METHODS.contains(&method.as_str()),
                "allowedMethods contains unknown token {method:?}"
            );
        }

        Ok(())
    }

    pub fn is_method_allowed(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m == method)
    }

    /// Canonical `Allow` header value.
    pub fn allow_header(&self) -> String {
        self.allowed_methods.join(", ")
    }

    /// Idle timeout in whole seconds, as stored in the timeout cache.
    pub fn idle_timeout_secs(&self) -> u64 {
        self.connection_timeout.as_secs()
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
