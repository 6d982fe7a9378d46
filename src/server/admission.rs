// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{cfg::config::ServerOptions, connection::stream::Peer};

/// IP-derived bucket used for per-client rate limiting: the full address
/// for IPv4, a /56 aggregate for IPv6, one shared bucket for unix-domain
/// peers (which are exempt from the per-network cap anyway).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkId {
    V4(Ipv4Addr),
    /// First 7 bytes of the packed address.
    V6([u8; 7]),
    Unix,
}

impl NetworkId {
    pub fn from_peer(peer: &Peer) -> Self {
        match peer.ip() {
            Some(IpAddr::V4(v4)) => NetworkId::V4(v4),
            Some(IpAddr::V6(v6)) => {
                let octets = v6.octets();
                let mut prefix = [0u8; 7];
                prefix.copy_from_slice(&octets[..7]);
                NetworkId::V6(prefix)
            },
            None => NetworkId::Unix,
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkId::V4(addr) => write!(f, "{addr}"),
            NetworkId::V6(prefix) => {
                let mut octets = [0u8; 16];
                octets[..7].copy_from_slice(prefix);
                write!(f, "{}/56", Ipv6Addr::from(octets))
            },
            NetworkId::Unix => write!(f, "unix"),
        }
    }
}

/// Accept-time admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// Global cap hit. No counter was touched; close without a release
    /// hook.
    DenyTotal,
    /// Per-network cap hit. Counters were incremented and the on-close hook
    /// must release them.
    DenyPerNetwork(NetworkId),
}

/// Global and per-network connection caps.
///
/// The counters live here so the acceptor's admit and the connections'
/// on-close hooks stay symmetric: `sum(per-network counts) == client count`
/// after every admit and every close.
#[derive(Debug)]
pub struct AdmissionPolicy {
    connection_limit: usize,
    per_network_limit: usize,
    client_count: AtomicUsize,
    clients_per_network: DashMap<NetworkId, usize>,
}

impl AdmissionPolicy {
    pub fn new(options: &ServerOptions) -> Self {
        Self {
            connection_limit: options.connection_limit,
            per_network_limit: options.connections_per_ip_limit,
            client_count: AtomicUsize::new(0),
            clients_per_network: DashMap::new(),
        }
    }

    /// Applies both caps to a peer, incrementing the counters it admits
    /// under. Loopback (including IPv4-mapped `::ffff:127/104`) and
    /// unix-domain peers bypass the per-network cap only.
    pub fn admit(&self, peer: &Peer) -> Verdict {
        if self.client_count.load(Ordering::SeqCst) >= self.connection_limit {
            return Verdict::DenyTotal;
        }
        self.client_count.fetch_add(1, Ordering::SeqCst);

        let network_id = NetworkId::from_peer(peer);
        let previous = {
            let mut entry = self
                .clients_per_network
                .entry(network_id.clone())
                .or_insert(0);
            let previous = *entry;
            *entry += 1;
            previous
        };

        if previous >= self.per_network_limit && !Self::is_exempt(peer) {
            return Verdict::DenyPerNetwork(network_id);
        }
        Verdict::Admit
    }

    /// Undoes one `admit`'s increments. Entries that reach zero are
    /// removed.
    pub fn release(&self, network_id: &NetworkId) {
        self.client_count.fetch_sub(1, Ordering::SeqCst);
        if let Entry::Occupied(mut occupied) =
            self.clients_per_network.entry(network_id.clone())
        {
            let count = occupied.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                occupied.remove();
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Connections currently counted against a network id; 0 when the
    /// entry was removed.
    pub fn network_count(&self, network_id: &NetworkId) -> usize {
        self.clients_per_network
            .get(network_id)
            .map_or(0, |count| *count)
    }

    /// Number of network ids currently tracked.
    pub fn tracked_networks(&self) -> usize {
        self.clients_per_network.len()
    }

    fn is_exempt(peer: &Peer) -> bool {
        if peer.is_unix() {
            return true;
        }
        peer.ip().is_some_and(is_loopback)
    }
}

/// Loopback in every representation: `127/8`, `::1`, and the IPv4-mapped
/// form `::ffff:127/104`.
fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6 == Ipv6Addr::LOCALHOST
                || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        },
    }
}
