// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Telemetry and client artifacts returned by backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CounterKind, Usage};

/// Usage and connectivity of one peer as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Backend identity (public key or access-key id).
    pub backend_id: String,
    /// Last seen remote endpoint.
    pub endpoint: Option<String>,
    /// Allowed IPs configured for the peer.
    pub allowed_ips: Vec<String>,
    /// Last handshake, `None` if there never was one.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Raw backend counters.
    pub usage: Usage,
    /// How `usage` behaves between observations.
    #[serde(default)]
    pub counters: CounterKind,
    /// Persistent keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
    /// Whether the peer counts as connected.
    pub connected: bool,
}

/// Aggregate telemetry for a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Peers or access keys configured on the server.
    pub peer_count: usize,
    /// Peers currently connected. Always zero for Outline.
    pub connected_count: usize,
    /// Summed counters over all peers.
    pub usage: Usage,
}

impl ServerStats {
    /// Aggregate per-peer stats.
    pub fn from_peers(peers: &[PeerStats]) -> Self {
        peers.iter().fold(Self::default(), |mut acc, p| {
            acc.peer_count += 1;
            if p.connected {
                acc.connected_count += 1;
            }
            acc.usage.bytes_received = acc.usage.bytes_received.saturating_add(p.usage.bytes_received);
            acc.usage.bytes_sent = acc.usage.bytes_sent.saturating_add(p.usage.bytes_sent);
            acc
        })
    }
}

/// An Outline access key, with its id normalized to a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKey {
    /// Backend-assigned id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// `ss://` URL clients import.
    pub access_url: String,
    /// Byte cap, if any.
    pub data_limit: Option<u64>,
    /// Transferred bytes, when known.
    pub bytes_transferred: Option<u64>,
}

/// What a client imports to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessArtifact {
    /// A wg-quick config file.
    WireGuardConfig {
        /// Config text.
        text: String,
    },
    /// An Outline access URL.
    OutlineUrl {
        /// The `ss://` URL.
        url: String,
    },
}

impl AccessArtifact {
    /// The text that gets encoded into a QR code.
    pub fn payload(&self) -> &str {
        match self {
            Self::WireGuardConfig { text } => text,
            Self::OutlineUrl { url } => url,
        }
    }
}
