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

//! VPN server records as seen by the provisioning core.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Secret;

/// Default WireGuard subnet handed out to peers.
pub const DEFAULT_SUBNET: &str = "10.0.0.0/24";
/// Default WireGuard interface name.
pub const DEFAULT_INTERFACE: &str = "wg0";
/// Default WireGuard UDP listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// How the core reaches a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    /// WireGuard on the same host as the provisioning process.
    Local,
    /// WireGuard reached over an SSH session.
    Ssh,
    /// Outline reached over its management REST API.
    Api,
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Api => "api",
        })
    }
}

/// SSH credential. Exactly one kind is used per server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SshAuth {
    /// Password authentication.
    Password {
        /// The account password.
        password: Secret,
    },
    /// Public key authentication with an in-memory PEM/OpenSSH private key.
    PrivateKey {
        /// The private key text.
        key: Secret,
        /// Optional passphrase protecting the key.
        #[serde(default)]
        passphrase: Option<Secret>,
    },
}

/// Access method together with its backend-specific credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ServerAccess {
    /// Commands run as local subprocesses.
    Local,
    /// Commands run over SSH.
    Ssh {
        /// Remote login name.
        username: String,
        /// Credential; a missing credential is reported when the session is
        /// opened, not when the record is loaded.
        #[serde(default)]
        auth: Option<SshAuth>,
    },
    /// Outline management API.
    Api {
        /// Secret path prefix of the management API.
        admin_access_key: Secret,
        /// SHA-256 fingerprint of the self-signed certificate, as reported
        /// by the Outline installer.
        #[serde(default)]
        cert_sha256: Option<String>,
    },
}

impl ServerAccess {
    /// The bare access method.
    pub fn method(&self) -> AccessMethod {
        match self {
            Self::Local => AccessMethod::Local,
            Self::Ssh { .. } => AccessMethod::Ssh,
            Self::Api { .. } => AccessMethod::Api,
        }
    }
}

/// WireGuard interface settings of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardSettings {
    /// Interface name, e.g. `wg0`.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Peer address pool in CIDR notation.
    #[serde(default = "default_subnet")]
    pub subnet: String,
    /// UDP port clients connect to.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// DNS servers written into client configs.
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
    /// Server public key, filled in by `initialize`.
    #[serde(default)]
    pub public_key: Option<String>,
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

fn default_subnet() -> String {
    DEFAULT_SUBNET.to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string()]
}

impl Default for WireGuardSettings {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            subnet: default_subnet(),
            listen_port: default_listen_port(),
            dns: default_dns(),
            public_key: None,
        }
    }
}

/// A VPN server in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnServer {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name, unique within the fleet.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// Management port: SSH port for `ssh`, API port for `api`.
    pub port: u16,
    /// Access method and credentials.
    pub access: ServerAccess,
    /// WireGuard settings; ignored for Outline servers.
    #[serde(default)]
    pub wireguard: Option<WireGuardSettings>,
    /// Whether the scheduler should visit this server.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Result of the last health check.
    #[serde(default)]
    pub is_healthy: bool,
    /// When the last health check ran.
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl VpnServer {
    /// WireGuard settings with defaults filled in.
    pub fn wireguard_settings(&self) -> WireGuardSettings {
        self.wireguard.clone().unwrap_or_default()
    }
}
