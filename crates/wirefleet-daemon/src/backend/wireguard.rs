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

//! WireGuard backend driven through the `wg` command line.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use thiserror::Error;
use tracing::{debug, info, warn};
use wirefleet_types::{
    AccessArtifact, CounterKind, DataLimit, Peer, PeerStats, Secret, ServerStats, Usage, VpnServer,
    WireGuardSettings,
};

use super::{BackendError, InitReport, PeerRequest, ProvisionedPeer, VpnBackend};
use crate::exec::{ExecError, Executor};
use crate::wgconf::ClientConfig;

/// A peer whose last handshake is at most this old counts as connected.
pub const CONNECTED_WINDOW_SECS: i64 = 180;

/// Offset 0 is the network address and offset 1 belongs to the server.
const FIRST_PEER_OFFSET: u64 = 2;

// -- Address allocation --

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("only IPv4 subnets are supported, got {0}")]
    NotIpv4(String),

    #[error("address pool exhausted in {0}")]
    Exhausted(String),
}

fn parse_subnet(subnet: &str) -> Result<ipnetwork::Ipv4Network, AllocError> {
    match IpNetwork::from_str(subnet) {
        Ok(IpNetwork::V4(net)) => Ok(net),
        Ok(IpNetwork::V6(_)) => Err(AllocError::NotIpv4(subnet.to_string())),
        Err(_) => Err(AllocError::InvalidSubnet(subnet.to_string())),
    }
}

/// Pick the first free peer address in `subnet`.
///
/// Offsets start at 2 and stop before the broadcast address, so the network
/// address, the server address and the broadcast address are never handed
/// out.
pub fn assign_address(subnet: &str, existing: &[Ipv4Addr]) -> Result<Ipv4Addr, AllocError> {
    let net = parse_subnet(subnet)?;
    let base = u64::from(u32::from(net.network()));
    let size = 1u64 << (32 - u32::from(net.prefix()));
    let taken: HashSet<Ipv4Addr> = existing.iter().copied().collect();

    (FIRST_PEER_OFFSET..size.saturating_sub(1))
        .map(|offset| Ipv4Addr::from((base + offset) as u32))
        .find(|ip| !taken.contains(ip))
        .ok_or_else(|| AllocError::Exhausted(subnet.to_string()))
}

// -- Dump parsing --

pub fn is_connected(last_handshake: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_handshake.is_some_and(|at| (now - at).num_seconds() <= CONNECTED_WINDOW_SECS)
}

fn parse_counter(field: &str, what: &str) -> Result<u64, BackendError> {
    field
        .parse()
        .map_err(|_| BackendError::Protocol(format!("invalid {what} in dump: {field:?}")))
}

fn parse_peer_line(fields: &[&str], now: DateTime<Utc>) -> Result<PeerStats, BackendError> {
    // public-key, preshared-key, endpoint, allowed-ips, latest-handshake,
    // transfer-rx, transfer-tx, persistent-keepalive
    let handshake_secs: i64 = fields[4]
        .parse()
        .map_err(|_| BackendError::Protocol(format!("invalid handshake in dump: {:?}", fields[4])))?;
    let last_handshake = if handshake_secs == 0 {
        None
    } else {
        DateTime::from_timestamp(handshake_secs, 0)
    };

    let endpoint = match fields[2] {
        "(none)" => None,
        ep => Some(ep.to_string()),
    };
    let allowed_ips = match fields[3] {
        "(none)" => Vec::new(),
        ips => ips.split(',').map(|ip| ip.trim().to_string()).collect(),
    };
    let persistent_keepalive = fields[7].parse().ok();

    Ok(PeerStats {
        backend_id: fields[0].to_string(),
        endpoint,
        allowed_ips,
        last_handshake,
        usage: Usage {
            bytes_received: parse_counter(fields[5], "rx bytes")?,
            bytes_sent: parse_counter(fields[6], "tx bytes")?,
        },
        counters: CounterKind::Restarting,
        persistent_keepalive,
        connected: is_connected(last_handshake, now),
    })
}

/// Parse `wg show <iface> dump`. The interface line (4 fields) is skipped;
/// every other non-empty line must be a peer line.
pub fn parse_dump(output: &str, now: DateTime<Utc>) -> Result<Vec<PeerStats>, BackendError> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            match fields.len() {
                4 => None,
                8 => Some(parse_peer_line(&fields, now)),
                n => Some(Err(BackendError::Protocol(format!(
                    "malformed dump line with {n} fields"
                )))),
            }
        })
        .collect()
}

// -- Input validation --

fn validate_key(b64: &str) -> Result<&str, BackendError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|_| BackendError::Protocol(format!("not a base64 key: {b64:?}")))?;
    if bytes.len() != 32 {
        return Err(BackendError::Protocol(format!(
            "invalid key length: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(b64)
}

fn valid_interface(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// -- Backend --

#[derive(Debug)]
pub struct WireGuardBackend<E> {
    executor: E,
    host: String,
    settings: WireGuardSettings,
}

impl<E: Executor> WireGuardBackend<E> {
    pub fn new(executor: E, server: &VpnServer) -> Result<Self, BackendError> {
        let settings = server.wireguard_settings();
        if !valid_interface(&settings.interface) {
            return Err(BackendError::Misconfigured(format!(
                "{} (interface {:?})",
                server.name, settings.interface
            )));
        }
        Ok(Self {
            executor,
            host: server.host.clone(),
            settings,
        })
    }

    fn iface(&self) -> &str {
        &self.settings.interface
    }

    async fn generate_keypair(&self) -> Result<(Secret, String), BackendError> {
        let private = Secret::new(self.executor.execute("wg genkey").await?.trim());
        let public = self
            .executor
            .run("wg pubkey", Some(private.expose()))
            .await?
            .trim()
            .to_string();
        validate_key(&public)?;
        Ok((private, public))
    }

    async fn interface_public_key(&self) -> Result<Option<String>, BackendError> {
        let out = self
            .executor
            .execute(&format!("wg show {} public-key", self.iface()))
            .await?;
        let key = out.trim();
        if key.is_empty() || key == "(none)" {
            return Ok(None);
        }
        Ok(Some(validate_key(key)?.to_string()))
    }

    async fn server_public_key(&self) -> Result<String, BackendError> {
        if let Some(key) = &self.settings.public_key {
            return Ok(key.clone());
        }
        self.interface_public_key()
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("public key of {}", self.iface())))
    }

    async fn dump(&self) -> Result<Vec<PeerStats>, BackendError> {
        let out = self
            .executor
            .execute(&format!("wg show {} dump", self.iface()))
            .await?;
        parse_dump(&out, Utc::now())
    }

    async fn set_allowed_ip(&self, public_key: &str, address: Ipv4Addr) -> Result<(), BackendError> {
        let key = validate_key(public_key)?;
        self.executor
            .execute(&format!(
                "wg set {} peer {key} allowed-ips {address}/32",
                self.iface()
            ))
            .await?;
        Ok(())
    }
}

impl<E: Executor> VpnBackend for WireGuardBackend<E> {
    #[tracing::instrument(skip(self), fields(host = %self.host, interface = %self.settings.interface))]
    async fn initialize(&self) -> Result<InitReport, BackendError> {
        if let Some(public_key) = self.interface_public_key().await? {
            debug!("interface already has a key");
            return Ok(InitReport {
                public_key: Some(public_key),
                generated_keys: false,
                server_name: None,
            });
        }

        info!("interface has no private key, generating server keypair");
        let (private, public) = self.generate_keypair().await?;
        self.executor
            .run(
                &format!("wg set {} private-key /dev/stdin", self.iface()),
                Some(private.expose()),
            )
            .await?;

        Ok(InitReport {
            public_key: Some(public),
            generated_keys: true,
            server_name: None,
        })
    }

    #[tracing::instrument(skip(self, request), fields(host = %self.host, name = %request.name))]
    async fn add_peer(&self, request: &PeerRequest) -> Result<ProvisionedPeer, BackendError> {
        let mut existing = request.existing_addresses.clone();
        for peer in self.dump().await? {
            existing.extend(
                peer.allowed_ips
                    .iter()
                    .filter_map(|ip| ip.split('/').next())
                    .filter_map(|ip| ip.parse::<Ipv4Addr>().ok()),
            );
        }

        let address = assign_address(&self.settings.subnet, &existing)?;
        let (private, public) = self.generate_keypair().await?;
        self.set_allowed_ip(&public, address).await?;

        info!(%address, public_key = %public, "added wireguard peer");
        Ok(ProvisionedPeer {
            backend_id: public,
            private_key: Some(private),
            address: Some(address),
            access_url: None,
        })
    }

    #[tracing::instrument(skip(self), fields(host = %self.host))]
    async fn remove_peer(&self, id: &str) -> Result<(), BackendError> {
        let key = validate_key(id)?;
        self.executor
            .execute(&format!("wg set {} peer {key} remove", self.iface()))
            .await?;
        info!(public_key = %key, "removed wireguard peer");
        Ok(())
    }

    async fn restore_peer(&self, peer: &Peer) -> Result<(), BackendError> {
        let address = peer
            .address
            .ok_or_else(|| BackendError::NotFound(format!("address of peer {}", peer.id)))?;
        self.set_allowed_ip(&peer.backend_id, address).await?;
        info!(host = %self.host, peer = %peer.id, %address, "restored wireguard peer");
        Ok(())
    }

    async fn peer_stats(&self, id: &str) -> Result<PeerStats, BackendError> {
        self.dump()
            .await?
            .into_iter()
            .find(|p| p.backend_id == id)
            .ok_or_else(|| BackendError::NotFound(format!("peer {id}")))
    }

    async fn all_peer_stats(&self) -> Result<Vec<PeerStats>, BackendError> {
        self.dump().await
    }

    async fn server_stats(&self) -> Result<ServerStats, BackendError> {
        Ok(ServerStats::from_peers(&self.dump().await?))
    }

    async fn set_data_limit(&self, id: &str, limit: DataLimit) -> Result<(), BackendError> {
        // wg has no byte caps; positive caps are enforced by the limit job.
        match limit {
            DataLimit::Suspended => self.remove_peer(id).await,
            DataLimit::Capped(_) | DataLimit::Unlimited => {
                debug!(host = %self.host, public_key = id, %limit, "recorded limit, nothing to apply on wireguard");
                Ok(())
            }
        }
    }

    async fn check_health(&self) -> Result<bool, BackendError> {
        match self
            .executor
            .execute(&format!("wg show {}", self.iface()))
            .await
        {
            Ok(out) => Ok(out.contains(&format!("interface: {}", self.iface()))),
            Err(ExecError::NonZeroExit { output, .. } | ExecError::Stderr(output)) => {
                warn!(host = %self.host, interface = %self.iface(), output = %output, "interface not available");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn access_config(&self, peer: &Peer) -> Result<AccessArtifact, BackendError> {
        let private_key = peer
            .private_key
            .as_ref()
            .ok_or_else(|| BackendError::NotFound(format!("private key of peer {}", peer.id)))?;
        let address = peer
            .address
            .ok_or_else(|| BackendError::NotFound(format!("address of peer {}", peer.id)))?;
        let server_public_key = self.server_public_key().await?;

        let text = ClientConfig {
            name: &peer.name,
            private_key: private_key.expose(),
            address,
            dns: &self.settings.dns,
            server_public_key: &server_public_key,
            endpoint_host: &self.host,
            endpoint_port: self.settings.listen_port,
        }
        .render();

        Ok(AccessArtifact::WireGuardConfig { text })
    }

    async fn rename(&self, id: &str, name: &str) -> Result<(), BackendError> {
        debug!(public_key = id, name, "wireguard peers carry no name, rename is local only");
        Ok(())
    }
}
