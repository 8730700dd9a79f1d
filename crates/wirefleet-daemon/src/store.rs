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

//! Persistence boundary for server and peer records.
//!
//! The scheduler reads a snapshot at the start of each run and writes back
//! single records. Concurrent writers are not coordinated; the last write
//! wins.

use std::future::Future;
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use wirefleet_types::{Peer, VpnServer};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("server {0} not found")]
    ServerNotFound(String),

    #[error("peer {0} not found")]
    PeerNotFound(Uuid),

    #[error("failed to access state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse state file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait FleetStore: Send + Sync {
    /// Servers the scheduler should visit.
    fn active_servers(&self) -> impl Future<Output = Result<Vec<VpnServer>, StoreError>> + Send;

    fn server(&self, id: Uuid) -> impl Future<Output = Result<VpnServer, StoreError>> + Send;

    fn server_by_name(&self, name: &str) -> impl Future<Output = Result<VpnServer, StoreError>> + Send;

    fn upsert_server(&self, server: VpnServer) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn record_health(
        &self,
        server_id: Uuid,
        healthy: bool,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn peers_for_server(&self, server_id: Uuid) -> impl Future<Output = Result<Vec<Peer>, StoreError>> + Send;

    fn all_peers(&self) -> impl Future<Output = Result<Vec<Peer>, StoreError>> + Send;

    fn peer(&self, id: Uuid) -> impl Future<Output = Result<Peer, StoreError>> + Send;

    fn save_peer(&self, peer: &Peer) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete_peer(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    servers: Vec<VpnServer>,
    #[serde(default)]
    peers: Vec<Peer>,
}

/// In-memory store with optional JSON snapshots on disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    servers: DashMap<Uuid, VpnServer>,
    peers: DashMap<Uuid, Peer>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot; a missing file yields an empty store.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let store = Self::new();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let snapshot: Snapshot = serde_json::from_str(&contents)?;
                for server in snapshot.servers {
                    store.servers.insert(server.id, server);
                }
                for peer in snapshot.peers {
                    store.peers.insert(peer.id, peer);
                }
                info!(
                    path = %path.display(),
                    servers = store.servers.len(),
                    peers = store.peers.len(),
                    "loaded fleet state"
                );
                Ok(store)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "state file not found, starting empty");
                Ok(store)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a snapshot atomically (temp file, then rename).
    pub async fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let mut snapshot = Snapshot {
            servers: self.servers.iter().map(|e| e.value().clone()).collect(),
            peers: self.peers.iter().map(|e| e.value().clone()).collect(),
        };
        snapshot.servers.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.peers.sort_by_key(|p| p.created_at);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?).await?;

        // the snapshot holds peer private keys and server credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "persisted fleet state");
        Ok(())
    }
}

impl FleetStore for MemoryStore {
    async fn active_servers(&self) -> Result<Vec<VpnServer>, StoreError> {
        Ok(self
            .servers
            .iter()
            .filter(|e| e.is_active)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn server(&self, id: Uuid) -> Result<VpnServer, StoreError> {
        self.servers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::ServerNotFound(id.to_string()))
    }

    async fn server_by_name(&self, name: &str) -> Result<VpnServer, StoreError> {
        self.servers
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::ServerNotFound(name.to_string()))
    }

    async fn upsert_server(&self, server: VpnServer) -> Result<(), StoreError> {
        self.servers.insert(server.id, server);
        Ok(())
    }

    async fn record_health(&self, server_id: Uuid, healthy: bool, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut server = self
            .servers
            .get_mut(&server_id)
            .ok_or_else(|| StoreError::ServerNotFound(server_id.to_string()))?;
        server.is_healthy = healthy;
        server.last_health_check = Some(at);
        Ok(())
    }

    async fn peers_for_server(&self, server_id: Uuid) -> Result<Vec<Peer>, StoreError> {
        Ok(self
            .peers
            .iter()
            .filter(|e| e.server_id == server_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn all_peers(&self) -> Result<Vec<Peer>, StoreError> {
        Ok(self.peers.iter().map(|e| e.value().clone()).collect())
    }

    async fn peer(&self, id: Uuid) -> Result<Peer, StoreError> {
        self.peers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::PeerNotFound(id))
    }

    async fn save_peer(&self, peer: &Peer) -> Result<(), StoreError> {
        self.peers.insert(peer.id, peer.clone());
        Ok(())
    }

    async fn delete_peer(&self, id: Uuid) -> Result<(), StoreError> {
        self.peers.remove(&id);
        Ok(())
    }
}
