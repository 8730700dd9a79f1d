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

//! Provisioning entry points used by admin actions.
//!
//! Errors here are returned to the caller. A backend peer is never left
//! behind without either a saved record or a returned error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;
use wirefleet_types::{
    AccessArtifact, DataLimit, Peer, PeerStatus, ServerStats, TransitionError, VpnServer,
};

use crate::backend::{BackendError, BackendFactory, PeerPatch, PeerRequest, VpnBackend};
use crate::error::ErrorKind;
use crate::store::{FleetStore, StoreError};
use crate::wgconf::{self, QrError};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Qr(#[from] QrError),

    #[error("peer {peer} belongs to server {actual}, not {expected}")]
    WrongServer { peer: Uuid, expected: Uuid, actual: Uuid },
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub name: String,
    /// Device cap: `0` suspends, positive caps, negative or absent is
    /// unlimited.
    pub limit_bytes: Option<i64>,
    pub plan_limit_bytes: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a revoke. The local record is gone either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevokeOutcome {
    /// Backend-side removal failure, if any.
    pub backend_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccessBundle {
    pub artifact: AccessArtifact,
    /// `data:` URL of a QR code encoding the artifact.
    pub qr_data_url: String,
}

pub struct Provisioner<S, F> {
    store: Arc<S>,
    factory: Arc<F>,
}

impl<S: FleetStore, F: BackendFactory> Provisioner<S, F> {
    pub fn new(store: Arc<S>, factory: Arc<F>) -> Self {
        Self { store, factory }
    }

    fn check_owner(server: &VpnServer, peer: &Peer) -> Result<(), ProvisionError> {
        if peer.server_id != server.id {
            return Err(ProvisionError::WrongServer {
                peer: peer.id,
                expected: server.id,
                actual: peer.server_id,
            });
        }
        Ok(())
    }

    /// Confirm the backend is reachable and store the server public key.
    #[tracing::instrument(skip_all, fields(server = %server.name))]
    pub async fn initialize_server(&self, server: &VpnServer) -> Result<VpnServer, ProvisionError> {
        let backend = self.factory.connect(server)?;
        let report = backend.initialize().await?;

        let mut server = server.clone();
        if let Some(public_key) = report.public_key {
            let mut settings = server.wireguard_settings();
            settings.public_key = Some(public_key);
            server.wireguard = Some(settings);
        }
        self.store.upsert_server(server.clone()).await?;
        info!(generated_keys = report.generated_keys, "server initialized");
        Ok(server)
    }

    #[tracing::instrument(skip_all, fields(server = %server.name, name = %request.name))]
    pub async fn provision_peer(
        &self,
        server: &VpnServer,
        request: ProvisionRequest,
    ) -> Result<Peer, ProvisionError> {
        let backend = self.factory.connect(server)?;
        let existing_addresses = self
            .store
            .peers_for_server(server.id)
            .await?
            .iter()
            .filter_map(|p| p.address)
            .collect();

        let limit = DataLimit::from_request(request.limit_bytes);
        let provisioned = backend
            .add_peer(&PeerRequest {
                name: request.name.clone(),
                limit,
                existing_addresses,
            })
            .await?;

        let mut peer = Peer::new(server.id, &request.name, &provisioned.backend_id);
        peer.private_key = provisioned.private_key;
        peer.address = provisioned.address;
        peer.access_url = provisioned.access_url;
        peer.plan_limit_bytes = request.plan_limit_bytes;
        peer.expires_at = request.expires_at;
        peer.apply_limit(limit);
        if request.plan_limit_bytes.is_some() && limit == DataLimit::Unlimited && request.limit_bytes.is_none() {
            // no device override: the plan cap applies
            peer.is_unlimited = false;
        }

        let saved = async {
            if limit == DataLimit::Suspended {
                backend.set_data_limit(&peer.backend_id, limit).await?;
                peer.transition(PeerStatus::Suspended)?;
            }
            self.store.save_peer(&peer).await?;
            Ok::<_, ProvisionError>(())
        }
        .await;

        if let Err(e) = saved {
            error!(backend_id = %peer.backend_id, error = %e, "provisioning failed after backend add, rolling back");
            if let Err(cleanup) = backend.remove_peer(&peer.backend_id).await {
                error!(backend_id = %peer.backend_id, error = %cleanup, "rollback of backend peer failed");
            }
            return Err(e);
        }

        info!(peer = %peer.id, address = ?peer.address, "provisioned peer");
        Ok(peer)
    }

    /// Remove the backend peer and delete the local record. Backend failure
    /// does not block the delete; it is logged and returned in the outcome.
    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn revoke_peer(&self, server: &VpnServer, peer: &Peer) -> Result<RevokeOutcome, ProvisionError> {
        Self::check_owner(server, peer)?;

        let removal = match self.factory.connect(server) {
            Ok(backend) => backend.remove_peer(&peer.backend_id).await,
            Err(e) => Err(e),
        };

        let outcome = match removal {
            Ok(()) => RevokeOutcome::default(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("peer already absent on backend");
                RevokeOutcome::default()
            }
            Err(e) => {
                warn!(error = %e, kind = %e.kind(), "backend removal failed, deleting local record anyway");
                RevokeOutcome { backend_error: Some(e.to_string()) }
            }
        };

        self.store.delete_peer(peer.id).await?;
        info!("revoked peer");
        Ok(outcome)
    }

    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn set_limit(
        &self,
        server: &VpnServer,
        peer: &Peer,
        bytes: Option<i64>,
    ) -> Result<Peer, ProvisionError> {
        Self::check_owner(server, peer)?;
        let backend = self.factory.connect(server)?;
        let limit = DataLimit::from_request(bytes);
        let previous = peer.recorded_limit();

        let mut peer = peer.clone();
        let patch = PeerPatch { limit: Some(limit), ..Default::default() };
        backend.update_config(&peer.backend_id, &patch).await?;
        peer.apply_limit(limit);

        if limit == DataLimit::Suspended && peer.status == PeerStatus::Active {
            peer.transition(PeerStatus::Suspended)?;
        } else if previous == DataLimit::Suspended
            && limit != DataLimit::Suspended
            && matches!(peer.status, PeerStatus::Active | PeerStatus::Suspended)
        {
            // disabled and expired peers stay off the backend
            backend.restore_peer(&peer).await?;
            if peer.status == PeerStatus::Suspended {
                peer.transition(PeerStatus::Active)?;
            }
        }

        peer.last_error = None;
        self.store.save_peer(&peer).await?;
        info!(%limit, "updated data limit");
        Ok(peer)
    }

    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn fetch_access_artifact(&self, server: &VpnServer, peer: &Peer) -> Result<AccessBundle, ProvisionError> {
        Self::check_owner(server, peer)?;
        let backend = self.factory.connect(server)?;
        let artifact = backend.access_config(peer).await?;
        let qr_data_url = wgconf::qr_data_url(artifact.payload())?;
        Ok(AccessBundle { artifact, qr_data_url })
    }

    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn suspend(&self, server: &VpnServer, peer: &Peer) -> Result<Peer, ProvisionError> {
        Self::check_owner(server, peer)?;
        let mut peer = peer.clone();
        peer.transition(PeerStatus::Suspended)?;

        let backend = self.factory.connect(server)?;
        backend.set_data_limit(&peer.backend_id, DataLimit::Suspended).await?;

        peer.last_error = None;
        self.store.save_peer(&peer).await?;
        info!("suspended peer");
        Ok(peer)
    }

    /// Re-add the peer on the backend and mark it active.
    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn resume(&self, server: &VpnServer, peer: &Peer) -> Result<Peer, ProvisionError> {
        Self::check_owner(server, peer)?;
        let mut peer = peer.clone();
        peer.transition(PeerStatus::Active)?;
        if peer.recorded_limit() == DataLimit::Suspended {
            // a zero cap would be re-suspended by the next limit run
            peer.apply_limit(DataLimit::Unlimited);
        }

        let backend = self.factory.connect(server)?;
        backend.restore_peer(&peer).await?;

        peer.last_error = None;
        self.store.save_peer(&peer).await?;
        info!("resumed peer");
        Ok(peer)
    }

    /// Mark disabled and cut access on a best-effort basis; a backend
    /// failure is recorded on the peer but does not block the change.
    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn disable(&self, server: &VpnServer, peer: &Peer) -> Result<Peer, ProvisionError> {
        Self::check_owner(server, peer)?;
        let mut peer = peer.clone();
        peer.transition(PeerStatus::Disabled)?;

        let cut = match self.factory.connect(server) {
            Ok(backend) => backend.set_data_limit(&peer.backend_id, DataLimit::Suspended).await,
            Err(e) => Err(e),
        };
        peer.last_error = match cut {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "backend cut-off failed, disabling locally anyway");
                Some(e.to_string())
            }
        };

        self.store.save_peer(&peer).await?;
        info!("disabled peer");
        Ok(peer)
    }

    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn enable(&self, server: &VpnServer, peer: &Peer) -> Result<Peer, ProvisionError> {
        if peer.status != PeerStatus::Disabled {
            return Err(TransitionError { from: peer.status, to: PeerStatus::Active }.into());
        }
        self.resume(server, peer).await
    }

    #[tracing::instrument(skip_all, fields(server = %server.name, peer = %peer.id))]
    pub async fn rename(&self, server: &VpnServer, peer: &Peer, name: &str) -> Result<Peer, ProvisionError> {
        Self::check_owner(server, peer)?;
        let backend = self.factory.connect(server)?;
        let patch = PeerPatch { name: Some(name.to_string()), ..Default::default() };
        backend.update_config(&peer.backend_id, &patch).await?;

        let mut peer = peer.clone();
        peer.name = name.to_string();
        peer.updated_at = Utc::now();
        self.store.save_peer(&peer).await?;
        Ok(peer)
    }

    pub async fn server_stats(&self, server: &VpnServer) -> Result<ServerStats, ProvisionError> {
        let backend = self.factory.connect(server)?;
        Ok(backend.server_stats().await?)
    }
}
