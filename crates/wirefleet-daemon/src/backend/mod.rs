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

//! The capability set every VPN backend implements, and per-server backend
//! construction.

pub mod outline;
pub mod wireguard;

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::info;
use wirefleet_types::{
    AccessArtifact, DataLimit, Peer, PeerStats, Secret, ServerStats, VpnServer,
};

use crate::error::ErrorKind;
use crate::exec::{AnyExecutor, DEFAULT_COMMAND_TIMEOUT, ExecError};

pub use outline::{DEFAULT_HTTP_TIMEOUT, OutlineBackend};
pub use wireguard::{AllocError, WireGuardBackend};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("{host}: request timed out after {secs}s")]
    Timeout { host: String, secs: u64 },

    #[error("{host}: DNS lookup failed")]
    Dns { host: String },

    #[error("{host}: connection refused")]
    Refused { host: String },

    #[error("{host}: unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("{host} rejected credentials ({status})")]
    Unauthorized { host: String, status: u16 },

    #[error("{host} returned {status}: {body}")]
    Status {
        host: String,
        status: u16,
        body: String,
    },

    #[error("unexpected backend response: {0}")]
    Protocol(String),

    #[error("{0} not found on backend")]
    NotFound(String),

    #[error("server {0} is not configured for this backend")]
    Misconfigured(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Exec(e) => e.kind(),
            Self::Alloc(AllocError::Exhausted(_)) => ErrorKind::ResourceExhausted,
            Self::Alloc(_) | Self::Status { .. } | Self::Protocol(_) | Self::Misconfigured(_) => {
                ErrorKind::Protocol
            }
            Self::Timeout { .. }
            | Self::Dns { .. }
            | Self::Refused { .. }
            | Self::Unreachable { .. } => ErrorKind::Connectivity,
            Self::Unauthorized { .. } => ErrorKind::Authentication,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// What the caller wants provisioned.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub name: String,
    pub limit: DataLimit,
    /// Addresses already held by peers of this server.
    pub existing_addresses: Vec<Ipv4Addr>,
}

/// What the backend handed out.
#[derive(Debug, Clone)]
pub struct ProvisionedPeer {
    pub backend_id: String,
    pub private_key: Option<Secret>,
    pub address: Option<Ipv4Addr>,
    pub access_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PeerPatch {
    pub name: Option<String>,
    pub limit: Option<DataLimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// WireGuard server public key.
    pub public_key: Option<String>,
    /// Whether a fresh server keypair was generated.
    pub generated_keys: bool,
    /// Backend-reported server name (Outline).
    pub server_name: Option<String>,
}

/// Calling any method before `initialize` succeeded is allowed; it may fail
/// with a connectivity error.
pub trait VpnBackend: Send + Sync {
    /// Confirm the backend is reachable and server keys exist.
    fn initialize(&self) -> impl Future<Output = Result<InitReport, BackendError>> + Send;

    fn add_peer(
        &self,
        request: &PeerRequest,
    ) -> impl Future<Output = Result<ProvisionedPeer, BackendError>> + Send;

    fn remove_peer(&self, id: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Re-apply a previously provisioned peer after a suspend or disable.
    fn restore_peer(&self, peer: &Peer) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn peer_stats(&self, id: &str) -> impl Future<Output = Result<PeerStats, BackendError>> + Send;

    /// Stats for every peer, fetched in one round trip where possible.
    fn all_peer_stats(&self) -> impl Future<Output = Result<Vec<PeerStats>, BackendError>> + Send;

    fn server_stats(&self) -> impl Future<Output = Result<ServerStats, BackendError>> + Send;

    fn set_data_limit(
        &self,
        id: &str,
        limit: DataLimit,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Liveness via a real round trip.
    fn check_health(&self) -> impl Future<Output = Result<bool, BackendError>> + Send;

    fn access_config(
        &self,
        peer: &Peer,
    ) -> impl Future<Output = Result<AccessArtifact, BackendError>> + Send;

    fn rename(&self, id: &str, name: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn update_config(
        &self,
        id: &str,
        patch: &PeerPatch,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        async move {
            if let Some(name) = &patch.name {
                self.rename(id, name).await?;
            }
            if let Some(limit) = patch.limit {
                self.set_data_limit(id, limit).await?;
            }
            Ok(())
        }
    }
}

// -- Per-server dispatch --

/// Backend instance for one server, chosen by its access method.
#[derive(Debug)]
pub enum Backend {
    WireGuard(WireGuardBackend<AnyExecutor>),
    Outline(OutlineBackend),
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $call:expr) => {
        match $self {
            Backend::WireGuard($b) => $call,
            Backend::Outline($b) => $call,
        }
    };
}

impl VpnBackend for Backend {
    async fn initialize(&self) -> Result<InitReport, BackendError> {
        dispatch!(self, b => b.initialize().await)
    }

    async fn add_peer(&self, request: &PeerRequest) -> Result<ProvisionedPeer, BackendError> {
        dispatch!(self, b => b.add_peer(request).await)
    }

    async fn remove_peer(&self, id: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.remove_peer(id).await)
    }

    async fn restore_peer(&self, peer: &Peer) -> Result<(), BackendError> {
        dispatch!(self, b => b.restore_peer(peer).await)
    }

    async fn peer_stats(&self, id: &str) -> Result<PeerStats, BackendError> {
        dispatch!(self, b => b.peer_stats(id).await)
    }

    async fn all_peer_stats(&self) -> Result<Vec<PeerStats>, BackendError> {
        dispatch!(self, b => b.all_peer_stats().await)
    }

    async fn server_stats(&self) -> Result<ServerStats, BackendError> {
        dispatch!(self, b => b.server_stats().await)
    }

    async fn set_data_limit(&self, id: &str, limit: DataLimit) -> Result<(), BackendError> {
        dispatch!(self, b => b.set_data_limit(id, limit).await)
    }

    async fn check_health(&self) -> Result<bool, BackendError> {
        dispatch!(self, b => b.check_health().await)
    }

    async fn access_config(&self, peer: &Peer) -> Result<AccessArtifact, BackendError> {
        dispatch!(self, b => b.access_config(peer).await)
    }

    async fn rename(&self, id: &str, name: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.rename(id, name).await)
    }
}

/// Builds a self-contained backend for a server. One instance is built per
/// operation; nothing is cached across servers.
pub trait BackendFactory: Send + Sync {
    type Backend: VpnBackend + 'static;

    fn connect(&self, server: &VpnServer) -> Result<Self::Backend, BackendError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackendSettings {
    pub command_timeout: Duration,
    pub http_timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultFactory {
    settings: BackendSettings,
    follow_ups: TaskTracker,
}

impl DefaultFactory {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            follow_ups: TaskTracker::new(),
        }
    }

    /// Wait for follow-up requests spawned by any backend this factory
    /// built. Call once, before the runtime goes away.
    pub async fn drain(&self) {
        self.follow_ups.close();
        if !self.follow_ups.is_empty() {
            info!(pending = self.follow_ups.len(), "waiting for backend follow-ups");
        }
        self.follow_ups.wait().await;
    }
}

impl BackendFactory for DefaultFactory {
    type Backend = Backend;

    fn connect(&self, server: &VpnServer) -> Result<Backend, BackendError> {
        match AnyExecutor::for_server(server, self.settings.command_timeout) {
            Some(executor) => Ok(Backend::WireGuard(WireGuardBackend::new(executor?, server)?)),
            None => Ok(Backend::Outline(
                OutlineBackend::new(server, self.settings.http_timeout)?
                    .with_follow_ups(self.follow_ups.clone()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wirefleet_types::{ServerAccess, SshAuth};

    fn server(access: ServerAccess) -> VpnServer {
        VpnServer {
            id: Uuid::new_v4(),
            name: "edge-1".into(),
            host: "127.0.0.1".into(),
            port: 22,
            access,
            wireguard: None,
            is_active: true,
            is_healthy: false,
            last_health_check: None,
        }
    }

    #[test]
    fn factory_picks_backend_by_access_method() {
        let factory = DefaultFactory::default();

        let local = factory.connect(&server(ServerAccess::Local)).unwrap();
        assert!(matches!(local, Backend::WireGuard(_)));

        let ssh = factory
            .connect(&server(ServerAccess::Ssh {
                username: "root".into(),
                auth: Some(SshAuth::Password { password: "pw".into() }),
            }))
            .unwrap();
        assert!(matches!(ssh, Backend::WireGuard(_)));

        let api = factory
            .connect(&server(ServerAccess::Api {
                admin_access_key: "secret".into(),
                cert_sha256: None,
            }))
            .unwrap();
        assert!(matches!(api, Backend::Outline(_)));
    }

    #[test]
    fn factory_reports_missing_ssh_credentials() {
        let factory = DefaultFactory::default();
        let err = factory
            .connect(&server(ServerAccess::Ssh { username: "root".into(), auth: None }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn exhaustion_is_classified() {
        let err = BackendError::from(AllocError::Exhausted("10.0.0.0/30".into()));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }
}
