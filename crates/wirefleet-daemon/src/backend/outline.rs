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

//! Outline backend driven through the Outline management REST API.
//!
//! Requests go to `{scheme}://{host}:{port}/{admin key}/{endpoint}`. Loopback
//! hosts use plain HTTP; everything else uses HTTPS with certificate
//! validation off, since Outline servers ship self-signed certificates.

use std::collections::HashMap;
use std::error::Error as _;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use wirefleet_types::{
    AccessArtifact, AccessKey, CounterKind, DataLimit, Peer, PeerStats, ServerAccess, ServerStats, Usage,
    VpnServer,
};

use super::{BackendError, InitReport, PeerRequest, ProvisionedPeer, VpnBackend};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

// -- Wire types --

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

/// Outline has returned key ids both as strings and as numbers; they enter
/// the core as strings only.
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct RawLimit {
    bytes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccessKey {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    name: String,
    access_url: String,
    #[serde(default)]
    data_limit: Option<RawLimit>,
}

impl From<RawAccessKey> for AccessKey {
    fn from(raw: RawAccessKey) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            access_url: raw.access_url,
            data_limit: raw.data_limit.map(|l| l.bytes),
            bytes_transferred: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessKeyList {
    access_keys: Vec<RawAccessKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferMetrics {
    #[serde(default)]
    bytes_transferred_by_user_id: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

// -- Helpers --

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_matches(|c| c == '[' || c == ']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

fn url_host(host: &str) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(v6) => format!("[{v6}]"),
        Err(_) => host.to_string(),
    }
}

fn limit_body(bytes: Option<u64>) -> Value {
    match bytes {
        Some(bytes) => json!({ "limit": { "bytes": bytes } }),
        None => json!({ "limit": null }),
    }
}

/// Outline only reports total transfer per key, so it lands in `bytes_sent`.
fn transfer_usage(bytes: u64) -> Usage {
    Usage {
        bytes_received: 0,
        bytes_sent: bytes,
    }
}

fn key_stats(key: &AccessKey) -> PeerStats {
    PeerStats {
        backend_id: key.id.clone(),
        endpoint: None,
        allowed_ips: Vec::new(),
        last_handshake: None,
        usage: transfer_usage(key.bytes_transferred.unwrap_or(0)),
        counters: CounterKind::Windowed,
        persistent_keepalive: None,
        connected: false,
    }
}

// -- Backend --

#[derive(Clone)]
pub struct OutlineBackend {
    client: Client,
    host: String,
    /// Includes the admin key; never log it.
    base_url: String,
    timeout: Duration,
    /// Corrections issued after key creation. Callers do not wait on them,
    /// but whoever owns the tracker must drain it before exiting.
    follow_ups: TaskTracker,
}

impl fmt::Debug for OutlineBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutlineBackend")
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OutlineBackend {
    pub fn new(server: &VpnServer, timeout: Duration) -> Result<Self, BackendError> {
        let ServerAccess::Api { admin_access_key, .. } = &server.access else {
            return Err(BackendError::Misconfigured(server.name.clone()));
        };

        let scheme = if is_loopback(&server.host) { "http" } else { "https" };
        let base_url = format!(
            "{scheme}://{}:{}/{}",
            url_host(&server.host),
            server.port,
            admin_access_key.expose().trim_matches('/'),
        );

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| BackendError::Protocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            host: server.host.clone(),
            base_url,
            timeout,
            follow_ups: TaskTracker::new(),
        })
    }

    /// Spawn follow-up requests on a shared tracker instead of a private one.
    pub fn with_follow_ups(mut self, tracker: TaskTracker) -> Self {
        self.follow_ups = tracker;
        self
    }

    pub fn follow_ups(&self) -> &TaskTracker {
        &self.follow_ups
    }

    /// Map a transport failure onto timeout, DNS, refused or generic
    /// unreachable so operators can tell them apart.
    fn transport_error(&self, err: reqwest::Error) -> BackendError {
        let host = self.host.clone();
        if err.is_timeout() {
            return BackendError::Timeout { host, secs: self.timeout.as_secs() };
        }

        let mut chain = String::new();
        let mut refused = false;
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<io::Error>() {
                match io.kind() {
                    io::ErrorKind::ConnectionRefused => refused = true,
                    io::ErrorKind::TimedOut => {
                        return BackendError::Timeout { host, secs: self.timeout.as_secs() };
                    }
                    _ => {}
                }
            }
            chain.push_str(&cause.to_string().to_ascii_lowercase());
            chain.push(' ');
            source = cause.source();
        }

        if chain.contains("dns error")
            || chain.contains("failed to lookup address")
            || chain.contains("name or service not known")
            || chain.contains("no such host")
        {
            return BackendError::Dns { host };
        }
        if refused || chain.contains("connection refused") {
            return BackendError::Refused { host };
        }

        // without_url keeps the admin key out of the message
        BackendError::Unreachable { host, reason: err.without_url().to_string() }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Response, BackendError> {
        let url = format!("{}/{path}", self.base_url);
        debug!(host = %self.host, %method, path, "outline request");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status().as_u16();

        match status {
            200..=299 => Ok(resp),
            401 | 403 => {
                warn!(host = %self.host, status, "outline rejected admin key");
                Err(BackendError::Unauthorized { host: self.host.clone(), status })
            }
            404 => Err(BackendError::NotFound(path.to_string())),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                warn!(host = %self.host, status, body = %body, "outline returned unexpected status");
                Err(BackendError::Status { host: self.host.clone(), status, body })
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        self.send(Method::GET, path, None)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("{path}: {}", e.without_url())))
    }

    async fn list_keys(&self) -> Result<Vec<AccessKey>, BackendError> {
        let list: AccessKeyList = self.get_json("access-keys").await?;
        Ok(list.access_keys.into_iter().map(AccessKey::from).collect())
    }

    async fn transfer(&self) -> Result<HashMap<String, f64>, BackendError> {
        let metrics: TransferMetrics = self.get_json("metrics/transfer").await?;
        Ok(metrics.bytes_transferred_by_user_id)
    }

    /// Keys with their transferred bytes filled in from the metrics endpoint.
    async fn keys_with_usage(&self) -> Result<Vec<AccessKey>, BackendError> {
        let mut keys = self.list_keys().await?;
        let transfer = self.transfer().await?;
        for key in &mut keys {
            key.bytes_transferred = Some(transfer.get(&key.id).map_or(0, |b| b.max(0.0) as u64));
        }
        Ok(keys)
    }

    async fn find_key(&self, id: &str) -> Result<AccessKey, BackendError> {
        self.list_keys()
            .await?
            .into_iter()
            .find(|k| k.id == id)
            .ok_or_else(|| BackendError::NotFound(format!("access key {id}")))
    }

    /// Try the dedicated endpoint first, then the general key update.
    async fn update_with_fallback(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        fallback: Value,
        key_id: &str,
    ) -> Result<(), BackendError> {
        match self.send(method, path, body).await {
            Ok(_) => Ok(()),
            Err(primary) => {
                warn!(host = %self.host, key = key_id, error = %primary, "dedicated endpoint failed, falling back to key update");
                match self
                    .send(Method::PUT, &format!("access-keys/{key_id}"), Some(fallback))
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!(host = %self.host, key = key_id, error = %e, "fallback key update failed");
                        Err(primary)
                    }
                }
            }
        }
    }
}

impl VpnBackend for OutlineBackend {
    #[tracing::instrument(skip(self), fields(host = %self.host))]
    async fn initialize(&self) -> Result<InitReport, BackendError> {
        let info: ServerInfo = self.get_json("server").await?;
        info!(name = ?info.name, version = ?info.version, "outline server reachable");
        Ok(InitReport {
            public_key: None,
            generated_keys: false,
            server_name: info.name,
        })
    }

    #[tracing::instrument(skip(self, request), fields(host = %self.host, name = %request.name))]
    async fn add_peer(&self, request: &PeerRequest) -> Result<ProvisionedPeer, BackendError> {
        let cap = request.limit.cap_bytes();
        let mut body = json!({ "name": request.name });
        if let Some(bytes) = cap {
            body["limit"] = json!({ "bytes": bytes });
        }

        let raw: RawAccessKey = self
            .send(Method::POST, "access-keys", Some(body))
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("access-keys: {}", e.without_url())))?;
        let key = AccessKey::from(raw);
        info!(key = %key.id, "created outline access key");

        let limit_ignored = cap.is_some() && key.data_limit != cap;
        let name_ignored = !request.name.is_empty() && key.name != request.name;
        if limit_ignored || name_ignored {
            let this = self.clone();
            let id = key.id.clone();
            let name = request.name.clone();
            let limit = request.limit;
            self.follow_ups.spawn(async move {
                if name_ignored {
                    if let Err(e) = this.rename(&id, &name).await {
                        warn!(key = %id, error = %e, "follow-up rename failed");
                    }
                }
                if limit_ignored {
                    if let Err(e) = this.set_data_limit(&id, limit).await {
                        warn!(key = %id, error = %e, "follow-up data limit failed");
                    }
                }
            });
        }

        Ok(ProvisionedPeer {
            backend_id: key.id,
            private_key: None,
            address: None,
            access_url: Some(key.access_url),
        })
    }

    #[tracing::instrument(skip(self), fields(host = %self.host))]
    async fn remove_peer(&self, id: &str) -> Result<(), BackendError> {
        self.send(Method::DELETE, &format!("access-keys/{id}"), None).await?;
        info!(key = id, "deleted outline access key");
        Ok(())
    }

    async fn restore_peer(&self, peer: &Peer) -> Result<(), BackendError> {
        let limit = match peer.recorded_limit() {
            DataLimit::Suspended => DataLimit::Unlimited,
            other => other,
        };
        self.set_data_limit(&peer.backend_id, limit).await
    }

    async fn peer_stats(&self, id: &str) -> Result<PeerStats, BackendError> {
        self.keys_with_usage()
            .await?
            .iter()
            .find(|k| k.id == id)
            .map(key_stats)
            .ok_or_else(|| BackendError::NotFound(format!("access key {id}")))
    }

    async fn all_peer_stats(&self) -> Result<Vec<PeerStats>, BackendError> {
        Ok(self.keys_with_usage().await?.iter().map(key_stats).collect())
    }

    async fn server_stats(&self) -> Result<ServerStats, BackendError> {
        let keys = self.keys_with_usage().await?;
        let total: u64 = keys.iter().filter_map(|k| k.bytes_transferred).sum();
        Ok(ServerStats {
            peer_count: keys.len(),
            connected_count: 0,
            usage: transfer_usage(total),
        })
    }

    #[tracing::instrument(skip(self), fields(host = %self.host))]
    async fn set_data_limit(&self, id: &str, limit: DataLimit) -> Result<(), BackendError> {
        let live = self.find_key(id).await?.id;
        let cap = limit.cap_bytes();

        match cap {
            Some(bytes) => {
                self.update_with_fallback(
                    Method::PUT,
                    &format!("access-keys/{live}/data-limit"),
                    Some(json!({ "limit": { "bytes": bytes } })),
                    limit_body(cap),
                    &live,
                )
                .await?
            }
            None => {
                self.update_with_fallback(
                    Method::DELETE,
                    &format!("access-keys/{live}/data-limit"),
                    None,
                    limit_body(None),
                    &live,
                )
                .await?
            }
        }

        info!(key = %live, %limit, "applied outline data limit");
        Ok(())
    }

    async fn check_health(&self) -> Result<bool, BackendError> {
        match self.send(Method::GET, "server", None).await {
            Ok(_) => Ok(true),
            Err(BackendError::Status { status, .. }) => {
                debug!(host = %self.host, status, "outline health check returned error status");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn access_config(&self, peer: &Peer) -> Result<AccessArtifact, BackendError> {
        let key = self.find_key(&peer.backend_id).await?;
        Ok(AccessArtifact::OutlineUrl { url: key.access_url })
    }

    async fn rename(&self, id: &str, name: &str) -> Result<(), BackendError> {
        self.update_with_fallback(
            Method::PUT,
            &format!("access-keys/{id}/name"),
            Some(json!({ "name": name })),
            json!({ "name": name }),
            id,
        )
        .await
    }
}
