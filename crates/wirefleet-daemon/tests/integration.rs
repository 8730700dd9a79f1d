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


use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wirefleet_daemon::backend::{
    BackendError, BackendFactory, DefaultFactory, InitReport, OutlineBackend, PeerPatch, PeerRequest,
    ProvisionedPeer, VpnBackend,
};
use wirefleet_daemon::error::ErrorKind;
use wirefleet_daemon::provision::{ProvisionError, ProvisionRequest, Provisioner};
use wirefleet_daemon::scheduler::{ScheduleSettings, Scheduler};
use wirefleet_daemon::store::{FleetStore, MemoryStore, StoreError};
use wirefleet_types::{
    AccessArtifact, CounterKind, DataLimit, Peer, PeerStats, PeerStatus, ServerAccess, ServerStats, Usage, VpnServer,
};

// -- Mock Outline management API --

const ADMIN_KEY: &str = "s3cr3t-admin-key";

#[derive(Clone)]
struct Route {
    method: &'static str,
    path: String,
    status: u16,
    body: String,
    delay: Duration,
}

fn route(method: &'static str, path: &str, status: u16, body: &str) -> Route {
    Route {
        method,
        path: format!("/{ADMIN_KEY}/{path}"),
        status,
        body: body.to_string(),
        delay: Duration::ZERO,
    }
}

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    body: String,
}

struct MockOutline {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    _shutdown: oneshot::Sender<()>,
}

impl MockOutline {
    fn server(&self) -> VpnServer {
        api_server(self.addr.port())
    }

    fn backend(&self) -> OutlineBackend {
        OutlineBackend::new(&self.server(), Duration::from_secs(5)).unwrap()
    }

    /// `METHOD path` of each request, admin key stripped.
    fn calls(&self) -> Vec<String> {
        let prefix = format!("/{ADMIN_KEY}/");
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path.trim_start_matches(&prefix)))
            .collect()
    }

    fn body_of(&self, method: &str, path: &str) -> serde_json::Value {
        let full = format!("/{ADMIN_KEY}/{path}");
        let requests = self.requests.lock().unwrap();
        let req = requests
            .iter()
            .find(|r| r.method == method && r.path == full)
            .unwrap_or_else(|| panic!("no {method} {path} request"));
        serde_json::from_str(&req.body).unwrap()
    }
}

fn api_server(port: u16) -> VpnServer {
    VpnServer {
        id: Uuid::new_v4(),
        name: "outline-test".into(),
        host: "127.0.0.1".into(),
        port,
        access: ServerAccess::Api {
            admin_access_key: ADMIN_KEY.into(),
            cert_sha256: None,
        },
        wireguard: None,
        is_active: true,
        is_healthy: false,
        last_health_check: None,
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    Some(Recorded { method, path, body })
}

async fn handle(mut stream: TcpStream, routes: Arc<Vec<Route>>, recorded: Arc<Mutex<Vec<Recorded>>>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let matched = routes
        .iter()
        .find(|r| r.method == request.method && r.path == request.path)
        .cloned();
    recorded.lock().unwrap().push(request);

    let (status, body, delay) = match matched {
        Some(r) => (r.status, r.body, r.delay),
        None => (404, "{}".to_string(), Duration::ZERO),
    };
    tokio::time::sleep(delay).await;

    let response = if status == 204 {
        "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_string()
    } else {
        format!(
            "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body,
        )
    };
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Spawn a tiny HTTP server answering from `routes`; anything else is 404.
async fn spawn_mock_outline(routes: Vec<Route>) -> MockOutline {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);
    let routes = Arc::new(routes);
    let (tx, mut rx) = oneshot::channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let (stream, _) = accept.unwrap();
                    tokio::spawn(handle(stream, Arc::clone(&routes), Arc::clone(&recorded)));
                }
                _ = &mut rx => break,
            }
        }
    });

    MockOutline { addr, requests, _shutdown: tx }
}

const KEY_LIST: &str = r#"{"accessKeys":[
    {"id":7,"name":"laptop","password":"p","port":1234,"method":"chacha20-ietf-poly1305","accessUrl":"ss://Y2hhY2hh@127.0.0.1:1234/?outline=1"},
    {"id":"8","name":"phone","accessUrl":"ss://cGhvbmU@127.0.0.1:1234/?outline=1","dataLimit":{"bytes":5000}}
]}"#;

// -- Outline backend --

#[tokio::test]
async fn outline_add_peer_returns_access_url() {
    let mock = spawn_mock_outline(vec![route(
        "POST",
        "access-keys",
        201,
        r#"{"id":"3","name":"laptop","accessUrl":"ss://bmV3@127.0.0.1:1234/","dataLimit":{"bytes":1000}}"#,
    )])
    .await;

    let provisioned = mock
        .backend()
        .add_peer(&PeerRequest {
            name: "laptop".into(),
            limit: DataLimit::Capped(1000),
            existing_addresses: vec![],
        })
        .await
        .unwrap();

    assert_eq!(provisioned.backend_id, "3");
    assert_eq!(provisioned.access_url.as_deref(), Some("ss://bmV3@127.0.0.1:1234/"));
    assert!(provisioned.private_key.is_none());
    assert_eq!(
        mock.body_of("POST", "access-keys"),
        serde_json::json!({ "name": "laptop", "limit": { "bytes": 1000 } })
    );
    // name and limit were honoured, so no follow-up requests
    assert_eq!(mock.calls(), vec!["POST access-keys"]);
}

#[tokio::test]
async fn outline_ignored_limit_is_applied_before_drain_returns() {
    let mock = spawn_mock_outline(vec![
        route(
            "POST",
            "access-keys",
            201,
            r#"{"id":"3","name":"laptop","accessUrl":"ss://bmV3@127.0.0.1:1234/"}"#,
        ),
        route(
            "GET",
            "access-keys",
            200,
            r#"{"accessKeys":[{"id":"3","name":"laptop","accessUrl":"ss://bmV3@127.0.0.1:1234/"}]}"#,
        ),
        route("PUT", "access-keys/3/data-limit", 204, ""),
    ])
    .await;

    let factory = DefaultFactory::default();
    let backend = factory.connect(&mock.server()).unwrap();
    let provisioned = backend
        .add_peer(&PeerRequest {
            name: "laptop".into(),
            limit: DataLimit::Capped(1000),
            existing_addresses: vec![],
        })
        .await
        .unwrap();
    assert_eq!(provisioned.backend_id, "3");
    drop(backend);

    tokio::time::timeout(Duration::from_secs(5), factory.drain())
        .await
        .expect("follow-up never finished");

    assert_eq!(
        mock.calls(),
        vec!["POST access-keys", "GET access-keys", "PUT access-keys/3/data-limit"]
    );
    assert_eq!(
        mock.body_of("PUT", "access-keys/3/data-limit"),
        serde_json::json!({ "limit": { "bytes": 1000 } })
    );
}

#[tokio::test]
async fn outline_update_config_renames_and_limits() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route("PUT", "access-keys/7/name", 204, ""),
        route("PUT", "access-keys/7/data-limit", 204, ""),
    ])
    .await;

    mock.backend()
        .update_config(
            "7",
            &PeerPatch {
                name: Some("work laptop".into()),
                limit: Some(DataLimit::Capped(2048)),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        mock.calls(),
        vec!["PUT access-keys/7/name", "GET access-keys", "PUT access-keys/7/data-limit"]
    );
    assert_eq!(
        mock.body_of("PUT", "access-keys/7/name"),
        serde_json::json!({ "name": "work laptop" })
    );
}

#[tokio::test]
async fn outline_set_limit_resolves_numeric_id() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route("PUT", "access-keys/7/data-limit", 204, ""),
    ])
    .await;

    mock.backend().set_data_limit("7", DataLimit::Capped(1_000_000)).await.unwrap();

    assert_eq!(mock.calls(), vec!["GET access-keys", "PUT access-keys/7/data-limit"]);
    assert_eq!(
        mock.body_of("PUT", "access-keys/7/data-limit"),
        serde_json::json!({ "limit": { "bytes": 1_000_000 } })
    );
}

#[tokio::test]
async fn outline_suspend_uses_one_byte_cap() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route("PUT", "access-keys/8/data-limit", 204, ""),
    ])
    .await;

    mock.backend().set_data_limit("8", DataLimit::Suspended).await.unwrap();
    assert_eq!(
        mock.body_of("PUT", "access-keys/8/data-limit"),
        serde_json::json!({ "limit": { "bytes": 1 } })
    );
}

#[tokio::test]
async fn outline_unlimited_deletes_limit() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route("DELETE", "access-keys/8/data-limit", 204, ""),
    ])
    .await;

    mock.backend().set_data_limit("8", DataLimit::Unlimited).await.unwrap();
    assert_eq!(mock.calls(), vec!["GET access-keys", "DELETE access-keys/8/data-limit"]);
}

#[tokio::test]
async fn outline_limit_falls_back_to_key_update() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route("PUT", "access-keys/7/data-limit", 500, r#"{"code":"Internal"}"#),
        route("PUT", "access-keys/7", 200, "{}"),
    ])
    .await;

    mock.backend().set_data_limit("7", DataLimit::Capped(42)).await.unwrap();

    assert_eq!(
        mock.calls(),
        vec!["GET access-keys", "PUT access-keys/7/data-limit", "PUT access-keys/7"]
    );
    assert_eq!(
        mock.body_of("PUT", "access-keys/7"),
        serde_json::json!({ "limit": { "bytes": 42 } })
    );
}

#[tokio::test]
async fn outline_fallback_failure_surfaces_primary_error() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route("PUT", "access-keys/7/data-limit", 500, r#"{"code":"Internal"}"#),
        route("PUT", "access-keys/7", 400, "{}"),
    ])
    .await;

    let err = mock.backend().set_data_limit("7", DataLimit::Capped(42)).await.unwrap_err();
    assert!(matches!(err, BackendError::Status { status: 500, .. }), "{err:?}");
}

#[tokio::test]
async fn outline_unknown_key_is_not_found() {
    let mock = spawn_mock_outline(vec![route("GET", "access-keys", 200, KEY_LIST)]).await;

    let err = mock.backend().set_data_limit("99", DataLimit::Capped(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn outline_stats_sum_transfer() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route(
            "GET",
            "metrics/transfer",
            200,
            r#"{"bytesTransferredByUserId":{"7":1500,"8":250.0,"404":99}}"#,
        ),
    ])
    .await;
    let backend = mock.backend();

    let stats = backend.server_stats().await.unwrap();
    assert_eq!(stats.peer_count, 2);
    assert_eq!(stats.usage.total(), 1750);

    let peer = backend.peer_stats("8").await.unwrap();
    assert_eq!(peer.usage.total(), 250);
}

#[tokio::test]
async fn outline_access_config_is_live_url() {
    let mock = spawn_mock_outline(vec![route("GET", "access-keys", 200, KEY_LIST)]).await;
    let mut peer = Peer::new(Uuid::new_v4(), "laptop", "7");
    peer.access_url = Some("ss://stale".into());

    let artifact = mock.backend().access_config(&peer).await.unwrap();
    assert_eq!(
        artifact,
        AccessArtifact::OutlineUrl { url: "ss://Y2hhY2hh@127.0.0.1:1234/?outline=1".into() }
    );
}

#[tokio::test]
async fn outline_health_and_init() {
    let mock = spawn_mock_outline(vec![route(
        "GET",
        "server",
        200,
        r#"{"name":"edge","serverId":"abc","version":"1.8.0"}"#,
    )])
    .await;
    let backend = mock.backend();

    assert!(backend.check_health().await.unwrap());
    let report = backend.initialize().await.unwrap();
    assert_eq!(report.server_name.as_deref(), Some("edge"));
    assert!(report.public_key.is_none());

    let failing = spawn_mock_outline(vec![route("GET", "server", 503, "down")]).await;
    assert!(!failing.backend().check_health().await.unwrap());
}

#[tokio::test]
async fn outline_rejected_key_is_authentication_error() {
    let mock = spawn_mock_outline(vec![route("GET", "access-keys", 401, "{}")]).await;

    let err = mock.backend().all_peer_stats().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
}

#[tokio::test]
async fn outline_refused_connection_is_distinct() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let backend = OutlineBackend::new(&api_server(port), Duration::from_secs(2)).unwrap();
    let err = backend.check_health().await.unwrap_err();

    assert!(matches!(err, BackendError::Refused { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(!err.to_string().contains(ADMIN_KEY));
}

#[tokio::test]
async fn outline_slow_server_times_out() {
    let mut slow = route("GET", "server", 200, "{}");
    slow.delay = Duration::from_secs(3);
    let mock = spawn_mock_outline(vec![slow]).await;

    let backend = OutlineBackend::new(&mock.server(), Duration::from_millis(300)).unwrap();
    let err = backend.check_health().await.unwrap_err();

    assert!(matches!(err, BackendError::Timeout { .. }), "{err:?}");
    assert!(!err.to_string().contains(ADMIN_KEY));
}

// -- Mock backend and factory --

#[derive(Debug, Clone, Default)]
struct MockSpec {
    healthy: bool,
    hang: bool,
    fail_remove: bool,
    stats: Vec<PeerStats>,
}

#[derive(Debug, Clone, Default)]
struct MockFactory {
    specs: HashMap<Uuid, MockSpec>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFactory {
    fn with(mut self, server: &VpnServer, spec: MockSpec) -> Self {
        self.specs.insert(server.id, spec);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct MockBackend {
    spec: MockSpec,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn maybe_hang(&self) {
        if self.spec.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

impl BackendFactory for MockFactory {
    type Backend = MockBackend;

    fn connect(&self, server: &VpnServer) -> Result<MockBackend, BackendError> {
        Ok(MockBackend {
            spec: self.specs.get(&server.id).cloned().unwrap_or_default(),
            calls: Arc::clone(&self.calls),
        })
    }
}

impl VpnBackend for MockBackend {
    async fn initialize(&self) -> Result<InitReport, BackendError> {
        self.record("initialize".into());
        Ok(InitReport {
            public_key: Some("c2VydmVyLXB1YmxpYy1rZXk=".into()),
            generated_keys: true,
            server_name: None,
        })
    }

    async fn add_peer(&self, request: &PeerRequest) -> Result<ProvisionedPeer, BackendError> {
        self.record(format!("add {}", request.name));
        Ok(ProvisionedPeer {
            backend_id: format!("key-{}", request.name),
            private_key: Some("cHJpdmF0ZQ==".into()),
            address: Some(Ipv4Addr::new(10, 0, 0, 2 + request.existing_addresses.len() as u8)),
            access_url: None,
        })
    }

    async fn remove_peer(&self, id: &str) -> Result<(), BackendError> {
        self.record(format!("remove {id}"));
        if self.spec.fail_remove {
            return Err(BackendError::Refused { host: "mock".into() });
        }
        Ok(())
    }

    async fn restore_peer(&self, peer: &Peer) -> Result<(), BackendError> {
        self.record(format!("restore {}", peer.backend_id));
        Ok(())
    }

    async fn peer_stats(&self, id: &str) -> Result<PeerStats, BackendError> {
        self.spec
            .stats
            .iter()
            .find(|s| s.backend_id == id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn all_peer_stats(&self) -> Result<Vec<PeerStats>, BackendError> {
        self.maybe_hang().await;
        Ok(self.spec.stats.clone())
    }

    async fn server_stats(&self) -> Result<ServerStats, BackendError> {
        Ok(ServerStats::from_peers(&self.spec.stats))
    }

    async fn set_data_limit(&self, id: &str, limit: DataLimit) -> Result<(), BackendError> {
        self.maybe_hang().await;
        self.record(format!("limit {id} {limit}"));
        Ok(())
    }

    async fn check_health(&self) -> Result<bool, BackendError> {
        self.maybe_hang().await;
        Ok(self.spec.healthy)
    }

    async fn access_config(&self, peer: &Peer) -> Result<AccessArtifact, BackendError> {
        Ok(AccessArtifact::OutlineUrl { url: format!("ss://{}", peer.backend_id) })
    }

    async fn rename(&self, id: &str, name: &str) -> Result<(), BackendError> {
        self.record(format!("rename {id} {name}"));
        Ok(())
    }
}

fn local_server(name: &str) -> VpnServer {
    VpnServer {
        id: Uuid::new_v4(),
        name: name.into(),
        host: "127.0.0.1".into(),
        port: 22,
        access: ServerAccess::Local,
        wireguard: None,
        is_active: true,
        is_healthy: false,
        last_health_check: None,
    }
}

fn stats(backend_id: &str, rx: u64, tx: u64) -> PeerStats {
    PeerStats {
        backend_id: backend_id.into(),
        endpoint: Some("198.51.100.7:51820".into()),
        allowed_ips: vec!["10.0.0.2/32".into()],
        last_handshake: Some(Utc::now()),
        usage: Usage { bytes_received: rx, bytes_sent: tx },
        counters: CounterKind::Restarting,
        persistent_keepalive: Some(25),
        connected: true,
    }
}

fn fast_settings() -> ScheduleSettings {
    ScheduleSettings {
        health_interval: Duration::from_millis(50),
        usage_interval: Duration::from_millis(50),
        expiration_interval: Duration::from_millis(50),
        limit_interval: Duration::from_millis(50),
        server_timeout: Duration::from_millis(200),
    }
}

async fn seeded_store(servers: &[&VpnServer]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for server in servers {
        store.upsert_server((*server).clone()).await.unwrap();
    }
    store
}

// -- Scheduler --

#[tokio::test]
async fn health_check_isolates_hung_server() {
    let hung = local_server("hung");
    let good = local_server("good");
    let store = seeded_store(&[&hung, &good]).await;
    let factory = MockFactory::default()
        .with(&hung, MockSpec { hang: true, ..Default::default() })
        .with(&good, MockSpec { healthy: true, ..Default::default() });

    let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(factory), fast_settings());
    let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run_health_check())
        .await
        .expect("hung server stalled the whole run");

    assert_eq!(report.servers_ok, 2);
    let good = store.server(good.id).await.unwrap();
    assert!(good.is_healthy);
    assert!(good.last_health_check.is_some());

    let hung = store.server(hung.id).await.unwrap();
    assert!(!hung.is_healthy);
    assert!(hung.last_health_check.is_some());
}

#[tokio::test]
async fn health_check_skips_inactive_servers() {
    let mut idle = local_server("idle");
    idle.is_active = false;
    let store = seeded_store(&[&idle]).await;
    let factory = MockFactory::default().with(&idle, MockSpec { healthy: true, ..Default::default() });

    let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(factory), fast_settings());
    let report = scheduler.run_health_check().await;

    assert_eq!(report.servers_ok, 0);
    assert!(store.server(idle.id).await.unwrap().last_health_check.is_none());
}

#[tokio::test]
async fn usage_sync_accumulates_and_survives_counter_reset() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;

    let mut peer = Peer::new(server.id, "laptop", "pk-laptop");
    peer.usage = Usage { bytes_received: 5000, bytes_sent: 7000 };
    peer.last_counters = Usage { bytes_received: 4000, bytes_sent: 6000 };
    store.save_peer(&peer).await.unwrap();

    let mut disabled = Peer::new(server.id, "old", "pk-old");
    disabled.transition(PeerStatus::Disabled).unwrap();
    store.save_peer(&disabled).await.unwrap();

    // counters dropped below the last observation: the backend reset them
    let factory = MockFactory::default().with(
        &server,
        MockSpec {
            stats: vec![stats("pk-laptop", 100, 300), stats("pk-old", 999, 999)],
            ..Default::default()
        },
    );
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(factory), fast_settings());
    let report = scheduler.run_usage_sync().await;
    assert_eq!(report.updated, 1);

    let synced = store.peer(peer.id).await.unwrap();
    assert_eq!(synced.usage, Usage { bytes_received: 5100, bytes_sent: 7300 });
    assert_eq!(synced.last_counters, Usage { bytes_received: 100, bytes_sent: 300 });
    assert!(synced.connected);
    assert!(synced.last_handshake.is_some());

    let untouched = store.peer(disabled.id).await.unwrap();
    assert_eq!(untouched.usage, Usage::default());
}

#[tokio::test]
async fn usage_sync_outline_window_drop_is_not_a_reset() {
    let mock = spawn_mock_outline(vec![
        route("GET", "access-keys", 200, KEY_LIST),
        route(
            "GET",
            "metrics/transfer",
            200,
            r#"{"bytesTransferredByUserId":{"7":900,"8":1200}}"#,
        ),
    ])
    .await;
    let server = mock.server();
    let store = seeded_store(&[&server]).await;

    // "7" fell from 1000 to 900 as the metrics window moved on
    let mut shrinking = Peer::new(server.id, "laptop", "7");
    shrinking.usage = Usage { bytes_received: 0, bytes_sent: 1000 };
    shrinking.last_counters = Usage { bytes_received: 0, bytes_sent: 1000 };
    store.save_peer(&shrinking).await.unwrap();

    let mut growing = Peer::new(server.id, "phone", "8");
    growing.usage = Usage { bytes_received: 0, bytes_sent: 1000 };
    growing.last_counters = Usage { bytes_received: 0, bytes_sent: 1000 };
    store.save_peer(&growing).await.unwrap();

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::new(DefaultFactory::default()),
        ScheduleSettings { server_timeout: Duration::from_secs(5), ..fast_settings() },
    );
    let report = scheduler.run_usage_sync().await;
    assert_eq!(report.updated, 2);

    let shrinking = store.peer(shrinking.id).await.unwrap();
    assert_eq!(shrinking.usage.total(), 1000);
    assert_eq!(shrinking.last_counters.bytes_sent, 900);
    assert_eq!(store.peer(growing.id).await.unwrap().usage.total(), 1200);
}

#[tokio::test]
async fn usage_sync_failure_on_one_server_spares_others() {
    let hung = local_server("hung");
    let good = local_server("good");
    let store = seeded_store(&[&hung, &good]).await;
    store.save_peer(&Peer::new(hung.id, "a", "pk-a")).await.unwrap();
    let peer = Peer::new(good.id, "b", "pk-b");
    store.save_peer(&peer).await.unwrap();

    let factory = MockFactory::default()
        .with(&hung, MockSpec { hang: true, ..Default::default() })
        .with(&good, MockSpec { stats: vec![stats("pk-b", 10, 20)], ..Default::default() });
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(factory), fast_settings());
    let report = scheduler.run_usage_sync().await;

    assert_eq!(report.servers_ok, 1);
    assert_eq!(report.servers_failed, 1);
    assert_eq!(store.peer(peer.id).await.unwrap().usage.total(), 30);
}

#[tokio::test]
async fn limit_enforcement_suspends_only_peers_at_limit() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;

    let mut at_limit = Peer::new(server.id, "at", "pk-at");
    at_limit.apply_limit(DataLimit::Capped(1000));
    at_limit.usage = Usage { bytes_received: 400, bytes_sent: 600 };

    let mut under = Peer::new(server.id, "under", "pk-under");
    under.apply_limit(DataLimit::Capped(1000));
    under.usage = Usage { bytes_received: 400, bytes_sent: 599 };

    let mut plan_capped = Peer::new(server.id, "plan", "pk-plan");
    plan_capped.is_unlimited = false;
    plan_capped.plan_limit_bytes = Some(500);
    plan_capped.usage = Usage { bytes_received: 0, bytes_sent: 800 };

    let mut unlimited = Peer::new(server.id, "free", "pk-free");
    unlimited.usage = Usage { bytes_received: u64::MAX / 2, bytes_sent: 0 };

    for peer in [&at_limit, &under, &plan_capped, &unlimited] {
        store.save_peer(peer).await.unwrap();
    }

    let factory = Arc::new(MockFactory::default());
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&factory), fast_settings());
    let report = scheduler.run_limit_enforcement().await;
    assert_eq!(report.updated, 2);

    for id in [at_limit.id, plan_capped.id] {
        let peer = store.peer(id).await.unwrap();
        assert_eq!(peer.status, PeerStatus::Suspended);
        assert!(!peer.enabled);
        assert!(peer.last_error.is_none());
    }
    for id in [under.id, unlimited.id] {
        let peer = store.peer(id).await.unwrap();
        assert_eq!(peer.status, PeerStatus::Active);
        assert!(peer.enabled);
    }

    let mut calls = factory.calls();
    calls.sort();
    assert_eq!(calls, vec!["limit pk-at suspended", "limit pk-plan suspended"]);
}

#[tokio::test]
async fn limit_enforcement_records_backend_failure() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let mut peer = Peer::new(server.id, "at", "pk-at");
    peer.apply_limit(DataLimit::Capped(10));
    peer.usage = Usage { bytes_received: 10, bytes_sent: 0 };
    store.save_peer(&peer).await.unwrap();

    let factory = MockFactory::default().with(&server, MockSpec { hang: true, ..Default::default() });
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(factory), fast_settings());
    scheduler.run_limit_enforcement().await;

    let peer = store.peer(peer.id).await.unwrap();
    assert_eq!(peer.status, PeerStatus::Suspended);
    assert!(peer.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn expiration_sweep_marks_without_backend_calls() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let now = Utc::now();

    let mut past = Peer::new(server.id, "past", "pk-past");
    past.expires_at = Some(now - ChronoDuration::days(1));
    let mut suspended_past = Peer::new(server.id, "susp", "pk-susp");
    suspended_past.expires_at = Some(now - ChronoDuration::hours(1));
    suspended_past.transition(PeerStatus::Suspended).unwrap();
    let mut future = Peer::new(server.id, "future", "pk-future");
    future.expires_at = Some(now + ChronoDuration::days(30));
    let forever = Peer::new(server.id, "forever", "pk-forever");

    for peer in [&past, &suspended_past, &future, &forever] {
        store.save_peer(peer).await.unwrap();
    }

    let factory = Arc::new(MockFactory::default());
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&factory), fast_settings());
    let report = scheduler.run_expiration_sweep(now).await;
    assert_eq!(report.updated, 2);

    for id in [past.id, suspended_past.id] {
        let peer = store.peer(id).await.unwrap();
        assert_eq!(peer.status, PeerStatus::Expired);
        assert!(!peer.enabled);
    }
    for id in [future.id, forever.id] {
        assert_eq!(store.peer(id).await.unwrap().status, PeerStatus::Active);
    }
    assert!(factory.calls().is_empty());

    // a second sweep leaves terminal peers alone
    assert_eq!(scheduler.run_expiration_sweep(now).await.updated, 0);
}

#[tokio::test]
async fn spawned_jobs_run_until_cancelled() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let factory = MockFactory::default().with(&server, MockSpec { healthy: true, ..Default::default() });
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), Arc::new(factory), fast_settings()));

    let shutdown = CancellationToken::new();
    let handles = Arc::clone(&scheduler).spawn(shutdown.clone());
    assert_eq!(handles.len(), 4);

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    assert!(store.server(server.id).await.unwrap().is_healthy);
}

// -- Provisioning --

/// Delegates to a memory store but refuses to save peers.
struct ReadOnlyStore(MemoryStore);

impl FleetStore for ReadOnlyStore {
    async fn active_servers(&self) -> Result<Vec<VpnServer>, StoreError> {
        self.0.active_servers().await
    }

    async fn server(&self, id: Uuid) -> Result<VpnServer, StoreError> {
        self.0.server(id).await
    }

    async fn server_by_name(&self, name: &str) -> Result<VpnServer, StoreError> {
        self.0.server_by_name(name).await
    }

    async fn upsert_server(&self, server: VpnServer) -> Result<(), StoreError> {
        self.0.upsert_server(server).await
    }

    async fn record_health(&self, id: Uuid, healthy: bool, at: chrono::DateTime<Utc>) -> Result<(), StoreError> {
        self.0.record_health(id, healthy, at).await
    }

    async fn peers_for_server(&self, server_id: Uuid) -> Result<Vec<Peer>, StoreError> {
        self.0.peers_for_server(server_id).await
    }

    async fn all_peers(&self) -> Result<Vec<Peer>, StoreError> {
        self.0.all_peers().await
    }

    async fn peer(&self, id: Uuid) -> Result<Peer, StoreError> {
        self.0.peer(id).await
    }

    async fn save_peer(&self, _peer: &Peer) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("read-only".into()))
    }

    async fn delete_peer(&self, id: Uuid) -> Result<(), StoreError> {
        self.0.delete_peer(id).await
    }
}

fn provisioner(store: &Arc<MemoryStore>, factory: &Arc<MockFactory>) -> Provisioner<MemoryStore, MockFactory> {
    Provisioner::new(Arc::clone(store), Arc::clone(factory))
}

#[tokio::test]
async fn provision_records_peer_with_limits() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    store.save_peer(&Peer::new(server.id, "existing", "pk-existing")).await.unwrap();
    let factory = Arc::new(MockFactory::default());

    let expires = Utc::now() + ChronoDuration::days(30);
    let peer = provisioner(&store, &factory)
        .provision_peer(
            &server,
            ProvisionRequest {
                name: "laptop".into(),
                limit_bytes: Some(5_000),
                plan_limit_bytes: Some(10_000),
                expires_at: Some(expires),
            },
        )
        .await
        .unwrap();

    assert_eq!(peer.backend_id, "key-laptop");
    assert_eq!(peer.status, PeerStatus::Active);
    assert_eq!(peer.effective_limit(), Some(5_000));
    assert_eq!(peer.expires_at, Some(expires));
    assert_eq!(store.peer(peer.id).await.unwrap(), peer);
    assert_eq!(factory.calls(), vec!["add laptop"]);
}

#[tokio::test]
async fn provision_without_device_cap_uses_plan() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let factory = Arc::new(MockFactory::default());

    let peer = provisioner(&store, &factory)
        .provision_peer(
            &server,
            ProvisionRequest {
                name: "phone".into(),
                plan_limit_bytes: Some(10_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(peer.effective_limit(), Some(10_000));
}

#[tokio::test]
async fn provision_with_zero_limit_starts_suspended() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let factory = Arc::new(MockFactory::default());

    let peer = provisioner(&store, &factory)
        .provision_peer(
            &server,
            ProvisionRequest {
                name: "paused".into(),
                limit_bytes: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(peer.status, PeerStatus::Suspended);
    assert_eq!(peer.recorded_limit(), DataLimit::Suspended);
    assert_eq!(factory.calls(), vec!["add paused", "limit key-paused suspended"]);
}

#[tokio::test]
async fn provision_rolls_back_backend_peer_when_save_fails() {
    let server = local_server("edge");
    let inner = MemoryStore::new();
    inner.upsert_server(server.clone()).await.unwrap();
    let store = Arc::new(ReadOnlyStore(inner));
    let factory = Arc::new(MockFactory::default());

    let err = Provisioner::new(Arc::clone(&store), Arc::clone(&factory))
        .provision_peer(&server, ProvisionRequest { name: "laptop".into(), ..Default::default() })
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Store(StoreError::Unavailable(_))), "{err:?}");
    assert_eq!(factory.calls(), vec!["add laptop", "remove key-laptop"]);
    assert!(store.all_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn revoke_deletes_record_even_if_backend_fails() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let peer = Peer::new(server.id, "laptop", "key-laptop");
    store.save_peer(&peer).await.unwrap();
    let factory = Arc::new(MockFactory::default().with(&server, MockSpec { fail_remove: true, ..Default::default() }));

    let outcome = provisioner(&store, &factory).revoke_peer(&server, &peer).await.unwrap();

    assert!(outcome.backend_error.unwrap().contains("refused"));
    assert!(store.peer(peer.id).await.is_err());
}

#[tokio::test]
async fn limit_zero_suspends_and_lifting_restores() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let peer = Peer::new(server.id, "laptop", "key-laptop");
    store.save_peer(&peer).await.unwrap();
    let factory = Arc::new(MockFactory::default());
    let prov = provisioner(&store, &factory);

    let suspended = prov.set_limit(&server, &peer, Some(0)).await.unwrap();
    assert_eq!(suspended.status, PeerStatus::Suspended);
    assert_eq!(suspended.data_limit_bytes, Some(0));

    let lifted = prov.set_limit(&server, &suspended, Some(-1)).await.unwrap();
    assert_eq!(lifted.status, PeerStatus::Active);
    assert!(lifted.is_unlimited);
    assert_eq!(
        factory.calls(),
        vec!["limit key-laptop suspended", "limit key-laptop unlimited", "restore key-laptop"]
    );
}

#[tokio::test]
async fn disable_is_best_effort_and_enable_restores() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let peer = Peer::new(server.id, "laptop", "key-laptop");
    store.save_peer(&peer).await.unwrap();
    let factory = Arc::new(MockFactory::default());
    let prov = provisioner(&store, &factory);

    let disabled = prov.disable(&server, &peer).await.unwrap();
    assert_eq!(disabled.status, PeerStatus::Disabled);
    assert!(!disabled.enabled);

    let enabled = prov.enable(&server, &disabled).await.unwrap();
    assert_eq!(enabled.status, PeerStatus::Active);
    assert!(enabled.enabled);
    assert_eq!(factory.calls(), vec!["limit key-laptop suspended", "restore key-laptop"]);

    // enable only applies to disabled peers
    assert!(matches!(
        prov.enable(&server, &enabled).await,
        Err(ProvisionError::Transition(_))
    ));
}

#[tokio::test]
async fn expired_peer_cannot_be_resumed() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let mut peer = Peer::new(server.id, "laptop", "key-laptop");
    peer.transition(PeerStatus::Expired).unwrap();
    store.save_peer(&peer).await.unwrap();
    let factory = Arc::new(MockFactory::default());

    let err = provisioner(&store, &factory).resume(&server, &peer).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Transition(_)));
    assert!(factory.calls().is_empty());
}

#[tokio::test]
async fn peer_on_other_server_is_rejected() {
    let server = local_server("edge");
    let other = local_server("other");
    let store = seeded_store(&[&server, &other]).await;
    let peer = Peer::new(other.id, "laptop", "key-laptop");
    let factory = Arc::new(MockFactory::default());

    let err = provisioner(&store, &factory).suspend(&server, &peer).await.unwrap_err();
    assert!(matches!(err, ProvisionError::WrongServer { .. }));
}

#[tokio::test]
async fn artifact_comes_with_qr_code() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let peer = Peer::new(server.id, "laptop", "key-laptop");
    let factory = Arc::new(MockFactory::default());

    let bundle = provisioner(&store, &factory).fetch_access_artifact(&server, &peer).await.unwrap();
    assert_eq!(bundle.artifact.payload(), "ss://key-laptop");
    assert!(bundle.qr_data_url.starts_with("data:image/svg+xml;base64,"));
}

#[tokio::test]
async fn initialize_stores_server_public_key() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let factory = Arc::new(MockFactory::default());

    let updated = provisioner(&store, &factory).initialize_server(&server).await.unwrap();
    let key = updated.wireguard.as_ref().and_then(|wg| wg.public_key.clone());
    assert_eq!(key.as_deref(), Some("c2VydmVyLXB1YmxpYy1rZXk="));
    assert_eq!(store.server(server.id).await.unwrap(), updated);
}

#[tokio::test]
async fn rename_updates_backend_and_record() {
    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let peer = Peer::new(server.id, "laptop", "key-laptop");
    store.save_peer(&peer).await.unwrap();
    let factory = Arc::new(MockFactory::default());

    let renamed = provisioner(&store, &factory).rename(&server, &peer, "work laptop").await.unwrap();
    assert_eq!(renamed.name, "work laptop");
    assert_eq!(store.peer(peer.id).await.unwrap().name, "work laptop");
    assert_eq!(factory.calls(), vec!["rename key-laptop work laptop"]);
}

#[tokio::test]
async fn state_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let server = local_server("edge");
    let store = seeded_store(&[&server]).await;
    let factory = Arc::new(MockFactory::default());
    let peer = provisioner(&store, &factory)
        .provision_peer(&server, ProvisionRequest { name: "laptop".into(), ..Default::default() })
        .await
        .unwrap();
    store.persist(&path).await.unwrap();

    let reloaded = MemoryStore::load(&path).await.unwrap();
    assert_eq!(reloaded.peer(peer.id).await.unwrap(), peer);
    assert_eq!(reloaded.server(server.id).await.unwrap(), server);
}
