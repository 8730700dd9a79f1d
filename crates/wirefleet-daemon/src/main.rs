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


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use wirefleet_types::{AccessArtifact, Peer, VpnServer};

use wirefleet_daemon::backend::DefaultFactory;
use wirefleet_daemon::config::{self, DEFAULT_CONFIG_PATH, FleetToml};
use wirefleet_daemon::provision::{ProvisionRequest, Provisioner};
use wirefleet_daemon::scheduler::Scheduler;
use wirefleet_daemon::store::{FleetStore, MemoryStore};

type BoxError = Box<dyn std::error::Error>;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = "wirefleet")]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Provisioning and reconciliation for WireGuard and Outline server fleets")]
struct Args {
    /// Path to the configuration file [env: WIREFLEET_CONFIG]
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconciliation jobs until interrupted
    Run,
    /// Check a server and bootstrap its keys
    Init {
        #[arg(long)]
        server: String,
    },
    /// Create a peer on a server
    Provision {
        #[arg(long)]
        server: String,
        #[arg(long)]
        name: String,
        /// Device data cap in bytes; 0 suspends, negative means unlimited
        #[arg(long, allow_negative_numbers = true)]
        limit_bytes: Option<i64>,
        /// Plan data cap in bytes, used when no device cap is set
        #[arg(long)]
        plan_limit_bytes: Option<u64>,
        /// Expiry as an RFC 3339 timestamp
        #[arg(long)]
        expires: Option<DateTime<Utc>>,
    },
    /// Remove a peer from its server and delete the record
    Revoke {
        #[arg(long)]
        peer: Uuid,
    },
    /// Set or clear a peer's data cap
    Limit {
        #[arg(long)]
        peer: Uuid,
        /// Omit or pass a negative value to remove the cap
        #[arg(long, allow_negative_numbers = true)]
        bytes: Option<i64>,
    },
    Suspend {
        #[arg(long)]
        peer: Uuid,
    },
    Resume {
        #[arg(long)]
        peer: Uuid,
    },
    Disable {
        #[arg(long)]
        peer: Uuid,
    },
    Enable {
        #[arg(long)]
        peer: Uuid,
    },
    Rename {
        #[arg(long)]
        peer: Uuid,
        #[arg(long)]
        name: String,
    },
    /// Print the client config or access URL of a peer
    Artifact {
        #[arg(long)]
        peer: Uuid,
        /// Also print a QR code as a data URL
        #[arg(long)]
        qr: bool,
    },
    /// Print aggregate usage of a server
    Stats {
        #[arg(long)]
        server: String,
    },
}

fn config_path(args: &Args) -> PathBuf {
    args.config
        .clone()
        .or_else(|| std::env::var_os("WIREFLEET_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Upsert the configured inventory into the store, matching by name.
async fn sync_inventory(store: &MemoryStore, config: &FleetToml) -> Result<(), BoxError> {
    for entry in &config.servers {
        let existing = store.server_by_name(&entry.name).await.ok();
        store.upsert_server(entry.to_server(existing.as_ref())).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    let path = config_path(&args);

    let config = config::load(&path).await?;
    let store = Arc::new(MemoryStore::load(&config.state_path).await?);
    sync_inventory(&store, &config).await?;
    let factory = Arc::new(DefaultFactory::new(config.backend.settings()));

    match args.command {
        Command::Run => run(store, factory, &config).await,
        command => {
            let provisioner = Provisioner::new(Arc::clone(&store), Arc::clone(&factory));
            let result = admin(command, store.as_ref(), &provisioner).await;
            factory.drain().await;
            store.persist(&config.state_path).await?;
            result
        }
    }
}

async fn run(store: Arc<MemoryStore>, factory: Arc<DefaultFactory>, config: &FleetToml) -> Result<(), BoxError> {
    info!(
        version = env!("GIT_VERSION"),
        state = %config.state_path.display(),
        "starting wirefleet"
    );

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), Arc::clone(&factory), config.scheduler.settings()));
    let mut handles = scheduler.spawn(shutdown.clone());
    handles.push(tokio::spawn(persist_loop(
        Arc::clone(&store),
        config.state_path.clone(),
        config.scheduler.persist_interval(),
        shutdown.clone(),
    )));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "task ended abnormally");
        }
    }
    factory.drain().await;

    store.persist(&config.state_path).await?;
    info!("stopped");
    Ok(())
}

async fn persist_loop(store: Arc<MemoryStore>, path: PathBuf, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = store.persist(&path).await {
                    error!(path = %path.display(), error = %e, "failed to persist fleet state");
                }
            }
        }
    }
}

async fn peer_and_server(store: &MemoryStore, id: Uuid) -> Result<(Peer, VpnServer), BoxError> {
    let peer = store.peer(id).await?;
    let server = store.server(peer.server_id).await?;
    Ok((peer, server))
}

/// What `init` prints. Access credentials stay out of it.
fn init_summary(server: &VpnServer) -> serde_json::Value {
    serde_json::json!({
        "id": server.id,
        "name": server.name,
        "public_key": server.wireguard.as_ref().and_then(|wg| wg.public_key.as_deref()),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn admin(
    command: Command,
    store: &MemoryStore,
    provisioner: &Provisioner<MemoryStore, DefaultFactory>,
) -> Result<(), BoxError> {
    match command {
        Command::Run => return Err("run is not an admin command".into()),
        Command::Init { server } => {
            let server = store.server_by_name(&server).await?;
            let server = provisioner.initialize_server(&server).await?;
            print_json(&init_summary(&server))?;
        }
        Command::Provision { server, name, limit_bytes, plan_limit_bytes, expires } => {
            let server = store.server_by_name(&server).await?;
            let peer = provisioner
                .provision_peer(
                    &server,
                    ProvisionRequest {
                        name,
                        limit_bytes,
                        plan_limit_bytes,
                        expires_at: expires,
                    },
                )
                .await?;
            print_json(&peer)?;
        }
        Command::Revoke { peer } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            let outcome = provisioner.revoke_peer(&server, &peer).await?;
            if let Some(e) = outcome.backend_error {
                warn!(error = %e, "peer deleted locally but backend removal failed");
            }
            println!("revoked {}", peer.id);
        }
        Command::Limit { peer, bytes } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            print_json(&provisioner.set_limit(&server, &peer, bytes).await?)?;
        }
        Command::Suspend { peer } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            print_json(&provisioner.suspend(&server, &peer).await?)?;
        }
        Command::Resume { peer } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            print_json(&provisioner.resume(&server, &peer).await?)?;
        }
        Command::Disable { peer } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            print_json(&provisioner.disable(&server, &peer).await?)?;
        }
        Command::Enable { peer } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            print_json(&provisioner.enable(&server, &peer).await?)?;
        }
        Command::Rename { peer, name } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            print_json(&provisioner.rename(&server, &peer, &name).await?)?;
        }
        Command::Artifact { peer, qr } => {
            let (peer, server) = peer_and_server(store, peer).await?;
            let bundle = provisioner.fetch_access_artifact(&server, &peer).await?;
            match &bundle.artifact {
                AccessArtifact::WireGuardConfig { text } => print!("{text}"),
                AccessArtifact::OutlineUrl { url } => println!("{url}"),
            }
            if qr {
                println!("{}", bundle.qr_data_url);
            }
        }
        Command::Stats { server } => {
            let server = store.server_by_name(&server).await?;
            print_json(&provisioner.server_stats(&server).await?)?;
        }
    }
    Ok(())
}
