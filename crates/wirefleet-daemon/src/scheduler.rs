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

//! Periodic reconciliation of the fleet against its backends.
//!
//! Four jobs run on independent intervals. Each job visits every active
//! server in its own task, so one slow or failing server only costs its own
//! slot. A tick that arrives while the previous run of the same job is
//! still going is skipped.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wirefleet_types::{DataLimit, PeerStats, PeerStatus, VpnServer};

use crate::backend::{BackendError, BackendFactory, VpnBackend};
use crate::store::{FleetStore, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub health_interval: Duration,
    pub usage_interval: Duration,
    pub expiration_interval: Duration,
    pub limit_interval: Duration,
    /// Bound on each backend call made for a single server.
    pub server_timeout: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(300),
            usage_interval: Duration::from_secs(300),
            expiration_interval: Duration::from_secs(86_400),
            limit_interval: Duration::from_secs(600),
            server_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    HealthCheck,
    UsageSync,
    ExpirationSweep,
    LimitEnforcement,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::HealthCheck,
        Job::UsageSync,
        Job::ExpirationSweep,
        Job::LimitEnforcement,
    ];
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Job::HealthCheck => "health_check",
            Job::UsageSync => "usage_sync",
            Job::ExpirationSweep => "expiration_sweep",
            Job::LimitEnforcement => "limit_enforcement",
        })
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

/// Tally of one job run across all servers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub servers_ok: usize,
    pub servers_failed: usize,
    /// Records written (servers or peers, depending on the job).
    pub updated: usize,
}

pub struct Scheduler<S, F> {
    store: Arc<S>,
    factory: Arc<F>,
    settings: ScheduleSettings,
}

impl<S, F> Scheduler<S, F>
where
    S: FleetStore + 'static,
    F: BackendFactory + 'static,
{
    pub fn new(store: Arc<S>, factory: Arc<F>, settings: ScheduleSettings) -> Self {
        Self { store, factory, settings }
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    pub async fn run_job(&self, job: Job) -> RunReport {
        match job {
            Job::HealthCheck => self.run_health_check().await,
            Job::UsageSync => self.run_usage_sync().await,
            Job::ExpirationSweep => self.run_expiration_sweep(Utc::now()).await,
            Job::LimitEnforcement => self.run_limit_enforcement().await,
        }
    }

    /// Probe every active server and record the result with a timestamp.
    /// Connection failures and timeouts are recorded as unhealthy.
    #[tracing::instrument(skip_all)]
    pub async fn run_health_check(&self) -> RunReport {
        let timeout = self.settings.server_timeout;
        self.fan_out(Job::HealthCheck, |store, factory, server| async move {
            let healthy = health_of(factory.as_ref(), &server, timeout).await;
            store.record_health(server.id, healthy, Utc::now()).await?;
            Ok(1)
        })
        .await
    }

    /// Fold backend counters into each enabled peer's cumulative usage and
    /// refresh handshake and connectivity.
    #[tracing::instrument(skip_all)]
    pub async fn run_usage_sync(&self) -> RunReport {
        let timeout = self.settings.server_timeout;
        self.fan_out(Job::UsageSync, |store, factory, server| async move {
            let peers: Vec<_> = store
                .peers_for_server(server.id)
                .await?
                .into_iter()
                .filter(|p| p.enabled)
                .collect();
            if peers.is_empty() {
                return Ok(0);
            }

            let backend = factory.connect(&server)?;
            let stats = bounded(timeout, backend.all_peer_stats()).await?;
            let by_id: HashMap<&str, &PeerStats> =
                stats.iter().map(|s| (s.backend_id.as_str(), s)).collect();

            let now = Utc::now();
            let mut updated = 0;
            for mut peer in peers {
                let Some(observed) = by_id.get(peer.backend_id.as_str()) else {
                    debug!(server = %server.name, peer = %peer.id, "peer not reported by backend");
                    continue;
                };
                peer.usage.absorb(&mut peer.last_counters, observed.usage, observed.counters);
                peer.last_handshake = observed.last_handshake;
                peer.connected = observed.connected;
                peer.updated_at = now;
                match store.save_peer(&peer).await {
                    Ok(()) => updated += 1,
                    Err(e) => error!(server = %server.name, peer = %peer.id, error = %e, "failed to save usage"),
                }
            }
            Ok(updated)
        })
        .await
    }

    /// Mark every peer past its expiry as expired and disabled. No backend
    /// calls are made.
    #[tracing::instrument(skip_all)]
    pub async fn run_expiration_sweep(&self, now: DateTime<Utc>) -> RunReport {
        self.fan_out(Job::ExpirationSweep, move |store, _factory, server| async move {
            let mut expired = 0;
            for mut peer in store.peers_for_server(server.id).await? {
                if peer.status == PeerStatus::Expired || !peer.is_expired_at(now) {
                    continue;
                }
                if let Err(e) = peer.transition(PeerStatus::Expired) {
                    warn!(server = %server.name, peer = %peer.id, error = %e, "cannot expire peer");
                    continue;
                }
                match store.save_peer(&peer).await {
                    Ok(()) => {
                        info!(server = %server.name, peer = %peer.id, "peer expired");
                        expired += 1;
                    }
                    Err(e) => error!(server = %server.name, peer = %peer.id, error = %e, "failed to save expired peer"),
                }
            }
            Ok(expired)
        })
        .await
    }

    /// Suspend active peers whose cumulative usage has reached their
    /// effective limit. The local record is suspended even if the backend
    /// call fails; the failure is kept in `last_error`.
    #[tracing::instrument(skip_all)]
    pub async fn run_limit_enforcement(&self) -> RunReport {
        let timeout = self.settings.server_timeout;
        self.fan_out(Job::LimitEnforcement, |store, factory, server| async move {
            let over: Vec<_> = store
                .peers_for_server(server.id)
                .await?
                .into_iter()
                .filter(|p| p.status == PeerStatus::Active && p.enabled && p.limit_reached())
                .collect();
            if over.is_empty() {
                return Ok(0);
            }

            let backend = factory.connect(&server)?;
            let mut suspended = 0;
            for mut peer in over {
                let cut = bounded(timeout, backend.set_data_limit(&peer.backend_id, DataLimit::Suspended)).await;
                peer.last_error = match cut {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(server = %server.name, peer = %peer.id, error = %e, "backend cut-off failed");
                        Some(e.to_string())
                    }
                };
                if let Err(e) = peer.transition(PeerStatus::Suspended) {
                    warn!(server = %server.name, peer = %peer.id, error = %e, "cannot suspend peer");
                    continue;
                }
                match store.save_peer(&peer).await {
                    Ok(()) => {
                        info!(
                            server = %server.name,
                            peer = %peer.id,
                            used = peer.usage.total(),
                            limit = ?peer.effective_limit(),
                            "peer suspended at data limit"
                        );
                        suspended += 1;
                    }
                    Err(e) => error!(server = %server.name, peer = %peer.id, error = %e, "failed to save suspended peer"),
                }
            }
            Ok(suspended)
        })
        .await
    }

    /// Run `work` for every active server, each in its own task. A failure,
    /// timeout, or panic is logged and counted against that server only.
    async fn fan_out<W, Fut>(&self, job: Job, work: W) -> RunReport
    where
        W: Fn(Arc<S>, Arc<F>, VpnServer) -> Fut,
        Fut: Future<Output = Result<usize, JobError>> + Send + 'static,
    {
        let servers = match self.store.active_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                error!(%job, error = %e, "failed to list servers");
                return RunReport::default();
            }
        };
        debug!(%job, server_count = servers.len(), "starting job run");

        // backend calls carry their own bound; this one also covers store writes
        let deadline = self.settings.server_timeout * 2;
        let (names, handles): (Vec<_>, Vec<_>) = servers
            .into_iter()
            .map(|server| {
                let name = server.name.clone();
                let fut = work(Arc::clone(&self.store), Arc::clone(&self.factory), server);
                (name, tokio::spawn(tokio::time::timeout(deadline, fut)))
            })
            .unzip();

        let mut report = RunReport::default();
        for (name, outcome) in names.iter().zip(futures::future::join_all(handles).await) {
            match outcome {
                Ok(Ok(Ok(updated))) => {
                    report.servers_ok += 1;
                    report.updated += updated;
                }
                Ok(Ok(Err(e))) => {
                    report.servers_failed += 1;
                    error!(%job, server = %name, error = %e, "server failed, will retry next run");
                }
                Ok(Err(_)) => {
                    report.servers_failed += 1;
                    error!(%job, server = %name, timeout = ?deadline, "server timed out");
                }
                Err(e) => {
                    report.servers_failed += 1;
                    error!(%job, server = %name, error = %e, "server task panicked");
                }
            }
        }

        info!(
            %job,
            ok = report.servers_ok,
            failed = report.servers_failed,
            updated = report.updated,
            "job run complete"
        );
        report
    }

    /// Start one task per job. Each stops when `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        Job::ALL
            .into_iter()
            .map(|job| {
                let period = match job {
                    Job::HealthCheck => self.settings.health_interval,
                    Job::UsageSync => self.settings.usage_interval,
                    Job::ExpirationSweep => self.settings.expiration_interval,
                    Job::LimitEnforcement => self.settings.limit_interval,
                };
                tokio::spawn(Arc::clone(&self).job_loop(job, period, shutdown.clone()))
            })
            .collect()
    }

    async fn job_loop(self: Arc<Self>, job: Job, period: Duration, shutdown: CancellationToken) {
        let running = Arc::new(AtomicBool::new(false));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(%job, period = ?period, "job scheduled");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(%job, "job stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if running.swap(true, Ordering::AcqRel) {
                        warn!(%job, "previous run still in progress, skipping tick");
                        continue;
                    }
                    let guard = RunningGuard(Arc::clone(&running));
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _guard = guard;
                        this.run_job(job).await;
                    });
                }
            }
        }
    }
}

/// Clears the in-progress flag when a run ends, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, JobError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(JobError::Timeout(timeout)),
    }
}

async fn health_of<F: BackendFactory>(factory: &F, server: &VpnServer, timeout: Duration) -> bool {
    let backend = match factory.connect(server) {
        Ok(backend) => backend,
        Err(e) => {
            warn!(server = %server.name, error = %e, kind = %e.kind(), "cannot reach server");
            return false;
        }
    };
    match bounded(timeout, backend.check_health()).await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!(server = %server.name, error = %e, "health check failed");
            false
        }
    }
}
