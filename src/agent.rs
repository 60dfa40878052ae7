//! Agent lifecycle: wires the stores and workers together and runs the
//! periodic loops until shutdown.

use crate::app::ports::HttpClientPort;
use crate::buffer::DurableBuffer;
use crate::config::AgentConfig;
use crate::control::{apply_config, config_poll::config_changed_event, ConfigPoller, HeartbeatSender};
use crate::discovery::policy::DiscoveryPolicy;
use crate::discovery::NetworkProber;
use crate::domain::{DriverMatch, Fingerprint, MachineEntry, RecordContext};
use crate::drivers::hub::{HubClient, HubEntry};
use crate::drivers::sync::SyncDirs;
use crate::drivers::{resolve_profile, select_driver, DriverCatalog, DriverSync, SyncOutcome};
use crate::error::{GatewayError, Result};
use crate::fingerprint::Fingerprinter;
use crate::infra::http_client::ReqwestHttp;
use crate::metrics::{DiscoveryMetrics, DriverMetrics};
use crate::registry::MachineRegistry;
use crate::runtime::{poll_targets, Poller, WorkerPool};
use crate::server::{self, StatusState};
use crate::uplink::{HttpCollector, UplinkWorker};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What one discovery pass found and did.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub candidates: usize,
    pub matches: Vec<(Fingerprint, Option<DriverMatch>)>,
    pub sync: Vec<(String, SyncOutcome)>,
    pub enrolled: Vec<String>,
}

pub struct Agent {
    config: AgentConfig,
    ctx: RecordContext,
    buffer: Arc<DurableBuffer>,
    http: Arc<dyn HttpClientPort>,
    registry: Mutex<MachineRegistry>,
    policy: Mutex<DiscoveryPolicy>,
    catalog: RwLock<DriverCatalog>,
    prober: NetworkProber,
    fingerprinter: Fingerprinter,
    sync: Option<DriverSync>,
    started: Instant,
}

impl Agent {
    /// Open the buffer and registry and build every collaborator from
    /// `config`. Nothing touches the network yet.
    pub fn open(config: AgentConfig) -> Result<Self> {
        fs::create_dir_all(&config.paths.data_dir)?;
        let ctx = RecordContext {
            tenant_id: config.gateway.tenant_id.clone(),
            site_id: config.gateway.site_id.clone(),
            device_id: config.gateway.device_id.clone(),
        };
        let buffer = Arc::new(DurableBuffer::open(config.buffer_path())?);
        let registry = MachineRegistry::load(config.registry_path());

        let http: Arc<dyn HttpClientPort> = Arc::new(
            ReqwestHttp::new(
                Duration::from_secs(config.uplink.timeout_secs.max(1)),
                config.gateway.bearer_token.clone(),
            )
            .map_err(GatewayError::Config)?,
        );

        let fingerprinter = Fingerprinter::with_default_probes(config.discovery.probe_timeout())
            .map_err(|e| GatewayError::Config(format!("fingerprinter: {}", e)))?;

        let sync = match &config.drivers.hub_manifest_url {
            Some(url) => {
                let hub_http: Arc<dyn HttpClientPort> = Arc::new(
                    ReqwestHttp::new(
                        Duration::from_secs(config.drivers.download_timeout_secs.max(1)),
                        config.gateway.bearer_token.clone(),
                    )
                    .map_err(GatewayError::Config)?,
                );
                let dirs = SyncDirs {
                    active_dir: config.drivers_active_dir(),
                    cache_dir: config.drivers_cache_dir(),
                    backup_dir: config.drivers_backup_dir(),
                };
                Some(DriverSync::new(
                    HubClient::new(hub_http, url.clone()),
                    dirs,
                    config.drivers.public_key_path.clone(),
                    config.drivers.channel.clone(),
                    buffer.clone(),
                    ctx.clone(),
                )?)
            }
            None => {
                info!("Agent: no driver hub configured, built-in drivers only");
                None
            }
        };

        let policy = config.discovery.policy.clone();
        policy.log_decision();

        Ok(Self {
            prober: NetworkProber::new(config.discovery.clone()),
            fingerprinter,
            ctx,
            buffer,
            http,
            registry: Mutex::new(registry),
            policy: Mutex::new(policy),
            catalog: RwLock::new(DriverCatalog::builtin()),
            sync,
            started: Instant::now(),
            config,
        })
    }

    pub fn buffer(&self) -> &Arc<DurableBuffer> {
        &self.buffer
    }

    /// Merge the hub manifest into the catalog and hand the entries back for
    /// driver sync. Hub outages keep the current catalog.
    pub async fn refresh_catalog(&self) -> Option<Vec<HubEntry>> {
        let url = self.config.drivers.hub_manifest_url.as_ref()?;
        match HubClient::new(self.http.clone(), url.clone()).fetch_manifest().await {
            Ok(entries) => {
                self.catalog.write().await.merge_hub_entries(&entries);
                Some(entries)
            }
            Err(e) => {
                warn!("Agent: hub manifest unavailable, keeping catalog: {}", e);
                DriverMetrics::record_sync_unavailable();
                None
            }
        }
    }

    /// Sync from fetched hub entries without holding the catalog lock across
    /// downloads.
    async fn sync_from(&self, sync: &DriverSync, entries: &[HubEntry], machines: &[MachineEntry]) -> Vec<(String, SyncOutcome)> {
        let checksums = self.catalog.read().await.checksums();
        sync.sync_required(entries, machines, &checksums).await
    }

    /// One discovery cycle: probe, fingerprint, select, record, then sync
    /// the drivers the registry needs and auto-enroll when configured.
    pub async fn discover_once(&self) -> Result<DiscoveryReport> {
        let started = Instant::now();
        let policy = self.policy.lock().await.clone();
        let candidates = self.prober.discover(&policy).await;
        let fingerprints = self.fingerprinter.fingerprint_all(&candidates).await;

        let hub_entries = self.refresh_catalog().await;
        let matches: Vec<(Fingerprint, Option<DriverMatch>)> = {
            let catalog = self.catalog.read().await;
            fingerprints
                .into_iter()
                .map(|fp| {
                    let selection = select_driver(&catalog, &fp);
                    (fp, selection)
                })
                .collect()
        };

        let machines = {
            let mut registry = self.registry.lock().await;
            for candidate in &candidates {
                registry.observe_candidate(candidate);
            }
            for (fp, selection) in &matches {
                let entry = registry.apply_fingerprint(fp, selection.as_ref());
                debug!(machine_id = %entry.machine_id, status = ?entry.status, "Agent: machine updated");
            }
            registry.save()?;
            registry.entries().to_vec()
        };
        DiscoveryMetrics::record_cycle(candidates.len(), matches.len(), started.elapsed().as_secs_f64());

        let sync = match (&self.sync, &hub_entries) {
            (Some(sync), Some(entries)) => self.sync_from(sync, entries, &machines).await,
            _ => Vec::new(),
        };

        let enrolled = if self.config.discovery.auto_enroll { self.auto_enroll().await? } else { Vec::new() };

        info!(
            candidates = candidates.len(),
            fingerprints = matches.len(),
            synced = sync.len(),
            enrolled = enrolled.len(),
            "Agent: discovery cycle complete"
        );
        Ok(DiscoveryReport { candidates: candidates.len(), matches, sync, enrolled })
    }

    async fn auto_enroll(&self) -> Result<Vec<String>> {
        let active_dir = self.config.drivers_active_dir();
        let catalog = self.catalog.read().await;
        let mut registry = self.registry.lock().await;
        let enrolled = registry.enroll_ready(|driver_id| resolve_profile(&active_dir, &catalog, driver_id).is_some());
        if !enrolled.is_empty() {
            info!(machines = ?enrolled, "Agent: auto-enrolled machines");
            registry.save()?;
        }
        Ok(enrolled)
    }

    /// Sync every driver the current registry needs.
    pub async fn sync_drivers(&self) -> Result<Vec<(String, SyncOutcome)>> {
        let Some(sync) = &self.sync else {
            return Err(GatewayError::Config("drivers.hub_manifest_url is not configured".to_string()));
        };
        let Some(entries) = self.refresh_catalog().await else {
            return Ok(Vec::new());
        };
        let machines = self.registry.lock().await.entries().to_vec();
        Ok(self.sync_from(sync, &entries, &machines).await)
    }

    /// Run every loop until Ctrl-C, then drain the tasks and close the
    /// buffer.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll = self.clone().poll_loop(shutdown_rx.clone())?;
        let mut tasks = JoinSet::new();

        tasks.spawn(self.clone().discovery_loop(shutdown_rx.clone()));
        tasks.spawn(poll);

        let collector = Arc::new(HttpCollector::new(self.http.clone(), self.config.uplink.ingest_url.clone()));
        let uplink = UplinkWorker::new(
            self.buffer.clone(),
            collector,
            self.config.uplink.batch_size,
            self.config.uplink.backoff_cap_secs,
        );
        tasks.spawn(uplink.run(Duration::from_secs(self.config.uplink.interval_secs.max(1)), shutdown_rx.clone()));

        if let Some(mgmt) = self.config.control.mgmt_base_url.clone() {
            tasks.spawn(self.clone().config_loop(mgmt.clone(), shutdown_rx.clone()));
            tasks.spawn(self.clone().heartbeat_loop(mgmt, shutdown_rx.clone()));
        } else {
            info!("Agent: no management service configured, config poll and heartbeat disabled");
        }

        if self.config.status.enabled {
            let state = Arc::new(StatusState {
                buffer: self.buffer.clone(),
                registry_path: self.config.registry_path(),
                device_id: self.ctx.device_id.clone(),
                started: self.started,
            });
            let bind = self.config.status.bind.clone();
            let mut rx = shutdown_rx.clone();
            tasks.spawn(async move {
                let stop = async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                };
                if let Err(e) = server::serve(&bind, state, stop).await {
                    error!("Agent: status endpoint stopped: {}", e);
                }
            });
        }

        info!(device_id = %self.ctx.device_id, "Agent: running");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Agent: cannot listen for shutdown signal: {}", e);
        }
        info!("Agent: shutting down");
        let _ = shutdown_tx.send(true);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Agent: task failed: {}", e);
            }
        }
        self.registry.lock().await.save()?;
        self.buffer.close()?;
        info!("Agent: stopped");
        Ok(())
    }

    async fn discovery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.discovery.interval_secs.max(1));
        loop {
            if let Err(e) = self.discover_once().instrument(info_span!("discovery")).await {
                error!("Agent: discovery cycle failed: {}", e);
            }
            if wait_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
    }

    fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<impl std::future::Future<Output = ()>> {
        let pool = WorkerPool::for_driver_worker(
            self.config.poller.worker_program.clone(),
            self.config.poller.max_concurrent_workers,
        )
        .map_err(|e| GatewayError::Config(format!("driver worker: {}", e)))?;
        let mut poller = Poller::new(
            Arc::new(pool),
            self.buffer.clone(),
            self.ctx.clone(),
            Duration::from_millis(self.config.poller.timeout_ms),
            self.config.poller.backoff_cap_secs,
            self.config.poller.circuit_breaker_threshold,
        );
        let interval = Duration::from_secs(self.config.poller.interval_secs.max(1));
        let active_dir = self.config.drivers_active_dir();

        Ok(async move {
            loop {
                let targets = {
                    let catalog = self.catalog.read().await;
                    let registry = self.registry.lock().await;
                    poll_targets(&registry, &catalog, &active_dir)
                };
                if !targets.is_empty() {
                    let report = poller.poll_cycle(&targets).instrument(info_span!("poll_cycle")).await;
                    debug!(?report, "Agent: poll cycle complete");
                }
                if wait_or_shutdown(interval, &mut shutdown).await {
                    break;
                }
            }
        })
    }

    async fn config_loop(self: Arc<Self>, mgmt: String, mut shutdown: watch::Receiver<bool>) {
        let mut poller = ConfigPoller::new(self.http.clone(), &mgmt, self.ctx.device_id.clone());
        let interval = Duration::from_secs(self.config.control.config_poll_interval_secs.max(1));
        loop {
            match poller.poll().await {
                Ok(Some((version, remote))) => {
                    let applied = {
                        let mut registry = self.registry.lock().await;
                        let mut policy = self.policy.lock().await;
                        let applied = apply_config(&remote, &mut registry, &mut policy);
                        if let Err(e) = registry.save() {
                            error!("Agent: registry save failed: {}", e);
                        }
                        applied
                    };
                    info!(version, ?applied, "Agent: remote config applied");
                    let event = config_changed_event(&self.ctx, version, &remote);
                    if let Err(e) = self.buffer.enqueue(&event.into()) {
                        error!("Agent: cannot buffer CONFIG_CHANGED event: {}", e);
                    }
                }
                Ok(None) => debug!(version = poller.version(), "Agent: config unchanged"),
                Err(e) => warn!("Agent: config poll failed: {}", e),
            }
            if wait_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mgmt: String, mut shutdown: watch::Receiver<bool>) {
        let sender = HeartbeatSender::new(self.http.clone(), &mgmt, &self.ctx.device_id);
        let interval = Duration::from_secs(self.config.control.heartbeat_interval_secs.max(1));
        loop {
            match self.buffer.stats() {
                Ok(stats) => {
                    if let Err(e) = sender.send(stats).await {
                        warn!("Agent: heartbeat failed: {}", e);
                    }
                }
                Err(e) => error!("Agent: buffer stats unavailable: {}", e),
            }
            if wait_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
    }
}

/// Sleep for `wait` unless shutdown arrives first. Returns true when the
/// caller should stop.
async fn wait_or_shutdown(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
