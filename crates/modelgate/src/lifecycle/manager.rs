//! Lifecycle Manager
//!
//! Owns the instance table and every state transition in it. Loads are
//! single-flight per identifier: the first caller creates the record and
//! spawns the load, later callers attach to its progress channel. The table
//! lock is never held across network or process I/O.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::footprint::FootprintEstimator;
use super::instance::{
    EnsureOptions, InstanceLease, InstanceState, InstanceSummary, LoadProgress, UnloadOutcome,
};
use super::lru::LruIndex;
use crate::catalog::{CatalogEntry, ModelIdentifier, Resolver};
use crate::download::{format_bytes, DownloadManager, DownloadProgress, DownloadStatus};
use crate::error::{GatewayError, Result};
use crate::gpu::{Allocation, GpuTracker};
use crate::metrics;
use crate::model_runtime::{LaunchSpec, ModelRuntime, RuntimeLauncher};
use crate::stats::{ActivityEvent, StatsCollector};

/// What an unload does while requests are still in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyUnloadPolicy {
    #[default]
    Reject,
    Queue,
}

impl FromStr for BusyUnloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(BusyUnloadPolicy::Reject),
            "queue" => Ok(BusyUnloadPolicy::Queue),
            other => Err(format!("unknown busy unload policy {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleConfig {
    pub busy_unload_policy: BusyUnloadPolicy,
    /// Idle time after which `auto_unload` instances are stopped
    pub idle_unload: Option<Duration>,
    /// Serving from system memory; engines get no GPU layers
    pub cpu_only: bool,
}

struct InstanceRecord {
    seq: u64,
    state: InstanceState,
    pinned: bool,
    auto_unload: bool,
    entry: Option<Arc<CatalogEntry>>,
    allocation: Option<Allocation>,
    footprint: Option<u64>,
    runtime: Option<Arc<dyn ModelRuntime>>,
    refs: usize,
    waiters: usize,
    progress: watch::Sender<LoadProgress>,
    cancel: CancellationToken,
    last_access: Instant,
    last_used: DateTime<Utc>,
    loaded_at: Option<DateTime<Utc>>,
    pending_unload: bool,
}

impl InstanceRecord {
    fn set_state(&mut self, state: InstanceState, message: Option<String>) {
        self.state = state;
        self.progress.send_modify(|p| {
            p.state = state;
            p.message = message;
        });
    }

    /// Callers still attached to the load count as interest: they take
    /// their lease right after the Ready signal reaches them.
    fn is_evictable(&self) -> bool {
        self.state == InstanceState::Ready && self.refs == 0 && self.waiters == 0 && !self.pinned
    }

    fn summary(&self, key: &str) -> InstanceSummary {
        InstanceSummary {
            identifier: key.to_string(),
            resolved_id: self.entry.as_ref().map(|e| e.resolved_id.clone()),
            state: self.state,
            pinned: self.pinned,
            auto_unload: self.auto_unload,
            ref_count: self.refs,
            footprint_bytes: self.footprint,
            devices: self
                .allocation
                .as_ref()
                .map(|a| a.device_indices())
                .unwrap_or_default(),
            endpoint: self.runtime.as_ref().map(|r| r.base_url()),
            loaded_at: self.loaded_at,
            last_used: self.last_used,
            pending_unload: self.pending_unload,
        }
    }
}

/// Runtime and memory taken out of a record that is going away
struct Teardown {
    key: String,
    seq: u64,
    runtime: Option<Arc<dyn ModelRuntime>>,
    allocation: Option<Allocation>,
}

#[derive(Default)]
pub(crate) struct InstanceTable {
    records: HashMap<String, InstanceRecord>,
    lru: LruIndex,
}

impl InstanceTable {
    fn get_mut(&mut self, key: &str, seq: u64) -> Option<&mut InstanceRecord> {
        self.records.get_mut(key).filter(|r| r.seq == seq)
    }

    /// Least recently used evictable instance. With a preferred device only
    /// instances holding memory there are worth evicting.
    fn eviction_candidate(&self, preferred: Option<usize>) -> Option<String> {
        let records = &self.records;
        self.lru
            .oldest_matching(|key| {
                records
                    .get(key)
                    .map(|r| {
                        r.is_evictable()
                            && preferred
                                .map(|d| {
                                    r.allocation
                                        .as_ref()
                                        .map(|a| a.device_indices().contains(&d))
                                        .unwrap_or(false)
                                })
                                .unwrap_or(true)
                    })
                    .unwrap_or(false)
            })
            .map(str::to_string)
    }

    fn begin_unload(&mut self, key: &str) -> Option<Teardown> {
        let record = self.records.get_mut(key)?;
        record.set_state(InstanceState::Unloading, Some("unloading".into()));
        record.pending_unload = false;
        let teardown = Teardown {
            key: key.to_string(),
            seq: record.seq,
            runtime: record.runtime.take(),
            allocation: record.allocation.take(),
        };
        self.lru.remove(key);
        Some(teardown)
    }
}

/// One step of making room for a new instance
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AdmissionStep {
    Admitted(Allocation),
    Evict(String),
    Exhausted { needed: u64, available: u64 },
}

/// Try to reserve `footprint`; when memory is short, name the instance to
/// evict next or report that nothing is left to evict.
pub(crate) fn admission_step(
    gpus: &GpuTracker,
    table: &InstanceTable,
    footprint: u64,
    preferred: Option<usize>,
    shardable: bool,
) -> Result<AdmissionStep> {
    match gpus.reserve(footprint, preferred, shardable) {
        Ok(allocation) => Ok(AdmissionStep::Admitted(allocation)),
        Err(GatewayError::InsufficientMemory { needed, available }) => {
            Ok(match table.eviction_candidate(preferred) {
                Some(victim) => AdmissionStep::Evict(victim),
                None => AdmissionStep::Exhausted { needed, available },
            })
        }
        Err(e) => Err(e),
    }
}

struct Loaded {
    entry: Arc<CatalogEntry>,
    runtime: Arc<dyn ModelRuntime>,
    allocation: Allocation,
    footprint: u64,
}

enum Acquire {
    Lease(InstanceLease),
    Wait(Waiter),
}

/// A caller's interest in a load that has not finished yet.
struct Waiter {
    /// `None` when only observing a record that is going away
    manager: Option<Arc<LifecycleManager>>,
    key: String,
    seq: u64,
    rx: watch::Receiver<LoadProgress>,
}

impl Waiter {
    /// Ok once the instance serves or its record disappeared; the caller
    /// looks at the table again either way.
    async fn wait(&mut self) -> Result<()> {
        loop {
            {
                let progress = self.rx.borrow_and_update();
                if progress.state.is_serving() {
                    return Ok(());
                }
                if progress.state == InstanceState::Failed {
                    return Err(progress.error.clone().unwrap_or_else(|| {
                        GatewayError::Internal(format!("load of {} failed", self.key))
                    }));
                }
            }
            if self.rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(manager) = &self.manager {
            manager.detach_waiter(&self.key, self.seq);
        }
    }
}

pub struct LifecycleManager {
    resolver: Arc<Resolver>,
    downloads: Arc<DownloadManager>,
    gpus: Arc<GpuTracker>,
    launcher: Arc<dyn RuntimeLauncher>,
    stats: StatsCollector,
    estimator: FootprintEstimator,
    config: LifecycleConfig,
    table: Mutex<InstanceTable>,
    next_seq: AtomicU64,
    shutting_down: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        resolver: Arc<Resolver>,
        downloads: Arc<DownloadManager>,
        gpus: Arc<GpuTracker>,
        launcher: Arc<dyn RuntimeLauncher>,
        stats: StatsCollector,
        estimator: FootprintEstimator,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            resolver,
            downloads,
            gpus,
            launcher,
            stats,
            estimator,
            config,
            table: Mutex::new(InstanceTable::default()),
            next_seq: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.downloads
    }

    pub fn gpus(&self) -> &Arc<GpuTracker> {
        &self.gpus
    }

    fn lock(&self) -> MutexGuard<'_, InstanceTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return a counted reference to a serving instance of `raw`, loading it
    /// first when needed.
    pub async fn ensure_ready(self: &Arc<Self>, raw: &str, opts: EnsureOptions) -> Result<InstanceLease> {
        let identifier = self.resolver.parse(raw)?;
        let key = identifier.to_string();
        let mut acquired = self.try_acquire(&key, &identifier, &opts)?;
        loop {
            let mut waiter = match acquired {
                Acquire::Lease(lease) => return Ok(lease),
                Acquire::Wait(waiter) => waiter,
            };
            waiter.wait().await?;
            // Take the lease before detaching so the fresh instance is never
            // unreferenced in between.
            acquired = self.try_acquire(&key, &identifier, &opts)?;
        }
    }

    fn try_acquire(
        self: &Arc<Self>,
        key: &str,
        identifier: &ModelIdentifier,
        opts: &EnsureOptions,
    ) -> Result<Acquire> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(GatewayError::Canceled("gateway is shutting down".into()));
        }

        let mut table = self.lock();
        let InstanceTable { records, lru } = &mut *table;

        if let Some(record) = records.get_mut(key) {
            if opts.pinned && !record.pinned {
                info!("Pinning {}", key);
                record.pinned = true;
            }
            if record.state.is_serving() {
                record.refs += 1;
                record.last_access = Instant::now();
                record.last_used = Utc::now();
                if record.state == InstanceState::Ready {
                    record.set_state(InstanceState::Busy, None);
                }
                lru.touch(key, record.seq, record.last_access);
                let (runtime, entry) = match (&record.runtime, &record.entry) {
                    (Some(runtime), Some(entry)) => (runtime.clone(), entry.clone()),
                    _ => {
                        record.refs -= 1;
                        return Err(GatewayError::Internal(format!(
                            "{} is serving without an engine",
                            key
                        )));
                    }
                };
                debug!("Lease on {} ({} in flight)", key, record.refs);
                return Ok(Acquire::Lease(InstanceLease::new(
                    self.clone(),
                    key.to_string(),
                    record.seq,
                    runtime,
                    entry,
                )));
            }
            if record.state.is_loading() {
                record.waiters += 1;
                return Ok(Acquire::Wait(Waiter {
                    manager: Some(self.clone()),
                    key: key.to_string(),
                    seq: record.seq,
                    rx: record.progress.subscribe(),
                }));
            }
            // Unloading or failed: wait for the record to go away.
            return Ok(Acquire::Wait(Waiter {
                manager: None,
                key: key.to_string(),
                seq: record.seq,
                rx: record.progress.subscribe(),
            }));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut initial = LoadProgress::new(InstanceState::Resolving);
        initial.message = Some(format!("resolving {}", key));
        let (progress, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        records.insert(
            key.to_string(),
            InstanceRecord {
                seq,
                state: InstanceState::Resolving,
                pinned: opts.pinned,
                auto_unload: opts.auto_unload,
                entry: None,
                allocation: None,
                footprint: None,
                runtime: None,
                refs: 0,
                waiters: 1,
                progress,
                cancel: cancel.clone(),
                last_access: Instant::now(),
                last_used: Utc::now(),
                loaded_at: None,
                pending_unload: false,
            },
        );
        drop(table);

        info!("Loading {} (pinned: {}, auto_unload: {})", key, opts.pinned, opts.auto_unload);
        let manager = self.clone();
        let load_key = key.to_string();
        let load_identifier = identifier.clone();
        let load_opts = opts.clone();
        tokio::spawn(async move {
            manager
                .run_load(load_key, load_identifier, load_opts, seq, cancel)
                .await
        });

        Ok(Acquire::Wait(Waiter {
            manager: Some(self.clone()),
            key: key.to_string(),
            seq,
            rx,
        }))
    }

    fn detach_waiter(&self, key: &str, seq: u64) {
        let mut table = self.lock();
        let Some(record) = table.get_mut(key, seq) else {
            return;
        };
        record.waiters = record.waiters.saturating_sub(1);
        let abandoned = record.waiters == 0
            && matches!(
                record.state,
                InstanceState::Resolving | InstanceState::Downloading
            );
        if abandoned {
            info!("No callers left waiting for {}, canceling load", key);
            record.cancel.cancel();
            table.records.remove(key);
        }
    }

    async fn run_load(
        self: Arc<Self>,
        key: String,
        identifier: ModelIdentifier,
        opts: EnsureOptions,
        seq: u64,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        match self.load(&key, &identifier, &opts, seq, &cancel).await {
            Ok(loaded) => self.finish_load(&key, seq, loaded, started).await,
            Err(e) => self.fail_load(&key, seq, e),
        }
    }

    async fn load(
        &self,
        key: &str,
        identifier: &ModelIdentifier,
        opts: &EnsureOptions,
        seq: u64,
        cancel: &CancellationToken,
    ) -> Result<Loaded> {
        let canceled = || GatewayError::Canceled(format!("load of {} canceled", key));

        let entry = tokio::select! {
            entry = self.resolver.resolve_identifier(identifier) => entry?,
            _ = cancel.cancelled() => return Err(canceled()),
        };
        self.update(key, seq, |record| {
            record.entry = Some(entry.clone());
            record.set_state(
                InstanceState::Downloading,
                Some(format!("fetching {}", entry.file)),
            );
        })?;

        // Every shard is queued up front; the engine opens the first one and
        // finds the rest next to it.
        let mut tickets = Vec::with_capacity(1 + entry.companions.len());
        for file in std::iter::once(entry.as_ref()).chain(&entry.companions) {
            tickets.push(self.downloads.ensure_local(file).await?);
        }
        let mut paths = Vec::with_capacity(tickets.len());
        for ticket in tickets.iter_mut() {
            let path = tokio::select! {
                path = ticket.wait_with_progress(|p| self.report_download(key, seq, p)) => path?,
                _ = cancel.cancelled() => return Err(canceled()),
            };
            paths.push(path);
        }
        drop(tickets);

        self.update(key, seq, |record| {
            record.set_state(InstanceState::Loading, Some("starting engine".into()))
        })?;

        let mut file_size = 0;
        for (path, file) in paths.iter().zip(std::iter::once(entry.as_ref()).chain(&entry.companions)) {
            file_size += match tokio::fs::metadata(path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => file.size_bytes.unwrap_or(0),
            };
        }
        let footprint = self.estimator.estimate(file_size);
        debug!("Estimated footprint of {}: {}", key, format_bytes(footprint));

        let allocation = self.admit(footprint, opts.preferred_gpu).await?;
        if let Err(e) = self.update(key, seq, |record| record.footprint = Some(footprint)) {
            self.gpus.release(&allocation);
            return Err(e);
        }

        let spec = LaunchSpec {
            identifier: key.to_string(),
            model_path: paths.swap_remove(0),
            allocation: allocation.clone(),
            cpu_only: self.config.cpu_only,
        };
        match self.launcher.launch(spec).await {
            Ok(runtime) => Ok(Loaded {
                entry,
                runtime,
                allocation,
                footprint,
            }),
            Err(e) => {
                self.gpus.release(&allocation);
                Err(e)
            }
        }
    }

    /// Reserve memory, evicting in LRU order until the footprint fits.
    async fn admit(&self, footprint: u64, preferred: Option<usize>) -> Result<Allocation> {
        let shardable = self.launcher.supports_sharding() && !self.config.cpu_only;
        loop {
            let teardown = {
                let mut table = self.lock();
                match admission_step(&self.gpus, &table, footprint, preferred, shardable)? {
                    AdmissionStep::Admitted(allocation) => return Ok(allocation),
                    AdmissionStep::Exhausted { needed, available } => {
                        return Err(GatewayError::ResourceExhausted(format!(
                            "need {} but only {} is free and nothing can be evicted",
                            format_bytes(needed),
                            format_bytes(available)
                        )))
                    }
                    AdmissionStep::Evict(victim) => table.begin_unload(&victim),
                }
            };
            if let Some(teardown) = teardown {
                info!(
                    "Evicting {} to make room for {}",
                    teardown.key,
                    format_bytes(footprint)
                );
                self.stats.record(&teardown.key, ActivityEvent::Evicted);
                metrics::inc_eviction();
                self.teardown(teardown).await;
            }
        }
    }

    async fn finish_load(&self, key: &str, seq: u64, loaded: Loaded, started: Instant) {
        let Loaded {
            entry,
            runtime,
            allocation,
            footprint,
        } = loaded;

        let orphaned = {
            let mut table = self.lock();
            let InstanceTable { records, lru } = &mut *table;
            match records.get_mut(key).filter(|r| r.seq == seq) {
                Some(record) => {
                    record.runtime = Some(runtime);
                    record.allocation = Some(allocation);
                    record.footprint = Some(footprint);
                    record.loaded_at = Some(Utc::now());
                    record.last_access = Instant::now();
                    record.set_state(InstanceState::Ready, None);
                    lru.touch(key, seq, record.last_access);
                    None
                }
                None => Some(Teardown {
                    key: key.to_string(),
                    seq,
                    runtime: Some(runtime),
                    allocation: Some(allocation),
                }),
            }
        };

        if let Some(teardown) = orphaned {
            warn!("{} was removed while starting, stopping its engine", key);
            metrics::inc_load("canceled");
            self.teardown(teardown).await;
            return;
        }

        if let Some(quantization) = &entry.quantization {
            self.resolver.remember_quantization(&entry.repo, quantization);
        }
        let elapsed = started.elapsed();
        metrics::inc_load("success");
        metrics::observe_load_duration(elapsed.as_secs_f64());
        metrics::set_resident_instances(self.resident_count());
        info!(
            "{} ready in {:.1}s ({})",
            key,
            elapsed.as_secs_f64(),
            format_bytes(footprint)
        );
    }

    fn fail_load(&self, key: &str, seq: u64, error: GatewayError) {
        {
            let mut table = self.lock();
            if let Some(record) = table.get_mut(key, seq) {
                record.state = InstanceState::Failed;
                let message = error.to_string();
                let failure = error.clone();
                record.progress.send_modify(|p| {
                    p.state = InstanceState::Failed;
                    p.message = Some(message);
                    p.error = Some(failure);
                });
                table.records.remove(key);
            }
        }

        if matches!(error, GatewayError::Canceled(_)) {
            info!("Load of {} canceled", key);
            metrics::inc_load("canceled");
        } else {
            error!("Failed to load {}: {}", key, error);
            self.stats.record(key, ActivityEvent::LoadFailed);
            metrics::inc_load("failed");
        }
    }

    fn update(&self, key: &str, seq: u64, f: impl FnOnce(&mut InstanceRecord)) -> Result<()> {
        let mut table = self.lock();
        match table.get_mut(key, seq) {
            Some(record) => {
                f(record);
                Ok(())
            }
            None => Err(GatewayError::Canceled(format!("load of {} canceled", key))),
        }
    }

    fn report_download(&self, key: &str, seq: u64, download: &DownloadProgress) {
        let message = match download.status {
            DownloadStatus::Queued => "waiting for a download slot".to_string(),
            DownloadStatus::Paused => "download paused".to_string(),
            DownloadStatus::Verifying => "verifying download".to_string(),
            _ => match download.percent() {
                Some(pct) => format!("downloading {:.0}%", pct),
                None => format!("downloading {}", format_bytes(download.downloaded_bytes)),
            },
        };
        let mut table = self.lock();
        if let Some(record) = table.get_mut(key, seq) {
            record.progress.send_modify(|p| {
                p.downloaded_bytes = download.downloaded_bytes;
                p.total_bytes = download.total_bytes;
                p.message = Some(message);
            });
        }
    }

    async fn teardown(&self, teardown: Teardown) {
        if let Some(runtime) = &teardown.runtime {
            if let Err(e) = runtime.shutdown().await {
                warn!("Engine for {} did not stop cleanly: {}", teardown.key, e);
            }
        }
        if let Some(allocation) = &teardown.allocation {
            self.gpus.release(allocation);
        }
        {
            let mut table = self.lock();
            if table
                .records
                .get(&teardown.key)
                .map(|r| r.seq == teardown.seq)
                .unwrap_or(false)
            {
                table.records.remove(&teardown.key);
            }
        }
        metrics::set_resident_instances(self.resident_count());
        info!("Unloaded {}", teardown.key);
    }

    /// Drop one reference taken by [`ensure_ready`](Self::ensure_ready).
    /// Runs a queued unload when the count reaches zero.
    pub(crate) fn release_lease(self: &Arc<Self>, key: &str, seq: u64) {
        let teardown = {
            let mut table = self.lock();
            let InstanceTable { records, lru } = &mut *table;
            let Some(record) = records.get_mut(key).filter(|r| r.seq == seq) else {
                return;
            };
            record.refs = record.refs.saturating_sub(1);
            record.last_access = Instant::now();
            record.last_used = Utc::now();
            if record.refs > 0 {
                return;
            }
            if record.state == InstanceState::Busy {
                record.set_state(InstanceState::Ready, None);
            }
            if record.state == InstanceState::Ready {
                lru.touch(key, seq, record.last_access);
            }
            if record.pending_unload {
                table.begin_unload(key)
            } else {
                None
            }
        };

        if let Some(teardown) = teardown {
            info!("Running queued unload of {}", key);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let manager = self.clone();
                    handle.spawn(async move { manager.teardown(teardown).await });
                }
                Err(_) => warn!("No runtime to unload {} on", key),
            }
        }
    }

    /// Stop a serving instance. Without `force`, in-flight requests make the
    /// call fail or queue the unload, depending on the configured policy.
    pub async fn unload(self: &Arc<Self>, raw: &str, force: bool) -> Result<UnloadOutcome> {
        let key = self.resolver.parse(raw)?.to_string();
        let teardown = {
            let mut table = self.lock();
            let record = table
                .records
                .get_mut(&key)
                .ok_or_else(|| GatewayError::NotFound(format!("{} is not loaded", key)))?;
            match record.state {
                s if s.is_loading() => {
                    return Err(GatewayError::InstanceBusy(format!("{} is still loading", key)))
                }
                InstanceState::Unloading => {
                    return Err(GatewayError::InstanceBusy(format!(
                        "{} is already unloading",
                        key
                    )))
                }
                InstanceState::Failed => {
                    return Err(GatewayError::NotFound(format!("{} is not loaded", key)))
                }
                _ => {}
            }
            if record.refs > 0 && !force {
                match self.config.busy_unload_policy {
                    BusyUnloadPolicy::Reject => {
                        return Err(GatewayError::InstanceBusy(format!(
                            "{} has {} request(s) in flight",
                            key, record.refs
                        )))
                    }
                    BusyUnloadPolicy::Queue => {
                        record.pending_unload = true;
                        info!("Unload of {} queued behind {} request(s)", key, record.refs);
                        return Ok(UnloadOutcome::Queued);
                    }
                }
            }
            table.begin_unload(&key)
        };

        if let Some(teardown) = teardown {
            self.teardown(teardown).await;
        }
        Ok(UnloadOutcome::Unloaded)
    }

    /// Stop `auto_unload` instances that sat unused past the idle window.
    pub async fn reap_idle(&self) -> usize {
        let Some(idle) = self.config.idle_unload else {
            return 0;
        };
        let teardowns: Vec<Teardown> = {
            let mut table = self.lock();
            let idle_keys: Vec<String> = table
                .records
                .iter()
                .filter(|(_, r)| r.auto_unload && r.is_evictable() && r.last_access.elapsed() >= idle)
                .map(|(key, _)| key.clone())
                .collect();
            idle_keys
                .iter()
                .filter_map(|key| table.begin_unload(key))
                .collect()
        };
        let count = teardowns.len();
        for teardown in teardowns {
            info!("Unloading idle instance {}", teardown.key);
            self.teardown(teardown).await;
        }
        count
    }

    /// Stop every engine and release all memory. New loads are refused.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let teardowns: Vec<Teardown> = {
            let mut table = self.lock();
            table.lru = LruIndex::default();
            std::mem::take(&mut table.records)
                .into_iter()
                .map(|(key, mut record)| {
                    record.cancel.cancel();
                    Teardown {
                        key,
                        seq: record.seq,
                        runtime: record.runtime.take(),
                        allocation: record.allocation.take(),
                    }
                })
                .collect()
        };
        info!("Stopping {} instance(s)", teardowns.len());
        for teardown in teardowns {
            self.teardown(teardown).await;
        }
    }

    pub fn list(&self) -> Vec<InstanceSummary> {
        let table = self.lock();
        let mut all: Vec<InstanceSummary> = table
            .records
            .iter()
            .map(|(key, record)| record.summary(key))
            .collect();
        all.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        all
    }

    /// Load phase of `raw`, if a record exists for it
    pub fn progress(&self, raw: &str) -> Option<LoadProgress> {
        let key = self.resolver.parse(raw).ok()?.to_string();
        let table = self.lock();
        table.records.get(&key).map(|r| r.progress.borrow().clone())
    }

    pub fn resident_count(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.state.is_serving())
            .count()
    }
}
