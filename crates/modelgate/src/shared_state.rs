//! State shared by every HTTP handler. Cloning is cheap: every field is an
//! `Arc` or a handle.

use std::sync::Arc;
use std::time::Instant;

use crate::catalog::Resolver;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::download::DownloadManager;
use crate::gpu::{DeviceInventory, GpuTracker};
use crate::lifecycle::LifecycleManager;
use crate::stats::StatsCollector;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lifecycle: Arc<LifecycleManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: StatsCollector,
    /// What device detection found at startup
    pub inventory: Arc<DeviceInventory>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        lifecycle: Arc<LifecycleManager>,
        stats: StatsCollector,
        inventory: DeviceInventory,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            lifecycle.clone(),
            stats.clone(),
            config.dispatcher_config(),
        ));
        Self {
            config,
            lifecycle,
            dispatcher,
            stats,
            inventory: Arc::new(inventory),
            started_at: Instant::now(),
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        self.lifecycle.resolver()
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        self.lifecycle.downloads()
    }

    pub fn gpus(&self) -> &Arc<GpuTracker> {
        self.lifecycle.gpus()
    }
}
