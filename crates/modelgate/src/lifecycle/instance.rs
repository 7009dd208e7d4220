use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::manager::LifecycleManager;
use crate::catalog::CatalogEntry;
use crate::error::GatewayError;
use crate::model_runtime::ModelRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Resolving,
    Downloading,
    Loading,
    Ready,
    Busy,
    Unloading,
    Failed,
}

impl InstanceState {
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            InstanceState::Resolving | InstanceState::Downloading | InstanceState::Loading
        )
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, InstanceState::Ready | InstanceState::Busy)
    }
}

/// What a caller waiting on a load gets to see.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    pub state: InstanceState,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub message: Option<String>,
    #[serde(skip)]
    pub error: Option<GatewayError>,
}

impl LoadProgress {
    pub(crate) fn new(state: InstanceState) -> Self {
        Self {
            state,
            downloaded_bytes: 0,
            total_bytes: None,
            message: None,
            error: None,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnsureOptions {
    /// Let the idle reaper stop the instance once unused for a while
    pub auto_unload: bool,
    /// Never evict; only an explicit unload removes it
    pub pinned: bool,
    pub preferred_gpu: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub identifier: String,
    pub resolved_id: Option<String>,
    pub state: InstanceState,
    pub pinned: bool,
    pub auto_unload: bool,
    pub ref_count: usize,
    pub footprint_bytes: Option<u64>,
    pub devices: Vec<usize>,
    pub endpoint: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
    pub pending_unload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadOutcome {
    Unloaded,
    /// Runs when the last in-flight request finishes
    Queued,
}

/// One counted reference to a serving instance. The count drops exactly once,
/// on [`release`](Self::release) or drop, whichever comes first.
pub struct InstanceLease {
    manager: Arc<LifecycleManager>,
    key: String,
    seq: u64,
    runtime: Arc<dyn ModelRuntime>,
    entry: Arc<CatalogEntry>,
    released: AtomicBool,
}

impl InstanceLease {
    pub(crate) fn new(
        manager: Arc<LifecycleManager>,
        key: String,
        seq: u64,
        runtime: Arc<dyn ModelRuntime>,
        entry: Arc<CatalogEntry>,
    ) -> Self {
        Self {
            manager,
            key,
            seq,
            runtime,
            entry,
            released: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.key
    }

    pub fn runtime(&self) -> &Arc<dyn ModelRuntime> {
        &self.runtime
    }

    pub fn entry(&self) -> &Arc<CatalogEntry> {
        &self.entry
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.manager.release_lease(&self.key, self.seq);
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("key", &self.key)
            .field("seq", &self.seq)
            .finish()
    }
}
