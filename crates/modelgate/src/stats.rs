// crates/modelgate/src/stats.rs
// Per-model activity accounting. Writers send events over a channel and never
// wait; readers get the last published snapshot through an ArcSwap.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub const GLOBAL_KEY: &str = "_global_";
const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    RequestStarted,
    RequestCompleted {
        duration: Duration,
        prompt_tokens: u64,
        completion_tokens: u64,
        success: bool,
    },
    Evicted,
    LoadFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelActivity {
    pub requests_started: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_duration_ms: u64,
    pub evictions: u64,
    pub load_failures: u64,
    pub first_used: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl ModelActivity {
    fn apply(&mut self, event: &ActivityEvent, at: DateTime<Utc>) {
        match event {
            ActivityEvent::RequestStarted => {
                self.requests_started += 1;
                self.first_used.get_or_insert(at);
                self.last_used = Some(at);
            }
            ActivityEvent::RequestCompleted {
                duration,
                prompt_tokens,
                completion_tokens,
                success,
            } => {
                if *success {
                    self.requests_completed += 1;
                } else {
                    self.requests_failed += 1;
                }
                self.prompt_tokens += prompt_tokens;
                self.completion_tokens += completion_tokens;
                self.total_tokens += prompt_tokens + completion_tokens;
                self.total_duration_ms += duration.as_millis() as u64;
                self.last_used = Some(at);
            }
            ActivityEvent::Evicted => self.evictions += 1,
            ActivityEvent::LoadFailed => self.load_failures += 1,
        }
    }

    pub fn average_duration_ms(&self) -> Option<u64> {
        let finished = self.requests_completed + self.requests_failed;
        (finished > 0).then(|| self.total_duration_ms / finished)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivitySnapshot {
    pub stats: BTreeMap<String, ModelActivity>,
    pub global_stats: ModelActivity,
}

impl ActivitySnapshot {
    fn record(&mut self, identifier: &str, event: &ActivityEvent) {
        let now = Utc::now();
        self.stats
            .entry(identifier.to_string())
            .or_default()
            .apply(event, now);
        self.global_stats.apply(event, now);
    }

    /// Drop one model's counters, or everything with `None`.
    fn reset(&mut self, identifier: Option<&str>) {
        match identifier {
            None => *self = ActivitySnapshot::default(),
            Some(GLOBAL_KEY) => self.global_stats = ModelActivity::default(),
            Some(id) => {
                self.stats.remove(id);
            }
        }
    }

    pub fn get(&self, identifier: &str) -> Option<&ModelActivity> {
        if identifier == GLOBAL_KEY {
            Some(&self.global_stats)
        } else {
            self.stats.get(identifier)
        }
    }
}

enum Command {
    Record(String, ActivityEvent),
    Reset(Option<String>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct StatsCollector {
    tx: mpsc::UnboundedSender<Command>,
    published: Arc<ArcSwap<ActivitySnapshot>>,
}

impl StatsCollector {
    /// Spawn the collector task. With a `path`, earlier stats are loaded from
    /// it and changes are written back periodically.
    pub fn start(path: Option<PathBuf>) -> Self {
        let initial = path.as_deref().map(load_snapshot).unwrap_or_default();
        let published = Arc::new(ArcSwap::new(Arc::new(initial.clone())));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_collector(rx, initial, published.clone(), path));
        Self { tx, published }
    }

    /// Fire and forget.
    pub fn record(&self, identifier: &str, event: ActivityEvent) {
        if self
            .tx
            .send(Command::Record(identifier.to_string(), event))
            .is_err()
        {
            debug!("Stats collector stopped, dropping event for {}", identifier);
        }
    }

    pub fn snapshot(&self) -> Arc<ActivitySnapshot> {
        self.published.load_full()
    }

    pub fn reset(&self, identifier: Option<&str>) {
        let _ = self.tx.send(Command::Reset(identifier.map(str::to_string)));
    }

    /// Wait until every event sent before this call is visible in
    /// [`snapshot`](Self::snapshot) and persisted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_collector(
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut current: ActivitySnapshot,
    published: Arc<ArcSwap<ActivitySnapshot>>,
    path: Option<PathBuf>,
) {
    let mut dirty = false;
    let mut persist = tokio::time::interval(PERSIST_INTERVAL);
    persist.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    Command::Record(identifier, event) => {
                        current.record(&identifier, &event);
                        dirty = true;
                    }
                    Command::Reset(identifier) => {
                        info!("Resetting activity stats for {}", identifier.as_deref().unwrap_or("all models"));
                        current.reset(identifier.as_deref());
                        dirty = true;
                    }
                    Command::Flush(done) => {
                        published.store(Arc::new(current.clone()));
                        if dirty {
                            persist_snapshot(path.as_ref(), &current).await;
                            dirty = false;
                        }
                        let _ = done.send(());
                        continue;
                    }
                }
                published.store(Arc::new(current.clone()));
            }
            _ = persist.tick() => {
                if dirty {
                    persist_snapshot(path.as_ref(), &current).await;
                    dirty = false;
                }
            }
        }
    }

    if dirty {
        persist_snapshot(path.as_ref(), &current).await;
    }
    debug!("Stats collector stopped");
}

fn load_snapshot(path: &std::path::Path) -> ActivitySnapshot {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(snapshot) => {
                info!("Loaded activity stats from {}", path.display());
                snapshot
            }
            Err(e) => {
                warn!("Ignoring unreadable stats file {}: {}", path.display(), e);
                ActivitySnapshot::default()
            }
        },
        Err(_) => ActivitySnapshot::default(),
    }
}

async fn persist_snapshot(path: Option<&PathBuf>, snapshot: &ActivitySnapshot) {
    let Some(path) = path else {
        return;
    };
    let json = match serde_json::to_vec_pretty(snapshot) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode activity stats: {}", e);
            return;
        }
    };
    let tmp = path.with_extension("json.tmp");
    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if let Err(e) = result {
        error!("Failed to save activity stats to {}: {}", path.display(), e);
    }
}
