//! Test doubles shared by unit tests across modules.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::catalog::{
    repo_dir, CatalogEntry, ModelSummary, Registry, RemoteFile, RepoListing, Resolver,
    ResolverConfig, SearchQuery,
};
use crate::config::Config;
use crate::download::{DownloadConfig, DownloadManager};
use crate::error::{GatewayError, Result};
use crate::gpu::{DeviceInventory, GpuDevice, GpuTracker};
use crate::lifecycle::{FootprintEstimator, LifecycleConfig, LifecycleManager};
use crate::model_runtime::{
    ChatCompletionRequest, LaunchSpec, ModelRuntime, RuntimeLauncher, RuntimeMetadata, TokenStream,
};
use crate::shared_state::AppState;
use crate::stats::StatsCollector;

pub fn catalog_entry(base_url: &str, dir: &Path, repo: &str, file: &str, size: u64) -> CatalogEntry {
    CatalogEntry {
        resolved_id: format!("{}:{}", repo, file).to_ascii_lowercase(),
        repo: repo.to_string(),
        file: file.to_string(),
        quantization: None,
        size_bytes: Some(size),
        sha256: None,
        source_url: format!("{}/{}/resolve/main/{}", base_url, repo, file),
        destination: repo_dir(dir, repo).join(file),
        local_path: None,
        resolved_at: Utc::now(),
        companions: Vec::new(),
    }
}

/// In-memory registry
pub struct FakeRegistry {
    base_url: String,
    repos: Mutex<HashMap<String, RepoListing>>,
    list_calls: AtomicUsize,
    unavailable: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeRegistry {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            repos: Mutex::new(HashMap::new()),
            list_calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn add_repo(&self, repo: &str, files: &[(&str, u64)]) {
        let listing = RepoListing {
            repo: repo.to_string(),
            gated: false,
            files: files
                .iter()
                .map(|(path, size)| RemoteFile {
                    path: path.to_string(),
                    size: Some(*size),
                    sha256: None,
                })
                .collect(),
        };
        self.repos
            .lock()
            .unwrap()
            .insert(repo.to_ascii_lowercase(), listing);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Slow down every listing call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn list_files(&self, repo: &str) -> Result<RepoListing> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Upstream("registry unavailable".into()));
        }
        self.repos
            .lock()
            .unwrap()
            .get(&repo.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(repo.to_string()))
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ModelSummary>> {
        let text = query.text.to_ascii_lowercase();
        let repos = self.repos.lock().unwrap();
        let mut found: Vec<ModelSummary> = repos
            .iter()
            .filter(|(key, _)| key.contains(&text))
            .flat_map(|(_, listing)| {
                listing.gguf_files().map(move |f| ModelSummary {
                    id: format!("{}:{}", listing.repo, f.path),
                    name: f.path.clone(),
                    repo: listing.repo.clone(),
                    file: f.path.clone(),
                    quantization: None,
                    size_bytes: f.size,
                    size_gb: None,
                    requires_auth: false,
                    downloads: 0,
                    likes: 0,
                    tags: Vec::new(),
                })
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found.truncate(query.limit);
        Ok(found)
    }

    fn download_url(&self, repo: &str, path: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, repo, path)
    }
}

/// Engine that answers from memory
pub struct FakeRuntime {
    identifier: String,
    chunks: Vec<String>,
    chunk_delay: Duration,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            runtime_name: "fake".into(),
            base_url: format!("fake://{}", self.identifier),
            process_id: None,
            port: None,
            supports_streaming: true,
        }
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn generate(&self, request: &ChatCompletionRequest) -> Result<Value> {
        Ok(json!({
            "object": "chat.completion",
            "model": request.model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        }))
    }

    async fn generate_stream(&self, _request: &ChatCompletionRequest) -> Result<TokenStream> {
        let chunks = self.chunks.clone();
        let delay = self.chunk_delay;
        Ok(Box::pin(async_stream::stream! {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher that counts starts and can be told to fail or stall
pub struct FakeLauncher {
    starts: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    fail_next: Mutex<Option<GatewayError>>,
    delay: Mutex<Duration>,
    chunks: Mutex<Vec<String>>,
    chunk_delay: Mutex<Duration>,
    launched: Mutex<Vec<LaunchSpec>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            starts: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            fail_next: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            chunks: Mutex::new(vec![
                r#"{"choices":[{"delta":{"content":"he"}}]}"#.to_string(),
                r#"{"choices":[{"delta":{"content":"llo"}}],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#.to_string(),
            ]),
            chunk_delay: Mutex::new(Duration::ZERO),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, error: GatewayError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_stream(&self, chunks: Vec<String>, chunk_delay: Duration) {
        *self.chunks.lock().unwrap() = chunks;
        *self.chunk_delay.lock().unwrap() = chunk_delay;
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeLauncher for FakeLauncher {
    fn supports_sharding(&self) -> bool {
        true
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ModelRuntime>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            return Err(error);
        }
        self.launched.lock().unwrap().push(spec.clone());
        Ok(Arc::new(FakeRuntime {
            identifier: spec.identifier,
            chunks: self.chunks.lock().unwrap().clone(),
            chunk_delay: *self.chunk_delay.lock().unwrap(),
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

/// A lifecycle manager wired to fakes, a mock download server and a temp dir.
/// Footprints equal file sizes, so device sizes are given in bytes.
pub struct Harness {
    pub manager: Arc<LifecycleManager>,
    pub registry: Arc<FakeRegistry>,
    pub launcher: Arc<FakeLauncher>,
    pub stats: StatsCollector,
    pub server: mockito::ServerGuard,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new(device_bytes: &[u64], config: LifecycleConfig) -> Self {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new(&server.url()));
        let resolver = Arc::new(Resolver::new(
            registry.clone(),
            ResolverConfig {
                download_dir: dir.path().to_path_buf(),
                cache_ttl: Duration::from_secs(60),
                default_quantization: "q4_k_m".into(),
                max_identifier_len: 256,
            },
        ));
        let downloads = Arc::new(
            DownloadManager::new(DownloadConfig {
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(20),
                ..DownloadConfig::default()
            })
            .unwrap(),
        );
        let gpus = Arc::new(GpuTracker::new(
            device_bytes
                .iter()
                .enumerate()
                .map(|(i, bytes)| GpuDevice::new(i, format!("gpu{}", i), *bytes))
                .collect(),
        ));
        let launcher = Arc::new(FakeLauncher::new());
        let stats = StatsCollector::start(None);
        let manager = Arc::new(LifecycleManager::new(
            resolver,
            downloads,
            gpus,
            launcher.clone(),
            stats.clone(),
            FootprintEstimator {
                factor: 1.0,
                overhead_bytes: 0,
            },
            config,
        ));
        Self {
            manager,
            registry,
            launcher,
            stats,
            server,
            dir,
        }
    }

    /// Register `repo` with one file of `size` bytes and serve it. The
    /// returned mock expects exactly one download.
    pub async fn add_model(&mut self, repo: &str, file: &str, size: usize) -> mockito::Mock {
        self.registry.add_repo(repo, &[(file, size as u64)]);
        self.serve(repo, file, size).await
    }

    /// Register `repo` with several files, serving each exactly once.
    pub async fn add_files(&mut self, repo: &str, files: &[(&str, usize)]) -> Vec<mockito::Mock> {
        let listing: Vec<(&str, u64)> = files.iter().map(|(file, size)| (*file, *size as u64)).collect();
        self.registry.add_repo(repo, &listing);
        let mut mocks = Vec::with_capacity(files.len());
        for (file, size) in files {
            mocks.push(self.serve(repo, file, *size).await);
        }
        mocks
    }

    async fn serve(&mut self, repo: &str, file: &str, size: usize) -> mockito::Mock {
        self.server
            .mock("GET", format!("/{}/resolve/main/{}", repo, file).as_str())
            .with_status(200)
            .with_body(vec![1u8; size])
            .expect(1)
            .create_async()
            .await
    }

    /// HTTP state over this harness, for router tests.
    pub fn app_state(&self) -> AppState {
        let download_dir = self.dir.path().to_string_lossy().to_string();
        let config = Config::from_lookup(move |key| match key {
            "DOWNLOAD_DIR" => Some(download_dir.clone()),
            "REQUEST_TIMEOUT_SECONDS" => Some("10".into()),
            _ => None,
        })
        .unwrap();
        let inventory = DeviceInventory {
            backend: "override".into(),
            driver_version: None,
            devices: self.manager.gpus().inventory(),
        };
        AppState::new(
            Arc::new(config),
            self.manager.clone(),
            self.stats.clone(),
            inventory,
        )
    }
}
