// crates/modelgate/src/config.rs

use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::ResolverConfig;
use crate::dispatcher::DispatcherConfig;
use crate::download::DownloadConfig;
use crate::lifecycle::{BusyUnloadPolicy, FootprintEstimator, LifecycleConfig};
use crate::model_runtime::LlamaSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub download_max_retries: u32,
    pub download_stall_timeout_seconds: u64,
    pub verify_checksums: bool,
    pub hf_token: Option<String>,
    pub registry_url: String,
    pub resolve_cache_ttl_seconds: u64,
    pub max_identifier_length: usize,
    pub default_quantization: String,
    pub llama_bin: Option<PathBuf>,
    pub llama_host: String,
    pub llama_base_port: u16,
    pub ctx_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub health_timeout_seconds: u64,
    pub gpu_memory_mb: Option<String>,
    pub footprint_factor: f64,
    pub footprint_overhead_mb: u64,
    pub busy_unload_policy: BusyUnloadPolicy,
    pub idle_unload_seconds: u64,
    pub request_timeout_seconds: u64,
    pub status_interval_seconds: u64,
    pub activity_stats_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let threads = match get("THREADS").as_deref() {
            None | Some("auto") => Self::auto_detect_threads(),
            Some(raw) => raw.parse().context("invalid value for THREADS")?,
        };

        let llama_bin = match get("LLAMA_BIN") {
            Some(path) => Some(PathBuf::from(path)),
            None => which::which("llama-server").ok(),
        };

        let ctx_size: u32 = parsed(&get, "CTX_SIZE", "4096")?;
        let batch_size = Self::apply_batch_limits(parsed(&get, "BATCH_SIZE", "512")?, ctx_size);

        let busy_unload_policy = BusyUnloadPolicy::from_str(
            &get("BUSY_UNLOAD_POLICY").unwrap_or_else(|| "reject".into()),
        )
        .map_err(|e| anyhow!(e))
        .context("invalid value for BUSY_UNLOAD_POLICY")?;

        Ok(Self {
            api_host: get("API_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            api_port: parsed(&get, "API_PORT", "8080")?,
            download_dir: PathBuf::from(get("DOWNLOAD_DIR").unwrap_or_else(|| "./models".into())),
            max_concurrent_downloads: parsed::<usize>(&get, "MAX_CONCURRENT_DOWNLOADS", "2")?.max(1),
            download_max_retries: parsed(&get, "DOWNLOAD_MAX_RETRIES", "5")?,
            download_stall_timeout_seconds: parsed(&get, "DOWNLOAD_STALL_TIMEOUT_SECONDS", "60")?,
            verify_checksums: parsed(&get, "VERIFY_CHECKSUMS", "true")?,
            hf_token: get("HF_TOKEN"),
            registry_url: get("REGISTRY_URL").unwrap_or_else(|| "https://huggingface.co".into()),
            resolve_cache_ttl_seconds: parsed(&get, "RESOLVE_CACHE_TTL_SECONDS", "300")?,
            max_identifier_length: parsed(&get, "MAX_IDENTIFIER_LENGTH", "256")?,
            default_quantization: get("DEFAULT_QUANTIZATION").unwrap_or_else(|| "q4_k_m".into()),
            llama_bin,
            llama_host: get("LLAMA_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            llama_base_port: parsed(&get, "LLAMA_BASE_PORT", "8200")?,
            ctx_size,
            batch_size,
            threads,
            gpu_layers: parsed(&get, "GPU_LAYERS", "999")?,
            health_timeout_seconds: parsed(&get, "HEALTH_TIMEOUT_SECONDS", "120")?,
            gpu_memory_mb: get("GPU_MEMORY_MB"),
            footprint_factor: parsed(&get, "FOOTPRINT_FACTOR", "1.2")?,
            footprint_overhead_mb: parsed(&get, "FOOTPRINT_OVERHEAD_MB", "512")?,
            busy_unload_policy,
            idle_unload_seconds: parsed(&get, "IDLE_UNLOAD_SECONDS", "0")?,
            request_timeout_seconds: parsed(&get, "REQUEST_TIMEOUT_SECONDS", "600")?,
            status_interval_seconds: parsed::<u64>(&get, "STATUS_INTERVAL_SECONDS", "2")?.max(1),
            activity_stats_file: get("ACTIVITY_STATS_FILE").map(PathBuf::from),
        })
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto‑detected CPU cores: {}", num_cpus);

        match num_cpus {
            1..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    fn apply_batch_limits(batch_size: u32, ctx_size: u32) -> u32 {
        let limited = batch_size.clamp(16, 1024);
        match ctx_size {
            0..=2048 => limited.min(512),
            2049..=4096 => limited.min(384),
            4097..=8192 => limited.min(256),
            8193..=16384 => limited.min(128),
            16385..=32768 => limited.min(64),
            _ => limited.min(32),
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Download Dir: {}", self.download_dir.display());
        info!("- Registry: {}", self.registry_url);
        info!("- Max Concurrent Downloads: {}", self.max_concurrent_downloads);
        info!("- Default Quantization: {}", self.default_quantization);
        match &self.llama_bin {
            Some(bin) => info!("- Llama Binary: {}", bin.display()),
            None => warn!("- Llama Binary: not found"),
        }
        info!("- Engine Ports: {}:{}+", self.llama_host, self.llama_base_port);
        info!("- Context Size: {}", self.ctx_size);
        info!("- Batch Size: {}", self.batch_size);
        info!("- Threads: {}", self.threads);
        info!("- GPU Layers: {}", self.gpu_layers);
        info!(
            "- Footprint: x{} + {} MB",
            self.footprint_factor, self.footprint_overhead_mb
        );
        info!("- Busy Unload Policy: {:?}", self.busy_unload_policy);
        if self.idle_unload_seconds > 0 {
            info!("- Idle Unload: {}s", self.idle_unload_seconds);
        }
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.api_host, self.api_port))
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            download_dir: self.download_dir.clone(),
            cache_ttl: Duration::from_secs(self.resolve_cache_ttl_seconds),
            default_quantization: self.default_quantization.clone(),
            max_identifier_len: self.max_identifier_length,
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_concurrent: self.max_concurrent_downloads,
            max_retries: self.download_max_retries,
            stall_timeout: Duration::from_secs(self.download_stall_timeout_seconds),
            verify_checksums: self.verify_checksums,
            token: self.hf_token.clone(),
            ..DownloadConfig::default()
        }
    }

    pub fn llama_settings(&self) -> Result<LlamaSettings> {
        let binary = self.llama_bin.clone().context(
            "LLAMA_BIN is not set and llama-server is not on PATH. Please set it in your .env file",
        )?;
        if !binary.exists() {
            return Err(anyhow!(
                "Llama binary not found at: {}. Please check LLAMA_BIN in .env file.",
                binary.display()
            ));
        }
        Ok(LlamaSettings {
            binary,
            host: self.llama_host.clone(),
            base_port: self.llama_base_port,
            ctx_size: self.ctx_size,
            batch_size: self.batch_size,
            threads: self.threads,
            gpu_layers: self.gpu_layers,
            health_timeout: Duration::from_secs(self.health_timeout_seconds),
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
        })
    }

    pub fn lifecycle_config(&self, cpu_only: bool) -> LifecycleConfig {
        LifecycleConfig {
            busy_unload_policy: self.busy_unload_policy,
            idle_unload: (self.idle_unload_seconds > 0)
                .then(|| Duration::from_secs(self.idle_unload_seconds)),
            cpu_only,
        }
    }

    pub fn footprint_estimator(&self) -> FootprintEstimator {
        FootprintEstimator::new(self.footprint_factor, self.footprint_overhead_mb)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            status_interval: Duration::from_secs(self.status_interval_seconds),
            ..DispatcherConfig::default()
        }
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .unwrap_or_else(|| default.to_string())
        .parse()
        .with_context(|| format!("invalid value for {}", key))
}
