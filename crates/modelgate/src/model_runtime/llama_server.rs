//! llama.cpp runtime
//!
//! Spawns one `llama-server` process per instance, pins it to the devices of
//! its allocation and proxies OpenAI requests to it over HTTP.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::runtime_trait::*;
use crate::error::{GatewayError, Result};

const STDERR_TAIL_LINES: usize = 20;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PORT_RANGE: u16 = 1000;

#[derive(Debug, Clone)]
pub struct LlamaSettings {
    pub binary: PathBuf,
    pub host: String,
    pub base_port: u16,
    pub ctx_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
}

/// Hands out listening ports for engine processes, lowest free first.
pub struct PortPool {
    host: String,
    base: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(host: &str, base: u16) -> Self {
        Self {
            host: host.to_string(),
            base,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn acquire(&self) -> Result<u16> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let end = self.base.saturating_add(PORT_RANGE);
        for port in self.base..end {
            if in_use.contains(&port) {
                continue;
            }
            // Skip ports something else on the host already listens on.
            if std::net::TcpListener::bind((self.host.as_str(), port)).is_err() {
                continue;
            }
            in_use.insert(port);
            return Ok(port);
        }
        Err(GatewayError::ResourceExhausted(format!(
            "no free engine port in {}..{}",
            self.base, end
        )))
    }

    pub fn release(&self, port: u16) {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
    }
}

pub struct LlamaServerLauncher {
    settings: LlamaSettings,
    ports: Arc<PortPool>,
    client: reqwest::Client,
}

impl LlamaServerLauncher {
    pub fn new(settings: LlamaSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            ports: Arc::new(PortPool::new(&settings.host, settings.base_port)),
            settings,
            client,
        })
    }

    fn command(&self, spec: &LaunchSpec, port: u16) -> Command {
        let s = &self.settings;
        let gpu_layers = if spec.cpu_only { 0 } else { s.gpu_layers };

        let mut cmd = Command::new(&s.binary);
        cmd.arg("--model")
            .arg(&spec.model_path)
            .arg("--host")
            .arg(&s.host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--ctx-size")
            .arg(s.ctx_size.to_string())
            .arg("--batch-size")
            .arg(s.batch_size.to_string())
            .arg("--threads")
            .arg(s.threads.to_string())
            .arg("--n-gpu-layers")
            .arg(gpu_layers.to_string());

        if !spec.cpu_only {
            let visible: Vec<String> = spec
                .allocation
                .device_indices()
                .iter()
                .map(|i| i.to_string())
                .collect();
            cmd.env("CUDA_VISIBLE_DEVICES", visible.join(","));
            if spec.allocation.is_sharded() {
                let split: Vec<String> = spec
                    .allocation
                    .shares
                    .iter()
                    .map(|share| (share.bytes / (1024 * 1024)).max(1).to_string())
                    .collect();
                cmd.arg("--tensor-split").arg(split.join(","));
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn wait_ready(
        &self,
        child: &mut Child,
        base_url: &str,
        stderr_tail: &Arc<Mutex<VecDeque<String>>>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.settings.health_timeout;
        let health_url = format!("{}/health", base_url);
        let started = Instant::now();
        let mut polls = 0u32;

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(GatewayError::InstanceStart(format!(
                    "llama-server exited with {} before becoming ready: {}",
                    status,
                    tail_text(stderr_tail)
                )));
            }

            let healthy = self
                .client
                .get(&health_url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if healthy {
                info!(
                    "llama-server ready at {} after {:.1}s",
                    base_url,
                    started.elapsed().as_secs_f64()
                );
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(GatewayError::InstanceStart(format!(
                    "llama-server not ready within {}s: {}",
                    self.settings.health_timeout.as_secs(),
                    tail_text(stderr_tail)
                )));
            }
            polls += 1;
            if polls % 20 == 0 {
                info!(
                    "Still waiting for llama-server at {} ({}s)",
                    base_url,
                    started.elapsed().as_secs()
                );
            }
            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

fn tail_text(tail: &Arc<Mutex<VecDeque<String>>>) -> String {
    let tail = tail.lock().unwrap_or_else(|e| e.into_inner());
    if tail.is_empty() {
        "no output".to_string()
    } else {
        tail.iter().cloned().collect::<Vec<_>>().join(" | ")
    }
}

#[async_trait]
impl RuntimeLauncher for LlamaServerLauncher {
    fn supports_sharding(&self) -> bool {
        true
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ModelRuntime>> {
        let port = self.ports.acquire()?;
        let base_url = format!("http://{}:{}", self.settings.host, port);

        info!("Starting llama-server for {}", spec.identifier);
        info!("  Model: {}", spec.model_path.display());
        info!("  Port: {}", port);
        info!(
            "  Devices: {}",
            if spec.cpu_only {
                "cpu".to_string()
            } else {
                format!("{:?}", spec.allocation.device_indices())
            }
        );

        let mut child = match self.command(&spec, port).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                return Err(GatewayError::InstanceStart(format!(
                    "failed to spawn {}: {}",
                    self.settings.binary.display(),
                    e
                )));
            }
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let identifier = spec.identifier.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "llama_server", "[{}] {}", identifier, line);
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        if let Err(e) = self.wait_ready(&mut child, &base_url, &stderr_tail).await {
            error!("Failed to start {}: {}", spec.identifier, e);
            let _ = child.kill().await;
            self.ports.release(port);
            return Err(e);
        }

        let pid = child.id();
        Ok(Arc::new(LlamaServerRuntime {
            identifier: spec.identifier,
            base_url,
            port: Some(port),
            pid,
            ports: Some(self.ports.clone()),
            client: self.client.clone(),
            child: tokio::sync::Mutex::new(Some(child)),
        }))
    }
}

pub struct LlamaServerRuntime {
    identifier: String,
    base_url: String,
    port: Option<u16>,
    pid: Option<u32>,
    ports: Option<Arc<PortPool>>,
    client: reqwest::Client,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl LlamaServerRuntime {
    /// Proxy to an engine that is already running elsewhere.
    pub fn remote(identifier: &str, base_url: &str, client: reqwest::Client) -> Self {
        Self {
            identifier: identifier.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            port: None,
            pid: None,
            ports: None,
            client,
            child: tokio::sync::Mutex::new(None),
        }
    }

    async fn post(&self, body: Value) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(self.completions_url())
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream(format!(
                "engine for {} returned {}: {}",
                self.identifier, status, text
            )));
        }
        Ok(resp)
    }
}

fn engine_body(request: &ChatCompletionRequest, stream: bool) -> Result<Value> {
    let mut body = serde_json::to_value(request)
        .map_err(|e| GatewayError::Internal(format!("cannot encode request: {}", e)))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream".into(), Value::Bool(stream));
        if stream && !obj.contains_key("stream_options") {
            obj.insert(
                "stream_options".into(),
                serde_json::json!({ "include_usage": true }),
            );
        }
    }
    Ok(body)
}

/// Pops one newline-terminated line off the buffer, without the newline.
/// Multibyte characters split across network chunks stay buffered until the
/// whole line has arrived.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let newline = buffer.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=newline).collect();
    line.pop();
    Some(line)
}

#[async_trait]
impl ModelRuntime for LlamaServerRuntime {
    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            runtime_name: "llama.cpp (llama-server)".to_string(),
            base_url: self.base_url.clone(),
            process_id: self.pid,
            port: self.port,
            supports_streaming: true,
        }
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Upstream(format!(
                "health check returned {}",
                resp.status()
            )))
        }
    }

    async fn generate(&self, request: &ChatCompletionRequest) -> Result<Value> {
        let resp = self.post(engine_body(request, false)?).await?;
        resp.json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("invalid engine response: {}", e)))
    }

    async fn generate_stream(&self, request: &ChatCompletionRequest) -> Result<TokenStream> {
        let resp = self.post(engine_body(request, true)?).await?;
        let byte_stream = resp.bytes_stream();

        let sse_stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            futures_util::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| GatewayError::Upstream(format!("stream read error: {}", e)))?;
                buffer.extend_from_slice(&chunk);

                while let Some(line) = take_line(&mut buffer) {
                    let line = String::from_utf8(line)
                        .map_err(|e| GatewayError::Upstream(format!("engine sent invalid UTF-8: {}", e)))?;
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    if !data.is_empty() {
                        yield data.to_string();
                    }
                }
            }
        };

        Ok(Box::pin(sse_stream))
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        info!("Stopping llama-server for {}", self.identifier);
        if let Err(e) = child.start_kill() {
            warn!("Failed to signal llama-server for {}: {}", self.identifier, e);
        }
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) => debug!("llama-server for {} exited with {}", self.identifier, status),
            Ok(Err(e)) => warn!("Waiting for llama-server failed: {}", e),
            Err(_) => warn!("llama-server for {} did not exit within 10s", self.identifier),
        }
        if let (Some(ports), Some(port)) = (&self.ports, self.port) {
            ports.release(port);
        }
        Ok(())
    }
}
