use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::gpu::Allocation;

/// Raw `data:` payloads of an OpenAI-style event stream, `[DONE]` excluded
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// String or content-part array; forwarded untouched
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// OpenAI chat completion body. Fields the gateway does not interpret are
/// kept in `extra` and forwarded to the engine as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub runtime_name: String,
    pub base_url: String,
    pub process_id: Option<u32>,
    pub port: Option<u16>,
    pub supports_streaming: bool,
}

/// A running inference engine serving one model.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    fn metadata(&self) -> RuntimeMetadata;

    fn base_url(&self) -> String {
        self.metadata().base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url())
    }

    async fn health_check(&self) -> Result<()>;

    /// Non-streaming completion; returns the engine's JSON body.
    async fn generate(&self, request: &ChatCompletionRequest) -> Result<Value>;

    async fn generate_stream(&self, request: &ChatCompletionRequest) -> Result<TokenStream>;

    /// Stop the engine. Calling it twice is harmless.
    async fn shutdown(&self) -> Result<()>;
}

/// Everything needed to bring an engine up for one model.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub identifier: String,
    pub model_path: PathBuf,
    pub allocation: Allocation,
    /// Placed on the system-memory pseudo-device
    pub cpu_only: bool,
}

/// Starts engines. Returns once the engine reports ready.
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    fn supports_sharding(&self) -> bool;

    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ModelRuntime>>;
}
