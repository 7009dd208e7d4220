//! Model runtimes
//!
//! Inference engines sit behind [`ModelRuntime`] and are started by a
//! [`RuntimeLauncher`]. Every engine speaks the OpenAI HTTP API, so the
//! gateway only proxies requests: Rust → HTTP → engine process.

pub mod llama_server;
pub mod runtime_trait;

pub use llama_server::{LlamaServerLauncher, LlamaServerRuntime, LlamaSettings, PortPool};
pub use runtime_trait::{
    ChatCompletionRequest, ChatMessage, LaunchSpec, ModelRuntime, RuntimeLauncher, RuntimeMetadata,
    TokenStream,
};
