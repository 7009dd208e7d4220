// crates/modelgate/src/lib.rs

pub mod api;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod gpu;
pub mod lifecycle;
pub mod metrics;
pub mod model_runtime;
pub mod server;
pub mod shared_state;
pub mod stats;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherConfig, StreamEvent};
pub use error::{GatewayError, Result};
pub use lifecycle::{EnsureOptions, InstanceLease, LifecycleManager};
pub use server::{build_app_state, build_router, run_server};
pub use shared_state::AppState;
