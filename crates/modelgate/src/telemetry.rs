// crates/modelgate/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when RUST_LOG is unset. Engine stderr is logged under the
/// `llama_server` target at debug level and stays quiet here.
pub const DEFAULT_FILTER: &str = "info";

pub fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
