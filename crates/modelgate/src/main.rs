// crates/modelgate/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use modelgate::{config::Config, run_server};
#[cfg(feature = "cli")]
use std::path::PathBuf;

/// Local LLM gateway: loads GGUF models on demand and serves them over an
/// OpenAI-compatible API.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "modelgate", version, about)]
struct Args {
    /// Listen address (overrides API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Where model files are stored (overrides DOWNLOAD_DIR)
    #[arg(long)]
    download_dir: Option<PathBuf>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    modelgate::telemetry::init_tracing();

    let mut cfg = Config::from_env()?;
    if let Some(host) = args.host {
        cfg.api_host = host;
    }
    if let Some(port) = args.port {
        cfg.api_port = port;
    }
    if let Some(dir) = args.download_dir {
        cfg.download_dir = dir;
    }

    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
