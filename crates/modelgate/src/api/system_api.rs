// crates/modelgate/src/api/system_api.rs

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use sysinfo::System;

use crate::gpu::{probe_live, GpuDevice, LiveDeviceStats};
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSpecs {
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub cpu_brand: Option<String>,
    pub cpu_cores: usize,
    pub cpu_threads: usize,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub gpu_backend: String,
    pub gpus: Vec<GpuDevice>,
    pub uptime_seconds: u64,
}

/// GET /system/specs
pub async fn specs(State(state): State<AppState>) -> impl IntoResponse {
    let mut sys = System::new_all();
    sys.refresh_memory();

    Json(SystemSpecs {
        os: System::name(),
        os_version: System::os_version(),
        cpu_brand: sys.cpus().first().map(|c| c.brand().trim().to_string()),
        cpu_cores: num_cpus::get_physical(),
        cpu_threads: num_cpus::get(),
        total_memory_mb: sys.total_memory() / 1024 / 1024,
        available_memory_mb: sys.available_memory() / 1024 / 1024,
        gpu_backend: state.inventory.backend.clone(),
        gpus: state.inventory.devices.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStats {
    pub backend: String,
    pub driver_version: Option<String>,
    /// Reservations made by the gateway
    pub devices: Vec<GpuDevice>,
    /// What the driver reports right now
    pub live: Vec<LiveDeviceStats>,
}

/// GET /gpu/stats
pub async fn gpu_stats(State(state): State<AppState>) -> impl IntoResponse {
    let live = tokio::task::spawn_blocking(probe_live)
        .await
        .unwrap_or_default();

    Json(GpuStats {
        backend: state.inventory.backend.clone(),
        driver_version: state.inventory.driver_version.clone(),
        devices: state.gpus().inventory(),
        live,
    })
}
