// crates/modelgate/src/gpu/detect.rs

use serde::Serialize;
use sysinfo::System;
use tracing::{info, warn};

use super::GpuDevice;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInventory {
    /// "override", "nvml" or "cpu"
    pub backend: String,
    pub driver_version: Option<String>,
    pub devices: Vec<GpuDevice>,
}

impl DeviceInventory {
    pub fn is_cpu_only(&self) -> bool {
        self.backend == "cpu"
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDeviceStats {
    pub index: usize,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_percent: Option<u32>,
    pub temperature_celsius: Option<u32>,
}

/// Parse `GPU_MEMORY_MB`, a comma separated list of per-device sizes.
pub fn parse_memory_override(raw: &str) -> anyhow::Result<Vec<GpuDevice>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(index, mb)| {
            let mb: u64 = mb
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid GPU_MEMORY_MB entry: {:?}", mb))?;
            Ok(GpuDevice::new(index, format!("gpu{}", index), mb * 1024 * 1024))
        })
        .collect()
}

/// Override list first, then NVML, then a single CPU pseudo-device sized
/// from system RAM.
pub fn detect_devices(memory_override: Option<&str>) -> anyhow::Result<DeviceInventory> {
    if let Some(raw) = memory_override {
        let devices = parse_memory_override(raw)?;
        if !devices.is_empty() {
            info!("Using {} device(s) from GPU_MEMORY_MB", devices.len());
            return Ok(DeviceInventory {
                backend: "override".into(),
                driver_version: None,
                devices,
            });
        }
    }

    if let Some(inventory) = detect_nvml() {
        return Ok(inventory);
    }

    let mut sys = System::new_all();
    sys.refresh_memory();
    let total = sys.total_memory();
    warn!(
        "No GPU detected, serving from system memory ({} MB)",
        total / 1024 / 1024
    );
    Ok(DeviceInventory {
        backend: "cpu".into(),
        driver_version: None,
        devices: vec![GpuDevice::new(0, "cpu", total)],
    })
}

#[cfg(feature = "nvml")]
fn detect_nvml() -> Option<DeviceInventory> {
    use nvml_wrapper::Nvml;

    let nvml = Nvml::init().ok()?;
    let count = nvml.device_count().ok()?;
    let mut devices = Vec::new();
    for index in 0..count {
        let Ok(device) = nvml.device_by_index(index) else {
            continue;
        };
        let Ok(memory) = device.memory_info() else {
            continue;
        };
        let name = device.name().unwrap_or_else(|_| format!("gpu{}", index));
        info!(
            "Detected GPU {}: {} ({} GB VRAM)",
            index,
            name,
            memory.total / 1024 / 1024 / 1024
        );
        devices.push(GpuDevice::new(index as usize, name, memory.total));
    }
    if devices.is_empty() {
        return None;
    }
    Some(DeviceInventory {
        backend: "nvml".into(),
        driver_version: nvml.sys_driver_version().ok(),
        devices,
    })
}

#[cfg(not(feature = "nvml"))]
fn detect_nvml() -> Option<DeviceInventory> {
    None
}

/// Current utilization as reported by the driver. Empty without NVML.
#[cfg(feature = "nvml")]
pub fn probe_live() -> Vec<LiveDeviceStats> {
    use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
    use nvml_wrapper::Nvml;

    let Ok(nvml) = Nvml::init() else {
        return Vec::new();
    };
    let count = nvml.device_count().unwrap_or(0);
    (0..count)
        .filter_map(|index| {
            let device = nvml.device_by_index(index).ok()?;
            let memory = device.memory_info().ok()?;
            Some(LiveDeviceStats {
                index: index as usize,
                name: device.name().unwrap_or_else(|_| format!("gpu{}", index)),
                memory_total_mb: memory.total / 1024 / 1024,
                memory_used_mb: memory.used / 1024 / 1024,
                utilization_percent: device.utilization_rates().ok().map(|u| u.gpu),
                temperature_celsius: device.temperature(TemperatureSensor::Gpu).ok(),
            })
        })
        .collect()
}

#[cfg(not(feature = "nvml"))]
pub fn probe_live() -> Vec<LiveDeviceStats> {
    Vec::new()
}
