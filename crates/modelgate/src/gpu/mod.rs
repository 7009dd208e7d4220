//! GPU memory accounting.
//!
//! Tracks total and allocated memory per device and decides where a model
//! footprint goes. Allocation and release happen under one lock so the
//! `allocated <= total` invariant holds between any two operations.

pub mod detect;

pub use detect::{detect_devices, probe_live, DeviceInventory, LiveDeviceStats};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct GpuDevice {
    pub index: usize,
    pub name: String,
    pub total_bytes: u64,
    pub allocated_bytes: u64,
}

impl GpuDevice {
    pub fn new(index: usize, name: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            index,
            name: name.into(),
            total_bytes,
            allocated_bytes: 0,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.allocated_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceShare {
    pub device: usize,
    pub bytes: u64,
}

/// Memory reserved for one instance. Release it exactly once through
/// [`GpuTracker::release`]; repeated releases are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub id: u64,
    pub shares: Vec<DeviceShare>,
}

impl Allocation {
    pub fn device_indices(&self) -> Vec<usize> {
        self.shares.iter().map(|s| s.device).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.shares.iter().map(|s| s.bytes).sum()
    }

    pub fn is_sharded(&self) -> bool {
        self.shares.len() > 1
    }
}

/// Decide where `footprint` bytes go without touching any state.
///
/// A `preferred` device is strict: the footprint lands there or nowhere.
/// Errors with `Placement` when no amount of eviction could make it fit and
/// `InsufficientMemory` when freeing memory might.
pub fn plan_placement(
    devices: &[GpuDevice],
    footprint: u64,
    preferred: Option<usize>,
    shardable: bool,
) -> Result<Vec<DeviceShare>> {
    if devices.is_empty() {
        return Err(GatewayError::Placement("no devices available".into()));
    }

    if let Some(index) = preferred {
        let device = devices.iter().find(|d| d.index == index).ok_or_else(|| {
            GatewayError::Placement(format!("device {} does not exist", index))
        })?;
        if device.total_bytes < footprint {
            return Err(GatewayError::Placement(format!(
                "footprint of {} bytes exceeds device {} capacity of {} bytes",
                footprint, index, device.total_bytes
            )));
        }
        if device.free_bytes() >= footprint {
            return Ok(vec![DeviceShare {
                device: index,
                bytes: footprint,
            }]);
        }
        return Err(GatewayError::InsufficientMemory {
            needed: footprint,
            available: device.free_bytes(),
        });
    }

    // Most free memory wins; on ties the lowest index.
    let best = devices
        .iter()
        .filter(|d| d.free_bytes() >= footprint)
        .max_by(|a, b| a.free_bytes().cmp(&b.free_bytes()).then(b.index.cmp(&a.index)));
    if let Some(device) = best {
        return Ok(vec![DeviceShare {
            device: device.index,
            bytes: footprint,
        }]);
    }

    let free_total: u64 = devices.iter().map(|d| d.free_bytes()).sum();
    if shardable && devices.len() > 1 && free_total >= footprint {
        return Ok(split_proportionally(devices, footprint, free_total));
    }

    let capacity = if shardable {
        devices.iter().map(|d| d.total_bytes).sum::<u64>()
    } else {
        devices.iter().map(|d| d.total_bytes).max().unwrap_or(0)
    };
    if footprint > capacity {
        return Err(GatewayError::Placement(format!(
            "footprint of {} bytes can never fit (capacity {} bytes{})",
            footprint,
            capacity,
            if shardable { " across all devices" } else { " on the largest device" }
        )));
    }

    let available = if shardable {
        free_total
    } else {
        devices.iter().map(|d| d.free_bytes()).max().unwrap_or(0)
    };
    Err(GatewayError::InsufficientMemory {
        needed: footprint,
        available,
    })
}

/// Shares proportional to each device's free memory. Rounding leftovers are
/// handed out to devices that still have room, so every share fits.
fn split_proportionally(devices: &[GpuDevice], footprint: u64, free_total: u64) -> Vec<DeviceShare> {
    let mut shares: Vec<DeviceShare> = devices
        .iter()
        .filter(|d| d.free_bytes() > 0)
        .map(|d| DeviceShare {
            device: d.index,
            bytes: ((footprint as u128 * d.free_bytes() as u128) / free_total as u128) as u64,
        })
        .collect();

    let mut remainder = footprint - shares.iter().map(|s| s.bytes).sum::<u64>();
    for share in shares.iter_mut() {
        if remainder == 0 {
            break;
        }
        let free = devices
            .iter()
            .find(|d| d.index == share.device)
            .map(|d| d.free_bytes())
            .unwrap_or(0);
        let extra = remainder.min(free - share.bytes);
        share.bytes += extra;
        remainder -= extra;
    }
    shares.retain(|s| s.bytes > 0);
    shares
}

struct TrackerState {
    devices: Vec<GpuDevice>,
    live: HashMap<u64, Vec<DeviceShare>>,
}

pub struct GpuTracker {
    state: Mutex<TrackerState>,
    next_id: AtomicU64,
}

impl GpuTracker {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        for d in &devices {
            info!(
                "Tracking device {} ({}): {} MB",
                d.index,
                d.name,
                d.total_bytes / 1024 / 1024
            );
        }
        Self {
            state: Mutex::new(TrackerState {
                devices,
                live: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn inventory(&self) -> Vec<GpuDevice> {
        self.lock().devices.clone()
    }

    pub fn reserve(&self, footprint: u64, preferred: Option<usize>, shardable: bool) -> Result<Allocation> {
        let mut state = self.lock();
        let shares = plan_placement(&state.devices, footprint, preferred, shardable)?;
        for share in &shares {
            if let Some(device) = state.devices.iter_mut().find(|d| d.index == share.device) {
                device.allocated_bytes += share.bytes;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.live.insert(id, shares.clone());
        debug!("Reserved allocation {}: {:?}", id, shares);
        Ok(Allocation { id, shares })
    }

    /// Returns false when the allocation was already released.
    pub fn release(&self, allocation: &Allocation) -> bool {
        let mut state = self.lock();
        let Some(shares) = state.live.remove(&allocation.id) else {
            return false;
        };
        for share in shares {
            if let Some(device) = state.devices.iter_mut().find(|d| d.index == share.device) {
                device.allocated_bytes = device.allocated_bytes.saturating_sub(share.bytes);
            }
        }
        debug!("Released allocation {}", allocation.id);
        true
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.lock().devices.iter().map(|d| d.allocated_bytes).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
