//! Model instance cache: loading, admission, eviction and unloading.

pub mod footprint;
pub mod instance;
pub mod lru;
pub mod manager;

pub use footprint::FootprintEstimator;
pub use instance::{
    EnsureOptions, InstanceLease, InstanceState, InstanceSummary, LoadProgress, UnloadOutcome,
};
pub use manager::{BusyUnloadPolicy, LifecycleConfig, LifecycleManager};
