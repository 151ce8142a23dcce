//! Rollwatch kubehub: workload adapters, resource filtering and watcher wiring.

#![forbid(unsafe_code)]

pub mod filter;
pub mod infra;
mod inventory;
mod watch;
pub mod workload;

pub use filter::{FilterConfig, ResourceFilter, DEFAULT_EXCLUDED_NAMESPACES};
pub use infra::{NodeObservation, NodeSnapshot, PodObservation, PodSnapshot};
pub use inventory::KubeInventory;
pub use watch::{watch_objects, watch_workloads, SnapshotCache, WatchChange};
pub use workload::{
    DaemonSetSnapshot, DeploymentSnapshot, RolloutDigest, StatefulSetSnapshot, WorkloadObject, WorkloadSnapshot,
};
