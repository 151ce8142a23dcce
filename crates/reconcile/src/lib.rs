//! Rollwatch reconcile: the workload rollout state machine, the version gauge
//! and node/pod change detection.
//!
//! A workload pass reads and writes in-memory state under one lock that is
//! never held across store I/O or the event queue send. Per-key passes are
//! serialized by the work queue, so two passes never race on one workload.

#![forbid(unsafe_code)]

mod controller;
pub mod gauge;
pub mod infra;
mod workload;

pub use controller::{run_node_watcher, run_pod_watcher, WorkloadController};
pub use gauge::{VersionGauge, VersionSeries, APP_VERSION_METRIC};
pub use infra::{offer, NodeReconciler, PodReconciler};
pub use workload::{PassOutcome, WorkloadReconciler, ROLLING_OUT_REQUEUE, ROLLOUT_TIMEOUT};
