//! Wiring: watchers feed the object cache and the work queue, workers run
//! reconciliation passes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client};
use rollwatch_core::WorkloadKey;
use rollwatch_kubehub::{watch_objects, watch_workloads, SnapshotCache};
use rollwatch_store::{spawn_workers, WorkQueue};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::infra::{NodeReconciler, PodReconciler};
use crate::workload::WorkloadReconciler;

/// Owns the object cache and work queue for the three workload kinds.
#[derive(Clone)]
pub struct WorkloadController {
    reconciler: Arc<WorkloadReconciler>,
    cache: SnapshotCache,
    queue: WorkQueue<WorkloadKey>,
}

impl WorkloadController {
    pub fn new(reconciler: Arc<WorkloadReconciler>) -> Self {
        Self { reconciler, cache: SnapshotCache::new(), queue: WorkQueue::new() }
    }

    pub fn cache(&self) -> &SnapshotCache { &self.cache }
    pub fn queue(&self) -> &WorkQueue<WorkloadKey> { &self.queue }

    /// One worker step: reconcile what the cache holds for `key`, or clean up
    /// if it is gone. Returns the requeue delay, if any.
    pub async fn process(&self, key: WorkloadKey) -> Option<Duration> {
        match self.cache.get(&key) {
            Some(snap) => self.reconciler.reconcile(snap.as_ref()).await.requeue_after,
            None => {
                self.reconciler.handle_deletion(&key).await;
                None
            }
        }
    }

    /// Run watchers and `workers` reconcile tasks until `cancel` fires.
    pub async fn run(self, client: Client, workers: usize, cancel: CancellationToken) -> Result<()> {
        let handles = {
            let this = self.clone();
            spawn_workers(self.queue.clone(), workers, move |key| {
                let this = this.clone();
                async move { this.process(key).await }
            })
        };
        info!(workers, "workload controller started");

        let enqueue = |q: WorkQueue<WorkloadKey>| move |key| q.add(key);
        let (deployments, statefulsets, daemonsets) = tokio::join!(
            watch_workloads::<Deployment, _>(Api::all(client.clone()), self.cache.clone(), cancel.clone(), enqueue(self.queue.clone())),
            watch_workloads::<StatefulSet, _>(Api::all(client.clone()), self.cache.clone(), cancel.clone(), enqueue(self.queue.clone())),
            watch_workloads::<DaemonSet, _>(Api::all(client), self.cache.clone(), cancel.clone(), enqueue(self.queue.clone())),
        );
        for (kind, res) in [("Deployment", deployments), ("StatefulSet", statefulsets), ("DaemonSet", daemonsets)] {
            if let Err(e) = res {
                warn!(kind, error = %e, "workload watcher failed");
            }
        }

        self.queue.shutdown();
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "reconcile worker panicked");
            }
        }
        info!("workload controller stopped");
        Ok(())
    }
}

pub async fn run_node_watcher(client: Client, mut reconciler: NodeReconciler, cancel: CancellationToken) -> Result<()> {
    watch_objects(Api::<Node>::all(client), "Node", cancel, move |change| reconciler.handle(change)).await
}

pub async fn run_pod_watcher(client: Client, mut reconciler: PodReconciler, cancel: CancellationToken) -> Result<()> {
    watch_objects(Api::<Pod>::all(client), "Pod", cancel, move |change| reconciler.handle(change)).await
}
