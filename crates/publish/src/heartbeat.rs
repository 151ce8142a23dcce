use std::sync::Arc;
use std::time::Duration;

use rollwatch_core::{ClusterHeartbeatPayload, Inventory, ResourceInventory, SourceMetadata};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::HeartbeatPublisher;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Periodically reports the UIDs of tracked nodes and pods.
pub struct HeartbeatSender {
    source: SourceMetadata,
    inventory: Arc<dyn Inventory>,
    publishers: Vec<Arc<dyn HeartbeatPublisher>>,
    interval: Duration,
    track_nodes: bool,
    track_pods: bool,
}

impl HeartbeatSender {
    pub fn new(source: SourceMetadata, inventory: Arc<dyn Inventory>, publishers: Vec<Arc<dyn HeartbeatPublisher>>) -> Self {
        Self { source, inventory, publishers, interval: DEFAULT_HEARTBEAT_INTERVAL, track_nodes: true, track_pods: true }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_secs(1));
        self
    }

    pub fn tracking(mut self, nodes: bool, pods: bool) -> Self {
        self.track_nodes = nodes;
        self.track_pods = pods;
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> { tokio::spawn(self.run(cancel)) }

    /// Send immediately, then once per interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            cluster_id = %self.source.cluster_id,
            track_nodes = self.track_nodes,
            track_pods = self.track_pods,
            publishers = self.publishers.len(),
            "heartbeat sender started"
        );
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.send_once().await;
                }
            }
        }
        info!("heartbeat sender stopped");
    }

    pub async fn send_once(&self) -> ClusterHeartbeatPayload {
        let mut inventory = ResourceInventory::default();
        if self.track_nodes {
            match self.inventory.node_uids().await {
                Ok(uids) => inventory.node_uids = uids,
                Err(e) => error!(error = %e, "failed to collect node UIDs"),
            }
        }
        if self.track_pods {
            match self.inventory.pod_uids().await {
                Ok(uids) => inventory.pod_uids = uids,
                Err(e) => error!(error = %e, "failed to collect pod UIDs"),
            }
        }
        let payload = ClusterHeartbeatPayload::new(&self.source, inventory);
        info!(
            event_id = %payload.event_id,
            nodes = payload.inventory.node_uids.len(),
            pods = payload.inventory.pod_uids.len(),
            "sending heartbeat"
        );
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_heartbeat(&payload).await {
                error!(publisher = publisher.name(), error = %e, "failed to publish heartbeat");
            }
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::PublishError;

    struct FixedInventory;

    #[async_trait]
    impl Inventory for FixedInventory {
        async fn node_uids(&self) -> anyhow::Result<Vec<String>> { Ok(vec!["n-1".into(), "n-2".into()]) }
        async fn pod_uids(&self) -> anyhow::Result<Vec<String>> { anyhow::bail!("forbidden") }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<ClusterHeartbeatPayload>>,
    }

    #[async_trait]
    impl HeartbeatPublisher for Recorder {
        fn name(&self) -> &'static str { "recorder" }
        async fn publish_heartbeat(&self, heartbeat: &ClusterHeartbeatPayload) -> Result<(), PublishError> {
            self.sent.lock().unwrap().push(heartbeat.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn inventory_errors_leave_that_list_empty() {
        let recorder = Arc::new(Recorder::default());
        let sender = HeartbeatSender::new(SourceMetadata::new("c1", "t"), Arc::new(FixedInventory), vec![recorder.clone()]);
        let hb = sender.send_once().await;
        assert_eq!(hb.message_type, "HEARTBEAT");
        assert_eq!(hb.inventory.node_uids, vec!["n-1", "n-2"]);
        assert!(hb.inventory.pod_uids.is_empty());
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn untracked_kinds_are_not_listed() {
        let sender = HeartbeatSender::new(SourceMetadata::default(), Arc::new(FixedInventory), vec![]).tracking(false, true);
        assert!(sender.send_once().await.inventory.node_uids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sends_immediately_then_every_interval() {
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let task = HeartbeatSender::new(SourceMetadata::default(), Arc::new(FixedInventory), vec![recorder.clone()])
            .with_interval(Duration::from_secs(300))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 3);

        cancel.cancel();
        task.await.unwrap();
    }
}
