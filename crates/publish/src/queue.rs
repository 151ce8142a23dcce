use std::sync::Arc;

use metrics::counter;
use rollwatch_core::WorkloadUpdateEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::EventPublisher;

pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// Bounded hand-off between the workload reconciler and the publishers.
/// Senders wait when it is full.
pub fn event_channel() -> (mpsc::Sender<WorkloadUpdateEvent>, mpsc::Receiver<WorkloadUpdateEvent>) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}

pub struct EventPublisherQueue {
    rx: mpsc::Receiver<WorkloadUpdateEvent>,
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl EventPublisherQueue {
    pub fn new(rx: mpsc::Receiver<WorkloadUpdateEvent>, publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { rx, publishers }
    }

    /// Drain the queue until it closes or `cancel` fires; an event already
    /// taken off the queue is delivered before exiting.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(publishers = self.publishers.len(), "event publisher queue started");
        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(update) => update,
                    None => break,
                },
            };
            self.deliver(&update).await;
        }
        info!("event publisher queue stopped");
    }

    async fn deliver(&self, update: &WorkloadUpdateEvent) {
        info!(
            namespace = %update.namespace,
            name = %update.name,
            kind = %update.kind,
            previous_version = %update.previous_version,
            current_version = %update.current_version,
            phase = %update.phase,
            "received workload update"
        );
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(update).await {
                error!(
                    publisher = publisher.name(),
                    namespace = %update.namespace,
                    name = %update.name,
                    error = %e,
                    "failed to publish event"
                );
                counter!("rollwatch_publish_failures_total", "publisher" => publisher.name()).increment(1);
            }
        }
    }
}
