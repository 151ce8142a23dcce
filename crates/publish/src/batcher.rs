//! Size- and time-bounded batching of node and pod events.
//!
//! The buffer is owned by the single consumer task, so appends and
//! timer-driven flushes are serialized without a lock: the timer is just one
//! more branch of the same `select!`.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rollwatch_core::ResourceEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BatchPublisher;

pub const RESOURCE_QUEUE_CAPACITY: usize = 1000;

/// Upper bound on the flush performed at shutdown.
pub const FINAL_FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Bounded queue for resource events. Producers use `try_send` and drop on full.
pub fn resource_channel() -> (mpsc::Sender<ResourceEvent>, mpsc::Receiver<ResourceEvent>) {
    mpsc::channel(RESOURCE_QUEUE_CAPACITY)
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub flush_window: Duration,
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self { Self { flush_window: Duration::from_secs(2), max_batch_size: 100 } }
}

pub struct ResourceEventBatcher {
    rx: mpsc::Receiver<ResourceEvent>,
    publishers: Vec<Arc<dyn BatchPublisher>>,
    config: BatchConfig,
    buffer: Vec<ResourceEvent>,
}

impl ResourceEventBatcher {
    pub fn new(rx: mpsc::Receiver<ResourceEvent>, publishers: Vec<Arc<dyn BatchPublisher>>, config: BatchConfig) -> Self {
        let config = BatchConfig { max_batch_size: config.max_batch_size.max(1), ..config };
        Self { rx, publishers, config, buffer: Vec::with_capacity(config.max_batch_size) }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            publishers = self.publishers.len(),
            flush_window_ms = self.config.flush_window.as_millis() as u64,
            max_batch_size = self.config.max_batch_size,
            "resource event batcher started"
        );
        // Set when the first event of a cycle is buffered.
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = wait_until(deadline) => {
                    deadline = None;
                    self.flush("timer").await;
                }
                next = self.rx.recv() => match next {
                    Some(event) => {
                        self.buffer.push(event);
                        if self.buffer.len() == 1 {
                            deadline = Some(Instant::now() + self.config.flush_window);
                        }
                        if self.buffer.len() >= self.config.max_batch_size {
                            deadline = None;
                            self.flush("size").await;
                        }
                    }
                    None => break,
                },
            }
        }

        // Whatever the producers managed to queue goes out with the final flush.
        while let Ok(event) = self.rx.try_recv() {
            self.buffer.push(event);
        }
        let pending = self.buffer.len();
        if tokio::time::timeout(FINAL_FLUSH_GRACE, self.drain()).await.is_err() {
            warn!(pending, "final resource event flush timed out");
        }
        info!("resource event batcher stopped");
    }

    async fn drain(&mut self) {
        while !self.buffer.is_empty() {
            self.flush("shutdown").await;
        }
    }

    /// Hand at most one batch to every publisher and reset the buffer.
    async fn flush(&mut self, trigger: &'static str) {
        if self.buffer.is_empty() {
            return;
        }
        let take = self.buffer.len().min(self.config.max_batch_size);
        let batch: Vec<ResourceEvent> = self.buffer.drain(..take).collect();
        debug!(events = batch.len(), trigger, publishers = self.publishers.len(), "flushing resource event batch");
        counter!("rollwatch_batches_flushed_total", "trigger" => trigger).increment(1);
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_batch(&batch).await {
                error!(publisher = publisher.name(), events = batch.len(), error = %e, "failed to publish resource event batch");
                counter!("rollwatch_publish_failures_total", "publisher" => publisher.name()).increment(1);
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rollwatch_core::{ResourceEventKind, SourceMetadata};

    use crate::PublishError;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<(usize, Instant)>>,
    }

    impl Recorder {
        fn sizes(&self) -> Vec<usize> { self.batches.lock().unwrap().iter().map(|(n, _)| *n).collect() }
    }

    #[async_trait]
    impl BatchPublisher for Recorder {
        fn name(&self) -> &'static str { "recorder" }
        async fn publish_batch(&self, events: &[ResourceEvent]) -> Result<(), PublishError> {
            self.batches.lock().unwrap().push((events.len(), Instant::now()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl BatchPublisher for Failing {
        fn name(&self) -> &'static str { "failing" }
        async fn publish_batch(&self, _: &[ResourceEvent]) -> Result<(), PublishError> { Err(PublishError::Cancelled) }
    }

    fn node(i: usize) -> ResourceEvent {
        ResourceEvent::node(&SourceMetadata::default(), &format!("n{i}"), "", Default::default(), ResourceEventKind::Created)
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_then_timer_batch() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = resource_channel();
        for i in 0..150 {
            tx.try_send(node(i)).unwrap();
        }
        let start = Instant::now();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            ResourceEventBatcher::new(rx, vec![recorder.clone()], BatchConfig::default()).run(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.sizes(), vec![100]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.sizes(), vec![100, 50]);
        let second = recorder.batches.lock().unwrap()[1].1;
        assert!(second - start >= Duration::from_secs(2));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(recorder.sizes(), vec![100, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_restarts_per_cycle() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = resource_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            ResourceEventBatcher::new(rx, vec![recorder.clone()], BatchConfig::default()).run(cancel.clone()),
        );

        tx.try_send(node(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.try_send(node(1)).unwrap();
        tx.try_send(node(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(recorder.sizes(), vec![1]);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(recorder.sizes(), vec![1, 2]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_buffered_and_queued_events() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = resource_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            ResourceEventBatcher::new(rx, vec![Arc::new(Failing), recorder.clone()], BatchConfig::default())
                .run(cancel.clone()),
        );
        for i in 0..30 {
            tx.try_send(node(i)).unwrap();
        }
        tokio::task::yield_now().await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(recorder.sizes().iter().sum::<usize>(), 30);
    }

    #[tokio::test]
    async fn closed_queue_flushes_and_exits() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = resource_channel();
        for i in 0..7 {
            tx.try_send(node(i)).unwrap();
        }
        drop(tx);
        ResourceEventBatcher::new(rx, vec![recorder.clone()], BatchConfig::default()).run(CancellationToken::new()).await;
        assert_eq!(recorder.sizes(), vec![7]);
    }
}
