//! Delivery side of rollwatch.
//!
//! Workload updates flow through [`EventPublisherQueue`] one at a time to every
//! [`EventPublisher`]; node and pod events are grouped by
//! [`ResourceEventBatcher`] and handed to every [`BatchPublisher`]. A failing
//! publisher is logged and never holds up the others.
#![forbid(unsafe_code)]

mod batcher;
pub mod controlplane;
mod heartbeat;
pub mod pubsub;
mod queue;
pub mod retry;
pub mod webhook;

use async_trait::async_trait;
use rollwatch_core::{ClusterHeartbeatPayload, ResourceEvent, WorkloadUpdateEvent};

pub use batcher::{resource_channel, BatchConfig, ResourceEventBatcher, FINAL_FLUSH_GRACE, RESOURCE_QUEUE_CAPACITY};
pub use controlplane::ControlPlanePublisher;
pub use heartbeat::{HeartbeatSender, DEFAULT_HEARTBEAT_INTERVAL};
pub use pubsub::{OrderedTransport, OutboundMessage, PubSubPublisher, RestPubSubTransport, TopicPath};
pub use queue::{event_channel, EventPublisherQueue, EVENT_QUEUE_CAPACITY};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use webhook::WebhookPublisher;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{endpoint} returned {status}: {body}")]
    Status { endpoint: String, status: u16, body: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("{failed} of {total} messages failed")]
    Partial { failed: usize, total: usize },
    #[error("invalid topic path {0:?}: expected projects/<project>/topics/<topic>")]
    InvalidTopic(String),
    #[error("access token unavailable: {0}")]
    Auth(String),
    #[error("publish cancelled")]
    Cancelled,
}

impl PublishError {
    /// Transport failures, throttling and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Transport(e) => !e.is_builder() && !e.is_decode(),
            PublishError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Receives every workload update, in queue order.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn publish(&self, update: &WorkloadUpdateEvent) -> Result<(), PublishError>;
}

/// Receives flushed batches of node and pod events.
#[async_trait]
pub trait BatchPublisher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn publish_batch(&self, events: &[ResourceEvent]) -> Result<(), PublishError>;
}

#[async_trait]
pub trait HeartbeatPublisher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn publish_heartbeat(&self, heartbeat: &ClusterHeartbeatPayload) -> Result<(), PublishError>;
}
