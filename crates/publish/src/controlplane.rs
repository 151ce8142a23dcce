//! HTTP sink for the control plane ingest API.
//!
//! Single events go to the configured endpoint, batches to `<endpoint>/batch`
//! and heartbeats to `<endpoint>/heartbeat`. Batch bodies above
//! [`COMPRESSION_THRESHOLD`] are gzip-encoded.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use rollwatch_core::{AgentEventPayload, ClusterHeartbeatPayload, ResourceEvent, SourceMetadata, WorkloadUpdateEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::{BatchPublisher, EventPublisher, HeartbeatPublisher, PublishError};

pub const COMPRESSION_THRESHOLD: usize = 10 * 1024;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlPlanePublisher {
    http: reqwest::Client,
    endpoint: String,
    batch_endpoint: String,
    heartbeat_endpoint: String,
    source: SourceMetadata,
    environment: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ControlPlanePublisher {
    pub fn new(endpoint: &str, source: SourceMetadata, environment: &str) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            batch_endpoint: sub_endpoint(endpoint, "batch"),
            heartbeat_endpoint: sub_endpoint(endpoint, "heartbeat"),
            source,
            environment: environment.to_string(),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// In-flight requests and backoff waits abort once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }
    pub fn batch_endpoint(&self) -> &str { &self.batch_endpoint }
    pub fn heartbeat_endpoint(&self) -> &str { &self.heartbeat_endpoint }

    async fn post(&self, url: &str, body: &[u8], gzip: bool) -> Result<(), PublishError> {
        retry_with_backoff(&self.retry, url, &self.cancel, || async move {
            let mut req = self.http.post(url).header(CONTENT_TYPE, "application/json").body(body.to_vec());
            if gzip {
                req = req.header(CONTENT_ENCODING, "gzip");
            }
            let resp = req.send().await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            let body = resp.text().await.unwrap_or_default();
            error!(endpoint = %url, status = status.as_u16(), body = %body, "control plane returned error");
            Err(PublishError::Status { endpoint: url.to_string(), status: status.as_u16(), body })
        })
        .await
    }
}

#[async_trait]
impl EventPublisher for ControlPlanePublisher {
    fn name(&self) -> &'static str { "controlplane" }

    async fn publish(&self, update: &WorkloadUpdateEvent) -> Result<(), PublishError> {
        let event = AgentEventPayload::from_update(update, &self.source, &self.environment);
        let body = serde_json::to_vec(&event)?;
        debug!(
            endpoint = %self.endpoint,
            event_id = %event.event_id,
            namespace = %update.namespace,
            name = %update.name,
            current_version = %update.current_version,
            previous_version = %update.previous_version,
            "publishing event to control plane"
        );
        self.post(&self.endpoint, &body, false).await?;
        info!(endpoint = %self.endpoint, event_id = %event.event_id, namespace = %update.namespace, name = %update.name, "event published to control plane");
        Ok(())
    }
}

#[async_trait]
impl BatchPublisher for ControlPlanePublisher {
    fn name(&self) -> &'static str { "controlplane" }

    async fn publish_batch(&self, events: &[ResourceEvent]) -> Result<(), PublishError> {
        if events.is_empty() {
            return Ok(());
        }
        let json = serde_json::to_vec(events)?;
        let (body, gzip) = if json.len() > COMPRESSION_THRESHOLD {
            let compressed = gzip_bytes(&json)?;
            debug!(original_size = json.len(), compressed_size = compressed.len(), "compressed batch");
            (compressed, true)
        } else {
            (json, false)
        };
        self.post(&self.batch_endpoint, &body, gzip).await?;
        info!(endpoint = %self.batch_endpoint, events = events.len(), gzip, "batch published to control plane");
        Ok(())
    }
}

#[async_trait]
impl HeartbeatPublisher for ControlPlanePublisher {
    fn name(&self) -> &'static str { "controlplane" }

    async fn publish_heartbeat(&self, heartbeat: &ClusterHeartbeatPayload) -> Result<(), PublishError> {
        let body = serde_json::to_vec(heartbeat)?;
        self.post(&self.heartbeat_endpoint, &body, false).await
    }
}

fn sub_endpoint(endpoint: &str, leaf: &str) -> String { format!("{}/{leaf}", endpoint.trim_end_matches('/')) }

fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>, PublishError> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn derived_endpoints_ignore_trailing_slash() {
        let p = ControlPlanePublisher::new("http://cp/ingest/v1/agent/events/", SourceMetadata::default(), "").unwrap();
        assert_eq!(p.batch_endpoint(), "http://cp/ingest/v1/agent/events/batch");
        assert_eq!(p.heartbeat_endpoint(), "http://cp/ingest/v1/agent/events/heartbeat");
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"{\"events\":[]}".repeat(100);
        let packed = gzip_bytes(&data).unwrap();
        let mut out = Vec::new();
        GzDecoder::new(packed.as_slice()).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
