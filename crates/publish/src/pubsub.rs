//! Ordered pub/sub sink.
//!
//! Every message carries the cluster id as its ordering key, so subscribers
//! see one cluster's events in publish order. [`RestPubSubTransport`] talks to
//! the Pub/Sub REST API directly, authenticating with the GCE metadata server
//! or, when `PUBSUB_EMULATOR_HOST` is set, not at all.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rollwatch_core::{AgentEventPayload, ResourceEvent, SourceMetadata, WorkloadUpdateEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controlplane::REQUEST_TIMEOUT;
use crate::{BatchPublisher, EventPublisher, PublishError};

pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Tokens are refreshed this long before they expire.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// `projects/<project>/topics/<topic>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath {
    pub project: String,
    pub topic: String,
}

impl TopicPath {
    pub fn parse(path: &str) -> Result<Self, PublishError> {
        match path.split('/').collect::<Vec<_>>().as_slice() {
            ["projects", project, "topics", topic] if !project.is_empty() && !topic.is_empty() => {
                Ok(Self { project: project.to_string(), topic: topic.to_string() })
            }
            _ => Err(PublishError::InvalidTopic(path.to_string())),
        }
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project, self.topic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    pub ordering_key: String,
}

/// Publishes one message and resolves once the broker has acknowledged it.
#[async_trait]
pub trait OrderedTransport: Send + Sync {
    /// Returns the broker-assigned message id.
    async fn publish(&self, message: OutboundMessage) -> Result<String, PublishError>;
}

pub struct PubSubPublisher {
    transport: Arc<dyn OrderedTransport>,
    source: SourceMetadata,
    environment: String,
}

impl PubSubPublisher {
    pub fn new(transport: Arc<dyn OrderedTransport>, source: SourceMetadata, environment: &str) -> Self {
        Self { transport, source, environment: environment.to_string() }
    }

    fn base_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("cluster_name".to_string(), self.source.cluster_id.clone());
        if !self.environment.is_empty() {
            attrs.insert("environment".to_string(), self.environment.clone());
        }
        attrs
    }

    fn workload_message(&self, update: &WorkloadUpdateEvent) -> Result<(OutboundMessage, String), PublishError> {
        let event = AgentEventPayload::from_update(update, &self.source, &self.environment);
        let mut attributes = self.base_attributes();
        attributes.insert("namespace".to_string(), update.namespace.clone());
        attributes.insert("workload_name".to_string(), update.name.clone());
        attributes.insert("workload_type".to_string(), update.kind.as_str().to_string());
        attributes.insert("event_type".to_string(), "deployment".to_string());
        attributes.insert("deployment_phase".to_string(), update.phase.as_str().to_string());
        let message = OutboundMessage {
            data: serde_json::to_vec(&event)?,
            attributes,
            ordering_key: self.source.cluster_id.clone(),
        };
        Ok((message, event.event_id))
    }

    fn resource_message(&self, event: &ResourceEvent) -> Result<OutboundMessage, PublishError> {
        let mut attributes = self.base_attributes();
        if !event.resource.namespace.is_empty() {
            attributes.insert("namespace".to_string(), event.resource.namespace.clone());
        }
        attributes.insert("resource_name".to_string(), event.resource.name.clone());
        attributes.insert("resource_type".to_string(), event.resource_type.as_str().to_string());
        attributes.insert("event_type".to_string(), event.event_kind.as_str().to_string());
        Ok(OutboundMessage {
            data: serde_json::to_vec(event)?,
            attributes,
            ordering_key: self.source.cluster_id.clone(),
        })
    }
}

#[async_trait]
impl EventPublisher for PubSubPublisher {
    fn name(&self) -> &'static str { "pubsub" }

    async fn publish(&self, update: &WorkloadUpdateEvent) -> Result<(), PublishError> {
        let (message, event_id) = self.workload_message(update)?;
        let message_id = self.transport.publish(message).await?;
        info!(
            event_id = %event_id,
            message_id = %message_id,
            namespace = %update.namespace,
            name = %update.name,
            phase = %update.phase,
            "event published to pub/sub"
        );
        Ok(())
    }
}

#[async_trait]
impl BatchPublisher for PubSubPublisher {
    fn name(&self) -> &'static str { "pubsub" }

    /// Publishes every event in order; failures are counted, not fatal.
    async fn publish_batch(&self, events: &[ResourceEvent]) -> Result<(), PublishError> {
        let mut failed = 0usize;
        for event in events {
            let outcome = match self.resource_message(event) {
                Ok(message) => self.transport.publish(message).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                failed += 1;
                error!(resource = %event.identity(), event_id = %event.event_id, error = %e, "failed to publish resource event");
            }
        }
        if failed > 0 {
            return Err(PublishError::Partial { failed, total: events.len() });
        }
        debug!(events = events.len(), "resource events published to pub/sub");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage<'a> {
    data: String,
    attributes: &'a BTreeMap<String, String>,
    ordering_key: &'a str,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: [WireMessage<'a>; 1],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

enum Auth {
    None,
    Metadata { token_url: String, cached: Mutex<Option<CachedToken>> },
}

pub struct RestPubSubTransport {
    http: reqwest::Client,
    publish_url: String,
    auth: Auth,
    cancel: CancellationToken,
}

impl RestPubSubTransport {
    /// Emulator when `PUBSUB_EMULATOR_HOST` is set, otherwise `endpoint`
    /// (default [`DEFAULT_PUBSUB_ENDPOINT`]) with metadata-server tokens.
    pub fn from_env(topic: &TopicPath, endpoint: Option<&str>) -> Result<Self, PublishError> {
        match std::env::var("PUBSUB_EMULATOR_HOST") {
            Ok(host) if !host.trim().is_empty() => Self::emulator(&format!("http://{}", host.trim()), topic),
            _ => Self::google(endpoint.unwrap_or(DEFAULT_PUBSUB_ENDPOINT), topic),
        }
    }

    pub fn google(endpoint: &str, topic: &TopicPath) -> Result<Self, PublishError> {
        let auth = Auth::Metadata { token_url: METADATA_TOKEN_URL.to_string(), cached: Mutex::new(None) };
        Self::build(endpoint, topic, auth)
    }

    pub fn emulator(endpoint: &str, topic: &TopicPath) -> Result<Self, PublishError> {
        Self::build(endpoint, topic, Auth::None)
    }

    fn build(endpoint: &str, topic: &TopicPath, auth: Auth) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let publish_url = format!("{}/v1/{topic}:publish", endpoint.trim_end_matches('/'));
        Ok(Self { http, publish_url, auth, cancel: CancellationToken::new() })
    }

    /// Replace the metadata token URL; ignored for the emulator.
    pub fn with_token_url(mut self, url: &str) -> Self {
        if let Auth::Metadata { token_url, .. } = &mut self.auth {
            *token_url = url.to_string();
        }
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn publish_url(&self) -> &str { &self.publish_url }

    async fn bearer(&self) -> Result<Option<String>, PublishError> {
        let Auth::Metadata { token_url, cached } = &self.auth else {
            return Ok(None);
        };
        let mut cached = cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(Some(token.value.clone()));
        }
        let resp = self
            .http
            .get(token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| PublishError::Auth(format!("metadata token request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Auth(format!("metadata token request failed (status={status}): {body}")));
        }
        let token: TokenResponse =
            resp.json().await.map_err(|e| PublishError::Auth(format!("metadata token decode failed: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        *cached = Some(CachedToken { value: token.access_token.clone(), refresh_at: Instant::now() + lifetime });
        Ok(Some(token.access_token))
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, PublishError> {
        let body = PublishRequest {
            messages: [WireMessage {
                data: STANDARD.encode(&message.data),
                attributes: &message.attributes,
                ordering_key: &message.ordering_key,
            }],
        };
        let mut req = self.http.post(&self.publish_url).json(&body);
        if let Some(token) = self.bearer().await? {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Status { endpoint: self.publish_url.clone(), status: status.as_u16(), body });
        }
        let acked: PublishResponse = resp.json().await?;
        acked.message_ids.into_iter().next().ok_or_else(|| PublishError::Status {
            endpoint: self.publish_url.clone(),
            status: status.as_u16(),
            body: "response carried no message id".to_string(),
        })
    }
}

#[async_trait]
impl OrderedTransport for RestPubSubTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<String, PublishError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PublishError::Cancelled),
            acked = self.send(&message) => acked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use rollwatch_core::{Phase, ResourceEventKind, WorkloadKind};

    #[derive(Default)]
    struct Captured {
        messages: StdMutex<Vec<OutboundMessage>>,
        fail_every: Option<usize>,
    }

    #[async_trait]
    impl OrderedTransport for Captured {
        async fn publish(&self, message: OutboundMessage) -> Result<String, PublishError> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(message);
            let n = messages.len();
            match self.fail_every {
                Some(k) if n % k == 0 => Err(PublishError::Cancelled),
                _ => Ok(format!("m{n}")),
            }
        }
    }

    fn publisher(transport: Arc<Captured>) -> PubSubPublisher {
        PubSubPublisher::new(transport, SourceMetadata::new("gcp/p/us-central1/prod", "0.1.0"), "production")
    }

    #[test]
    fn topic_paths() {
        let t = TopicPath::parse("projects/acme/topics/rollouts").unwrap();
        assert_eq!((t.project.as_str(), t.topic.as_str()), ("acme", "rollouts"));
        assert_eq!(t.to_string(), "projects/acme/topics/rollouts");
        for bad in ["rollouts", "projects/acme/subscriptions/x", "projects//topics/x", "projects/a/topics/b/c"] {
            assert!(TopicPath::parse(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn workload_message_is_keyed_by_cluster() {
        let transport = Arc::new(Captured::default());
        let update = WorkloadUpdateEvent {
            name: "api".into(),
            namespace: "shop".into(),
            kind: WorkloadKind::StatefulSet,
            previous_version: "1.0.0".into(),
            current_version: "1.1.0".into(),
            labels: BTreeMap::new(),
            phase: Phase::Success,
            status: None,
        };
        publisher(transport.clone()).publish(&update).await.unwrap();

        let sent = transport.messages.lock().unwrap().remove(0);
        assert_eq!(sent.ordering_key, "gcp/p/us-central1/prod");
        assert_eq!(sent.attributes["workload_type"], "StatefulSet");
        assert_eq!(sent.attributes["deployment_phase"], "success");
        assert_eq!(sent.attributes["environment"], "production");
        let body: serde_json::Value = serde_json::from_slice(&sent.data).unwrap();
        assert_eq!(body["phase"], "COMPLETED");
        assert_eq!(body["revision"]["previous"], "1.0.0");
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let transport = Arc::new(Captured { fail_every: Some(3), ..Default::default() });
        let source = SourceMetadata::new("c1", "t");
        let events: Vec<ResourceEvent> = (0..7)
            .map(|i| ResourceEvent::pod(&source, "shop", &format!("p{i}"), "", Default::default(), ResourceEventKind::Created))
            .collect();
        let err = publisher(transport.clone()).publish_batch(&events).await.unwrap_err();
        assert!(matches!(err, PublishError::Partial { failed: 2, total: 7 }));
        assert_eq!(transport.messages.lock().unwrap().len(), 7);
    }
}
