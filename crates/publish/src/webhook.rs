//! Chat-ops notification through an incoming webhook. Best effort.

use async_trait::async_trait;
use rollwatch_core::WorkloadUpdateEvent;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controlplane::REQUEST_TIMEOUT;
use crate::{EventPublisher, PublishError};

#[derive(Serialize)]
struct Message<'a> {
    text: &'a str,
}

pub struct WebhookPublisher {
    http: reqwest::Client,
    url: String,
    cancel: CancellationToken,
}

impl WebhookPublisher {
    pub fn new(url: &str) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, url: url.to_string(), cancel: CancellationToken::new() })
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn send(&self, text: &str) -> Result<(), PublishError> {
        let req = self.http.post(&self.url).json(&Message { text });
        let resp = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PublishError::Cancelled),
            resp = req.send() => resp?,
        };
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PublishError::Status { endpoint: self.url.clone(), status: status.as_u16(), body })
    }
}

/// One-line summary of an update, e.g.
/// `Deployment shop/api: 1.0.0 -> 1.1.0 (rolling_out)`.
pub fn render_message(update: &WorkloadUpdateEvent) -> String {
    let from = if update.previous_version.is_empty() { "(new)" } else { update.previous_version.as_str() };
    let mut text = format!(
        "{} {}/{}: {} -> {} ({})",
        update.kind, update.namespace, update.name, from, update.current_version, update.phase
    );
    if let Some(status) = &update.status {
        text.push_str(&format!(" [{}] {}", status.reason, status.message));
    }
    text
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    fn name(&self) -> &'static str { "webhook" }

    /// Never fails: delivery problems are logged and dropped.
    async fn publish(&self, update: &WorkloadUpdateEvent) -> Result<(), PublishError> {
        let text = render_message(update);
        match self.send(&text).await {
            Ok(()) => debug!(namespace = %update.namespace, name = %update.name, "webhook notified"),
            Err(e) => warn!(namespace = %update.namespace, name = %update.name, error = %e, "webhook notification failed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use rollwatch_core::{Phase, StatusDetail, WorkloadKind};

    fn update() -> WorkloadUpdateEvent {
        WorkloadUpdateEvent {
            name: "api".into(),
            namespace: "shop".into(),
            kind: WorkloadKind::Deployment,
            previous_version: String::new(),
            current_version: "1.0.0".into(),
            labels: BTreeMap::new(),
            phase: Phase::RollingOut,
            status: None,
        }
    }

    #[test]
    fn first_rollout_message() {
        assert_eq!(render_message(&update()), "Deployment shop/api: (new) -> 1.0.0 (rolling_out)");
    }

    #[test]
    fn failure_message_carries_reason() {
        let mut u = update();
        u.previous_version = "0.9.0".into();
        u.phase = Phase::Failed;
        u.status = Some(StatusDetail { reason: "ProgressDeadlineExceeded".into(), message: "stuck".into() });
        assert_eq!(
            render_message(&u),
            "Deployment shop/api: 0.9.0 -> 1.0.0 (failed) [ProgressDeadlineExceeded] stuck"
        );
    }
}
