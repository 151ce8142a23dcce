use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use rollwatch_kubehub::FilterConfig;
use rollwatch_publish::BatchConfig;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StateBackend {
    /// WorkloadRolloutState custom resources in the controller namespace
    Kube,
    /// Local SQLite file
    Sqlite,
    /// Process memory only
    Memory,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "rollwatch", version, about = "Watch workload rollouts and report version and phase changes")]
pub struct Config {
    /// Prometheus listener; `0` disables it
    #[arg(long, env = "ROLLWATCH_METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: String,

    /// Incoming webhook for chat notifications
    #[arg(long, env = "ROLLWATCH_SLACK_WEBHOOK_URL")]
    pub slack_webhook_url: Option<String>,

    /// Control plane ingest endpoint for workload events
    #[arg(long = "controlplane-url", env = "ROLLWATCH_CONTROLPLANE_URL")]
    pub controlplane_url: Option<String>,

    #[arg(long, env = "CLUSTER_ID")]
    pub cluster_id: Option<String>,

    /// Derive the cluster id from cloud metadata when --cluster-id is unset
    #[arg(long, env = "ROLLWATCH_DETECT_CLUSTER_ID", action = ArgAction::SetTrue)]
    pub detect_cluster_id: bool,

    #[arg(long, env = "ROLLWATCH_ENVIRONMENT", default_value = "")]
    pub environment: String,

    /// projects/<project>/topics/<topic>
    #[arg(long, env = "PUBSUB_TOPIC")]
    pub pubsub_topic: Option<String>,

    /// Override the Pub/Sub API base URL
    #[arg(long, env = "ROLLWATCH_PUBSUB_ENDPOINT")]
    pub pubsub_endpoint: Option<String>,

    #[arg(long, env = "ROLLWATCH_TRACK_NODES", action = ArgAction::SetTrue)]
    pub track_nodes: bool,

    #[arg(long, env = "ROLLWATCH_TRACK_PODS", action = ArgAction::SetTrue)]
    pub track_pods: bool,

    /// Comma-separated namespace globs to watch (empty: all)
    #[arg(long, env = "ROLLWATCH_WATCH_NAMESPACES", default_value = "")]
    pub watch_namespaces: String,

    #[arg(long, env = "ROLLWATCH_EXCLUDE_NAMESPACES", default_value = "kube-system,kube-public,kube-node-lease")]
    pub exclude_namespaces: String,

    /// Comma-separated label keys a pod must carry
    #[arg(long, env = "ROLLWATCH_REQUIRE_LABELS", default_value = "")]
    pub require_labels: String,

    /// Comma-separated `key` or `key=value` labels that exclude a pod
    #[arg(long, env = "ROLLWATCH_EXCLUDE_LABELS", default_value = "")]
    pub exclude_labels: String,

    /// Concurrent workload reconcile workers
    #[arg(long, env = "ROLLWATCH_WORKERS", default_value_t = 5)]
    pub workers: usize,

    #[arg(long, env = "POD_NAMESPACE", default_value = "rollwatch-system")]
    pub controller_namespace: String,

    #[arg(long, env = "ROLLWATCH_STATE_BACKEND", value_enum, default_value_t = StateBackend::Kube)]
    pub state_backend: StateBackend,

    /// SQLite file for --state-backend sqlite
    #[arg(long, env = "ROLLWATCH_DB_PATH")]
    pub state_db_path: Option<String>,

    /// `0` disables heartbeats
    #[arg(long, env = "ROLLWATCH_HEARTBEAT_INTERVAL_SECS", default_value_t = 300)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "ROLLWATCH_BATCH_FLUSH_MS", default_value_t = 2000)]
    pub batch_flush_ms: u64,

    #[arg(long, env = "ROLLWATCH_BATCH_MAX_SIZE", default_value_t = 100)]
    pub batch_max_size: usize,

    #[arg(long, env = "ROLLWATCH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        match self.metrics_bind_address.trim() {
            "" | "0" => Ok(None),
            addr => addr.parse().map(Some).with_context(|| format!("invalid --metrics-bind-address {addr:?}")),
        }
    }

    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            watch_namespaces: split_list(&self.watch_namespaces),
            exclude_namespaces: split_list(&self.exclude_namespaces),
            require_labels: split_list(&self.require_labels),
            exclude_labels: split_list(&self.exclude_labels),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig { flush_window: Duration::from_millis(self.batch_flush_ms), max_batch_size: self.batch_max_size }
    }

    pub fn tracks_infrastructure(&self) -> bool { self.track_nodes || self.track_pods }

    /// Sinks that stamp or key messages by cluster id.
    pub fn needs_cluster_identity(&self) -> bool { self.controlplane_url.is_some() || self.pubsub_topic.is_some() }

    /// Explicit id, trimmed; empty counts as unset.
    pub fn explicit_cluster_id(&self) -> Option<String> {
        self.cluster_id.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
    }

    /// Fails when a configured sink needs an identity that could not be found.
    pub fn check_identity(&self, resolved: Option<String>) -> Result<Option<String>> {
        if resolved.is_none() && self.needs_cluster_identity() {
            bail!("a cluster id is required when --controlplane-url or --pubsub-topic is set (use --cluster-id or --detect-cluster-id)");
        }
        Ok(resolved)
    }
}

/// Split a comma-separated flag, trimming items and dropping empty ones.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}
