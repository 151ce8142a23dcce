//! rollwatch agent: watches Deployments, StatefulSets and DaemonSets for
//! version-label changes and rollout phase transitions, and reports them to
//! the configured sinks.
#![forbid(unsafe_code)]

mod config;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::Client;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rollwatch_cluster::Resolver;
use rollwatch_core::SourceMetadata;
use rollwatch_kubehub::{KubeInventory, ResourceFilter};
use rollwatch_persist::{ensure_crd, KubeRolloutStore, MemoryRolloutStore, RolloutStore, SqliteRolloutStore};
use rollwatch_publish::{
    event_channel, resource_channel, BatchPublisher, ControlPlanePublisher, EventPublisher, EventPublisherQueue,
    HeartbeatPublisher, HeartbeatSender, PubSubPublisher, ResourceEventBatcher, RestPubSubTransport, TopicPath,
    WebhookPublisher, FINAL_FLUSH_GRACE,
};
use rollwatch_reconcile::{
    run_node_watcher, run_pod_watcher, NodeReconciler, PodReconciler, VersionGauge, WorkloadController,
    WorkloadReconciler,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, LogFormat, StateBackend};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing(format: LogFormat) {
    let env = std::env::var("ROLLWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn init_metrics(cfg: &Config) -> Result<Option<(SocketAddr, PrometheusHandle)>> {
    let Some(sock) = cfg.metrics_addr()? else {
        info!("metrics exporter disabled");
        return Ok(None);
    };
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_metrics();
            Ok(Some((sock, handle)))
        }
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder");
            Ok(None)
        }
    }
}

/// Exporter output followed by the version gauge block.
async fn serve_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    let mut body = handle.render();
    body.push_str(&VersionGauge::global().render());
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4; charset=utf-8")], body)
}

async fn run_metrics_server(sock: SocketAddr, handle: PrometheusHandle, shutdown: CancellationToken) -> Result<()> {
    let router = Router::new().route("/metrics", get(serve_metrics)).with_state(handle);
    let listener = tokio::net::TcpListener::bind(sock).await.with_context(|| format!("binding metrics listener {sock}"))?;
    info!(addr = %sock, "Prometheus metrics exporter listening");
    axum::serve(listener, router).with_graceful_shutdown(async move { shutdown.cancelled().await }).await?;
    Ok(())
}

fn describe_metrics() {
    describe_histogram!("rollwatch_reconcile_duration_ms", "Workload reconciliation pass duration");
    describe_counter!("rollwatch_events_emitted_total", "Workload update events handed to the publisher queue");
    describe_counter!("rollwatch_events_deduplicated_total", "Passes suppressed because the state was already reported");
    describe_counter!("rollwatch_persist_failures_total", "Rollout record reads or writes that failed");
    describe_counter!("rollwatch_resource_events_dropped_total", "Node and pod events dropped at the resource queue");
    describe_counter!("rollwatch_batches_flushed_total", "Resource event batches flushed, by trigger");
    describe_counter!("rollwatch_publish_failures_total", "Failed deliveries, by publisher");
}

/// Cancel `shutdown` now and `abort` once the flush grace period has passed.
fn begin_shutdown(shutdown: &CancellationToken, abort: &CancellationToken) {
    if shutdown.is_cancelled() {
        return;
    }
    shutdown.cancel();
    let abort = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(FINAL_FLUSH_GRACE).await;
        abort.cancel();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn resolve_cluster_id(cfg: &Config) -> Result<Option<String>> {
    if let Some(id) = cfg.explicit_cluster_id() {
        return Ok(Some(id));
    }
    let mut resolved = None;
    if cfg.detect_cluster_id {
        match Resolver::with_defaults()?.resolve().await {
            Ok(info) => resolved = Some(info.cluster_id),
            Err(e) if cfg.needs_cluster_identity() => {
                return Err(e).context("cluster id detection failed");
            }
            Err(e) => warn!(error = %e, "cluster id detection failed; continuing without one"),
        }
    }
    cfg.check_identity(resolved)
}

async fn open_store(cfg: &Config, client: Client) -> Result<Arc<dyn RolloutStore>> {
    let store: Arc<dyn RolloutStore> = match cfg.state_backend {
        StateBackend::Kube => {
            if let Err(e) = ensure_crd(client.clone()).await {
                warn!(error = %e, "could not install WorkloadRolloutState CRD; assuming it is managed externally");
            }
            Arc::new(KubeRolloutStore::new(client, &cfg.controller_namespace))
        }
        StateBackend::Sqlite => {
            let store = match &cfg.state_db_path {
                Some(path) => SqliteRolloutStore::open(path),
                None => SqliteRolloutStore::open_default(),
            };
            Arc::new(store.context("opening rollout state database")?)
        }
        StateBackend::Memory => Arc::new(MemoryRolloutStore::new()),
    };
    info!(backend = ?cfg.state_backend, namespace = %cfg.controller_namespace, "rollout state store ready");
    Ok(store)
}

#[derive(Default)]
struct Sinks {
    events: Vec<Arc<dyn EventPublisher>>,
    batches: Vec<Arc<dyn BatchPublisher>>,
    heartbeats: Vec<Arc<dyn HeartbeatPublisher>>,
}

fn build_sinks(cfg: &Config, source: &SourceMetadata, abort: &CancellationToken) -> Result<Sinks> {
    let mut sinks = Sinks::default();

    if let Some(url) = &cfg.slack_webhook_url {
        sinks.events.push(Arc::new(WebhookPublisher::new(url)?.with_cancel(abort.clone())));
        info!("webhook publisher enabled");
    }

    if let Some(url) = &cfg.controlplane_url {
        let cp = Arc::new(
            ControlPlanePublisher::new(url, source.clone(), &cfg.environment)
                .context("building control plane publisher")?
                .with_cancel(abort.clone()),
        );
        sinks.events.push(cp.clone());
        sinks.batches.push(cp.clone());
        sinks.heartbeats.push(cp);
        info!(endpoint = %url, cluster_id = %source.cluster_id, "control plane publisher enabled");
    }

    if let Some(topic) = &cfg.pubsub_topic {
        let topic = TopicPath::parse(topic)?;
        let transport = RestPubSubTransport::from_env(&topic, cfg.pubsub_endpoint.as_deref())
            .context("building pub/sub transport")?
            .with_cancel(abort.clone());
        let ps = Arc::new(PubSubPublisher::new(Arc::new(transport), source.clone(), &cfg.environment));
        sinks.events.push(ps.clone());
        sinks.batches.push(ps);
        info!(topic = %topic, cluster_id = %source.cluster_id, "pub/sub publisher enabled");
    }

    if sinks.events.is_empty() {
        info!("no event publishers configured; workload versions are only exported as metrics");
    }
    Ok(sinks)
}

fn supervise<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!(task = name, error = %e, "task exited with error");
        }
    })
}

async fn run(cfg: Config, exporter: Option<(SocketAddr, PrometheusHandle)>) -> Result<()> {
    let cluster_id = resolve_cluster_id(&cfg).await?;
    let source = SourceMetadata::new(cluster_id.clone().unwrap_or_default(), AGENT_VERSION);
    let client = Client::try_default().await.context("building kubernetes client")?;

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    {
        let (shutdown, abort) = (shutdown.clone(), abort.clone());
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            begin_shutdown(&shutdown, &abort);
        });
    }

    let store = open_store(&cfg, client.clone()).await?;
    let sinks = build_sinks(&cfg, &source, &abort)?;
    let filter = Arc::new(ResourceFilter::new(cfg.filter_config()));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (event_tx, event_rx) = event_channel();
    tasks.push(tokio::spawn(EventPublisherQueue::new(event_rx, sinks.events).run(shutdown.clone())));

    if let Some((sock, handle)) = exporter {
        tasks.push(supervise("metrics", run_metrics_server(sock, handle, shutdown.clone())));
    }

    if cfg.tracks_infrastructure() {
        let (resource_tx, resource_rx) = resource_channel();
        tasks.push(tokio::spawn(
            ResourceEventBatcher::new(resource_rx, sinks.batches, cfg.batch_config()).run(shutdown.clone()),
        ));
        if cfg.track_nodes {
            let nodes = NodeReconciler::new(source.clone(), resource_tx.clone());
            tasks.push(supervise("node-watcher", run_node_watcher(client.clone(), nodes, shutdown.clone())));
            info!("node reconciler enabled");
        }
        if cfg.track_pods {
            let pods = PodReconciler::new(source.clone(), resource_tx, filter.clone());
            tasks.push(supervise("pod-watcher", run_pod_watcher(client.clone(), pods, shutdown.clone())));
            info!(exclude_namespaces = %cfg.exclude_namespaces, "pod reconciler enabled");
        }
    }

    if cluster_id.is_some() && cfg.heartbeat_interval_secs > 0 && !sinks.heartbeats.is_empty() {
        let sender = HeartbeatSender::new(source.clone(), Arc::new(KubeInventory::new(client.clone())), sinks.heartbeats)
            .with_interval(Duration::from_secs(cfg.heartbeat_interval_secs))
            .tracking(cfg.track_nodes, cfg.track_pods);
        tasks.push(sender.spawn(shutdown.clone()));
    }

    let reconciler = WorkloadReconciler::new(store, event_tx, shutdown.clone()).with_filter(filter);
    let controller = WorkloadController::new(Arc::new(reconciler));
    info!(version = AGENT_VERSION, cluster_id = %source.cluster_id, workers = cfg.workers, "rollwatch started");
    let outcome = controller.run(client, cfg.workers.max(1), shutdown.clone()).await;

    begin_shutdown(&shutdown, &abort);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked");
        }
    }
    info!("rollwatch stopped");
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_tracing(cfg.log_format);
    let exporter = init_metrics(&cfg)?;
    run(cfg, exporter).await
}
