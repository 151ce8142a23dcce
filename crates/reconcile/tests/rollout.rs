#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollwatch_core::{Phase, WorkloadKey, WorkloadKind, WorkloadUpdateEvent};
use rollwatch_kubehub::workload::fixtures::{daemonset, deployment, statefulset};
use rollwatch_kubehub::{FilterConfig, ResourceFilter, WorkloadObject};
use rollwatch_persist::{MemoryRolloutStore, PersistError, PersistedRolloutRecord, RolloutStore};
use rollwatch_reconcile::{VersionGauge, WorkloadController, WorkloadReconciler, ROLLING_OUT_REQUEUE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    reconciler: WorkloadReconciler,
    events: mpsc::Receiver<WorkloadUpdateEvent>,
    store: Arc<MemoryRolloutStore>,
    gauge: &'static VersionGauge,
}

fn harness_with(store: Arc<MemoryRolloutStore>) -> Harness {
    let (tx, events) = mpsc::channel(100);
    let gauge: &'static VersionGauge = Box::leak(Box::new(VersionGauge::default()));
    let reconciler = WorkloadReconciler::new(store.clone(), tx, CancellationToken::new()).with_gauge(gauge);
    Harness { reconciler, events, store, gauge }
}

fn harness() -> Harness { harness_with(Arc::new(MemoryRolloutStore::new())) }

fn drain(rx: &mut mpsc::Receiver<WorkloadUpdateEvent>) -> Vec<WorkloadUpdateEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn at(s: &str) -> DateTime<Utc> { s.parse().unwrap() }

fn api_key() -> WorkloadKey { WorkloadKey::new("shop", "api", WorkloadKind::Deployment) }

#[tokio::test]
async fn unversioned_workloads_leave_no_trace() {
    let mut h = harness();
    let snaps = [
        deployment("shop", "api", None, 3, 1, 3).into_snapshot(),
        statefulset("shop", "db", None, Some(3), 1, 1).into_snapshot(),
        daemonset("shop", "agent", None, 4, 4, 4).into_snapshot(),
    ];
    for snap in &snaps {
        let out = h.reconciler.reconcile(snap.as_ref()).await;
        assert_eq!(out.phase, None);
        assert!(!out.emitted);
        assert!(h.reconciler.version_state(&snap.key()).is_none());
    }
    assert!(drain(&mut h.events).is_empty());
    assert!(h.store.is_empty());
    assert!(h.gauge.is_empty());
    assert_eq!(h.reconciler.tracked(), 0);
}

#[tokio::test]
async fn labelled_deployment_rolls_out_then_succeeds() {
    let mut h = harness();
    let t0 = at("2024-05-01T10:00:00Z");

    let unlabelled = deployment("shop", "api", None, 3, 1, 3).into_snapshot();
    h.reconciler.reconcile_at(unlabelled.as_ref(), t0).await;
    assert!(drain(&mut h.events).is_empty());
    assert!(h.store.is_empty());

    let rolling = deployment("shop", "api", Some("1.0.0"), 3, 1, 3).into_snapshot();
    let out = h.reconciler.reconcile_at(rolling.as_ref(), t0).await;
    assert_eq!(out.phase, Some(Phase::RollingOut));
    assert_eq!(out.requeue_after, Some(ROLLING_OUT_REQUEUE));
    let events = drain(&mut h.events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, Phase::RollingOut);
    assert_eq!(events[0].previous_version, "");
    assert_eq!(events[0].current_version, "1.0.0");
    assert_eq!(events[0].labels.get("app.kubernetes.io/version").map(String::as_str), Some("1.0.0"));
    assert_eq!(h.store.peek(&api_key()).unwrap().rollout_started, Some(t0));

    let ready = deployment("shop", "api", Some("1.0.0"), 3, 3, 3).into_snapshot();
    let out = h.reconciler.reconcile_at(ready.as_ref(), t0 + chrono::Duration::minutes(2)).await;
    assert_eq!(out.phase, Some(Phase::Success));
    assert_eq!(out.requeue_after, None);
    let events = drain(&mut h.events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, Phase::Success);
    assert_eq!((events[0].previous_version.as_str(), events[0].current_version.as_str()), ("", "1.0.0"));

    let rec = h.store.peek(&api_key()).unwrap();
    assert_eq!(rec.rollout_started, None);
    assert_eq!(rec.last_sent_phase, Some(Phase::Success));
    assert_eq!(rec.last_sent_version, "1.0.0");
}

#[tokio::test]
async fn identical_pass_is_not_reemitted() {
    let mut h = harness();
    let snap = deployment("shop", "api", Some("1.0.0"), 3, 3, 3).into_snapshot();
    assert!(h.reconciler.reconcile(snap.as_ref()).await.emitted);
    for _ in 0..3 {
        let out = h.reconciler.reconcile(snap.as_ref()).await;
        assert_eq!(out.phase, Some(Phase::Success));
        assert!(!out.emitted);
    }
    assert_eq!(drain(&mut h.events).len(), 1);
}

#[tokio::test]
async fn version_bump_reports_previous_version() {
    let mut h = harness();
    let v1 = deployment("shop", "api", Some("1.0.0"), 2, 2, 2).into_snapshot();
    let v2 = deployment("shop", "api", Some("1.1.0"), 2, 1, 1).into_snapshot();
    h.reconciler.reconcile(v1.as_ref()).await;
    h.reconciler.reconcile(v2.as_ref()).await;
    let events = drain(&mut h.events);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].previous_version, "1.0.0");
    assert_eq!(events[1].current_version, "1.1.0");
    assert_eq!(events[1].phase, Phase::RollingOut);
    let state = h.reconciler.version_state(&api_key()).unwrap();
    assert_eq!((state.previous_version.as_str(), state.current_version.as_str()), ("1.0.0", "1.1.0"));
}

#[tokio::test]
async fn rollout_times_out_at_fifteen_minutes() {
    let mut h = harness();
    let t0 = at("2024-05-01T10:00:00Z");
    let snap = deployment("shop", "api", Some("2.0.0"), 3, 1, 3).into_snapshot();

    assert_eq!(h.reconciler.reconcile_at(snap.as_ref(), t0).await.phase, Some(Phase::RollingOut));
    for minute in 1..15 {
        let out = h.reconciler.reconcile_at(snap.as_ref(), t0 + chrono::Duration::minutes(minute)).await;
        assert_eq!(out.phase, Some(Phase::RollingOut), "minute {minute}");
        assert!(!out.emitted);
    }
    let just_before = t0 + chrono::Duration::seconds(15 * 60 - 1);
    assert_eq!(h.reconciler.reconcile_at(snap.as_ref(), just_before).await.phase, Some(Phase::RollingOut));

    let out = h.reconciler.reconcile_at(snap.as_ref(), t0 + chrono::Duration::minutes(15)).await;
    assert_eq!(out.phase, Some(Phase::Failed));
    assert!(out.emitted);
    assert_eq!(out.requeue_after, None);

    let events = drain(&mut h.events);
    let phases: Vec<_> = events.iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![Phase::RollingOut, Phase::Failed]);
    assert_eq!(events[1].status.as_ref().unwrap().reason, "RolloutTimeout");

    // Still stuck: stays failed, nothing new.
    let out = h.reconciler.reconcile_at(snap.as_ref(), t0 + chrono::Duration::minutes(20)).await;
    assert_eq!(out.phase, Some(Phase::Failed));
    assert!(!out.emitted);
}

#[tokio::test]
async fn new_version_restarts_the_rollout_timer() {
    let h = harness();
    let t0 = at("2024-05-01T10:00:00Z");
    let v1 = deployment("shop", "api", Some("1"), 3, 1, 3).into_snapshot();
    let v2 = deployment("shop", "api", Some("2"), 3, 1, 1).into_snapshot();
    h.reconciler.reconcile_at(v1.as_ref(), t0).await;
    let later = t0 + chrono::Duration::minutes(14);
    assert_eq!(h.reconciler.reconcile_at(v2.as_ref(), later).await.phase, Some(Phase::RollingOut));
    assert_eq!(h.reconciler.version_state(&api_key()).unwrap().rollout_started, Some(later));
    let out = h.reconciler.reconcile_at(v2.as_ref(), t0 + chrono::Duration::minutes(16)).await;
    assert_eq!(out.phase, Some(Phase::RollingOut));
}

#[tokio::test]
async fn restart_with_matching_record_suppresses_replay() {
    let store = Arc::new(MemoryRolloutStore::new());
    let sent_at = at("2024-05-01T09:00:00Z");
    store
        .upsert(
            &api_key(),
            &PersistedRolloutRecord {
                rollout_started: None,
                version: "1.2.0".into(),
                previous_version: "1.1.0".into(),
                last_sent_version: "1.2.0".into(),
                last_sent_phase: Some(Phase::Success),
                last_sent_at: Some(sent_at),
            },
        )
        .await
        .unwrap();

    let mut h = harness_with(store);
    let snap = deployment("shop", "api", Some("1.2.0"), 2, 2, 2).into_snapshot();
    let out = h.reconciler.reconcile(snap.as_ref()).await;
    assert_eq!(out.phase, Some(Phase::Success));
    assert!(!out.emitted);
    assert!(drain(&mut h.events).is_empty());

    let series = h.gauge.series(&api_key()).expect("gauge refreshed on dedup");
    assert_eq!((series.previous_version.as_str(), series.current_version.as_str()), ("1.1.0", "1.2.0"));
    assert_eq!(h.reconciler.last_sent_phase(&api_key()), Some(Phase::Success));

    // A genuine change afterwards is still detected.
    let bumped = deployment("shop", "api", Some("1.3.0"), 2, 1, 1).into_snapshot();
    assert!(h.reconciler.reconcile(bumped.as_ref()).await.emitted);
    let events = drain(&mut h.events);
    assert_eq!(events[0].previous_version, "1.2.0");
}

#[tokio::test]
async fn restart_mid_rollout_keeps_the_original_timer() {
    let store = Arc::new(MemoryRolloutStore::new());
    let t0 = at("2024-05-01T10:00:00Z");
    store
        .upsert(
            &api_key(),
            &PersistedRolloutRecord {
                rollout_started: Some(t0),
                version: "3.0.0".into(),
                previous_version: "2.0.0".into(),
                last_sent_version: "3.0.0".into(),
                last_sent_phase: Some(Phase::RollingOut),
                last_sent_at: Some(t0),
            },
        )
        .await
        .unwrap();
    let mut h = harness_with(store);
    let snap = deployment("shop", "api", Some("3.0.0"), 3, 1, 3).into_snapshot();

    let out = h.reconciler.reconcile_at(snap.as_ref(), t0 + chrono::Duration::minutes(5)).await;
    assert_eq!((out.phase, out.emitted), (Some(Phase::RollingOut), false));

    let out = h.reconciler.reconcile_at(snap.as_ref(), t0 + chrono::Duration::minutes(15)).await;
    assert_eq!((out.phase, out.emitted), (Some(Phase::Failed), true));
    assert_eq!(drain(&mut h.events)[0].previous_version, "2.0.0");
}

#[tokio::test]
async fn stale_timer_of_another_version_is_ignored() {
    let store = Arc::new(MemoryRolloutStore::new());
    let old = at("2024-05-01T08:00:00Z");
    store
        .upsert(
            &api_key(),
            &PersistedRolloutRecord {
                rollout_started: Some(old),
                version: "1".into(),
                last_sent_version: "1".into(),
                last_sent_phase: Some(Phase::RollingOut),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let h = harness_with(store);
    let now = at("2024-05-01T12:00:00Z");
    let snap = deployment("shop", "api", Some("2"), 3, 1, 1).into_snapshot();
    let out = h.reconciler.reconcile_at(snap.as_ref(), now).await;
    assert_eq!(out.phase, Some(Phase::RollingOut));
    assert_eq!(h.store.peek(&api_key()).unwrap().rollout_started, Some(now));
}

#[tokio::test]
async fn finishing_a_rollout_clears_the_persisted_timer() {
    let store = Arc::new(MemoryRolloutStore::new());
    let t0 = at("2024-05-01T10:00:00Z");
    // Last send was already `success` but the timer was left behind.
    store
        .upsert(
            &api_key(),
            &PersistedRolloutRecord {
                rollout_started: Some(t0),
                version: "1".into(),
                last_sent_version: "1".into(),
                last_sent_phase: Some(Phase::Success),
                last_sent_at: Some(t0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut h = harness_with(store);
    let snap = deployment("shop", "api", Some("1"), 2, 2, 2).into_snapshot();
    assert!(!h.reconciler.reconcile(snap.as_ref()).await.emitted);
    assert!(drain(&mut h.events).is_empty());
    assert_eq!(h.store.peek(&api_key()).unwrap().rollout_started, None);
}

struct BrokenStore {
    calls: AtomicUsize,
}

#[async_trait]
impl RolloutStore for BrokenStore {
    async fn get(&self, _: &WorkloadKey) -> Result<Option<PersistedRolloutRecord>, PersistError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PersistError::Task("unavailable".into()))
    }
    async fn upsert(&self, _: &WorkloadKey, _: &PersistedRolloutRecord) -> Result<(), PersistError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PersistError::Task("unavailable".into()))
    }
    async fn delete(&self, _: &WorkloadKey) -> Result<(), PersistError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PersistError::Task("unavailable".into()))
    }
}

#[tokio::test]
async fn store_failures_do_not_stop_the_pass() {
    let store = Arc::new(BrokenStore { calls: AtomicUsize::new(0) });
    let (tx, mut rx) = mpsc::channel(10);
    let gauge: &'static VersionGauge = Box::leak(Box::new(VersionGauge::default()));
    let r = WorkloadReconciler::new(store.clone(), tx, CancellationToken::new()).with_gauge(gauge);

    let rolling = deployment("shop", "api", Some("1"), 2, 1, 2).into_snapshot();
    let done = deployment("shop", "api", Some("1"), 2, 2, 2).into_snapshot();
    assert!(r.reconcile(rolling.as_ref()).await.emitted);
    assert!(r.reconcile(done.as_ref()).await.emitted);
    assert_eq!(r.last_sent_phase(&api_key()), Some(Phase::Success));
    assert_eq!(drain(&mut rx).len(), 2);

    r.handle_deletion(&api_key()).await;
    assert_eq!(r.tracked(), 0);
    assert!(store.calls.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn gauge_keeps_one_series_across_versions() {
    let h = harness();
    for v in 1..=6 {
        let snap = deployment("shop", "api", Some(format!("1.{v}").as_str()), 1, 1, 1).into_snapshot();
        h.reconciler.reconcile(snap.as_ref()).await;
        assert_eq!(h.gauge.len(), 1);
        assert_eq!(h.gauge.series(&api_key()).unwrap().current_version, format!("1.{v}"));
        let rendered = h.gauge.render();
        let lines: Vec<_> = rendered.lines().filter(|l| l.contains("workload=\"api\"")).collect();
        assert_eq!(lines.len(), 1, "{rendered}");
        assert!(lines[0].contains(&format!("current_version=\"1.{v}\"")));
    }
}

#[tokio::test]
async fn deletion_drops_record_memory_and_series() {
    let h = harness();
    let snap = deployment("shop", "api", Some("1"), 1, 1, 1).into_snapshot();
    h.reconciler.reconcile(snap.as_ref()).await;
    assert!(h.store.peek(&api_key()).is_some());

    h.reconciler.handle_deletion(&api_key()).await;
    assert!(h.store.peek(&api_key()).is_none());
    assert!(h.reconciler.version_state(&api_key()).is_none());
    assert!(h.gauge.series(&api_key()).is_none());
    assert!(h.gauge.render().is_empty());
}

#[tokio::test]
async fn excluded_namespaces_are_skipped() {
    let (tx, mut rx) = mpsc::channel(10);
    let filter = ResourceFilter::new(FilterConfig { exclude_namespaces: vec!["kube-system".into()], ..Default::default() });
    let r = WorkloadReconciler::new(Arc::new(MemoryRolloutStore::new()), tx, CancellationToken::new())
        .with_filter(Arc::new(filter))
        .with_gauge(Box::leak(Box::new(VersionGauge::default())));
    let snap = deployment("kube-system", "dns", Some("1"), 1, 1, 1).into_snapshot();
    assert_eq!(r.reconcile(snap.as_ref()).await.phase, None);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn full_event_queue_blocks_the_pass() {
    let (tx, mut rx) = mpsc::channel(1);
    let r = Arc::new(
        WorkloadReconciler::new(Arc::new(MemoryRolloutStore::new()), tx, CancellationToken::new())
            .with_gauge(Box::leak(Box::new(VersionGauge::default()))),
    );
    let first = deployment("shop", "a", Some("1"), 1, 1, 1).into_snapshot();
    assert!(r.reconcile(first.as_ref()).await.emitted);

    let pass = {
        let r = r.clone();
        tokio::spawn(async move {
            let second = deployment("shop", "b", Some("1"), 1, 1, 1).into_snapshot();
            r.reconcile(second.as_ref()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pass.is_finished());
    assert_eq!(rx.recv().await.unwrap().name, "a");
    assert!(pass.await.unwrap().emitted);
    assert_eq!(rx.recv().await.unwrap().name, "b");
}

#[tokio::test]
async fn shutdown_releases_a_blocked_pass() {
    let (tx, _rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let r = WorkloadReconciler::new(Arc::new(MemoryRolloutStore::new()), tx, cancel.clone())
        .with_gauge(Box::leak(Box::new(VersionGauge::default())));
    let first = deployment("shop", "a", Some("1"), 1, 1, 1).into_snapshot();
    r.reconcile(first.as_ref()).await;

    cancel.cancel();
    let second = deployment("shop", "b", Some("1"), 1, 1, 1).into_snapshot();
    let out = tokio::time::timeout(Duration::from_secs(1), r.reconcile(second.as_ref())).await.unwrap();
    assert!(!out.emitted);
}

#[tokio::test]
async fn controller_step_reconciles_cached_and_cleans_up_missing() {
    let store = Arc::new(MemoryRolloutStore::new());
    let (tx, mut rx) = mpsc::channel(10);
    let reconciler = WorkloadReconciler::new(store.clone(), tx, CancellationToken::new())
        .with_gauge(Box::leak(Box::new(VersionGauge::default())));
    let ctl = WorkloadController::new(Arc::new(reconciler));

    ctl.cache().apply(deployment("shop", "api", Some("1"), 3, 1, 3).into_snapshot());
    assert_eq!(ctl.process(api_key()).await, Some(ROLLING_OUT_REQUEUE));
    assert_eq!(drain(&mut rx).len(), 1);
    assert!(store.peek(&api_key()).is_some());

    ctl.cache().remove(&api_key());
    assert_eq!(ctl.process(api_key()).await, None);
    assert!(store.peek(&api_key()).is_none());
}
