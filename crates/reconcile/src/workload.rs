//! Rollout phase state machine for Deployments, StatefulSets and DaemonSets.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rollwatch_core::{Phase, StatusDetail, VersionState, WorkloadKey, WorkloadUpdateEvent};
use rollwatch_kubehub::{ResourceFilter, WorkloadSnapshot};
use rollwatch_persist::{PersistedRolloutRecord, RolloutStore};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gauge::VersionGauge;

/// A workload still rolling out after this long is reported as failed.
pub const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Re-check interval while a workload is rolling out.
pub const ROLLING_OUT_REQUEUE: Duration = Duration::from_secs(60);

/// Last phase sent downstream for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SentPhase {
    phase: Phase,
    sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct WorkloadState {
    versions: FxHashMap<WorkloadKey, VersionState>,
    phases: FxHashMap<WorkloadKey, SentPhase>,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    /// `None` when the workload was skipped (filtered or unversioned).
    pub phase: Option<Phase>,
    pub emitted: bool,
    pub requeue_after: Option<Duration>,
}

impl PassOutcome {
    const SKIPPED: PassOutcome = PassOutcome { phase: None, emitted: false, requeue_after: None };

    fn resolved(phase: Phase, emitted: bool) -> Self {
        Self { phase: Some(phase), emitted, requeue_after: (phase == Phase::RollingOut).then_some(ROLLING_OUT_REQUEUE) }
    }
}

pub struct WorkloadReconciler {
    store: Arc<dyn RolloutStore>,
    events: mpsc::Sender<WorkloadUpdateEvent>,
    filter: Arc<ResourceFilter>,
    gauge: &'static VersionGauge,
    cancel: CancellationToken,
    state: RwLock<WorkloadState>,
}

impl WorkloadReconciler {
    pub fn new(store: Arc<dyn RolloutStore>, events: mpsc::Sender<WorkloadUpdateEvent>, cancel: CancellationToken) -> Self {
        Self {
            store,
            events,
            filter: Arc::new(ResourceFilter::allow_all()),
            gauge: VersionGauge::global(),
            cancel,
            state: RwLock::new(WorkloadState::default()),
        }
    }

    pub fn with_filter(mut self, filter: Arc<ResourceFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_gauge(mut self, gauge: &'static VersionGauge) -> Self {
        self.gauge = gauge;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, WorkloadState> { self.state.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, WorkloadState> { self.state.write().unwrap_or_else(PoisonError::into_inner) }

    pub fn version_state(&self, key: &WorkloadKey) -> Option<VersionState> { self.read().versions.get(key).cloned() }
    pub fn last_sent_phase(&self, key: &WorkloadKey) -> Option<Phase> { self.read().phases.get(key).map(|p| p.phase) }
    pub fn tracked(&self) -> usize { self.read().versions.len() }

    pub async fn reconcile(&self, snap: &dyn WorkloadSnapshot) -> PassOutcome { self.reconcile_at(snap, Utc::now()).await }

    /// One pass at wall-clock time `now`.
    pub async fn reconcile_at(&self, snap: &dyn WorkloadSnapshot, now: DateTime<Utc>) -> PassOutcome {
        let started = Instant::now();
        let key = snap.key();
        let outcome = self.pass(&key, snap, now).await;
        histogram!("rollwatch_reconcile_duration_ms", "kind" => key.kind.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn pass(&self, key: &WorkloadKey, snap: &dyn WorkloadSnapshot, now: DateTime<Utc>) -> PassOutcome {
        if !self.filter.should_watch_namespace(&key.namespace) {
            return PassOutcome::SKIPPED;
        }
        let version = snap.version();
        if version.is_empty() {
            debug!(namespace = %key.namespace, name = %key.name, kind = %key.kind, "version label not found; skipping");
            counter!("rollwatch_reconcile_unversioned_total", "kind" => key.kind.as_str()).increment(1);
            return PassOutcome::SKIPPED;
        }

        let (stored, last_sent) = {
            let st = self.read();
            (st.versions.get(key).cloned(), st.phases.get(key).copied())
        };
        let mut loaded: Option<PersistedRolloutRecord> = None;
        let (mut state, last_sent) = match stored {
            Some(state) => (state, last_sent),
            None => match self.store.get(key).await {
                Ok(Some(rec)) => {
                    let state = restore(&rec, version);
                    let sent = rec.last_sent_phase.map(|phase| SentPhase { phase, sent_at: rec.last_sent_at.unwrap_or(now) });
                    debug!(workload = %key, version = %rec.last_sent_version, "rollout record loaded");
                    loaded = Some(rec);
                    (state, sent)
                }
                Ok(None) => (VersionState::default(), None),
                Err(e) => {
                    warn!(workload = %key, error = %e, "failed to load rollout record; continuing from memory");
                    counter!("rollwatch_persist_failures_total", "op" => "get").increment(1);
                    (VersionState::default(), None)
                }
            },
        };

        if !state.current_version.is_empty() && state.current_version != version {
            state.rollout_started = None;
        }

        let (phase, status, timer_started) = resolve_phase(snap, &mut state, now);
        let timer_cleared = !snap.is_rolling_out() && state.rollout_started.take().is_some();
        if timer_started {
            info!(workload = %key, version, "rollout started");
        }
        if timer_cleared {
            info!(workload = %key, version, phase = %phase, "rollout finished");
        }

        if let Some(rec) = loaded.as_ref().filter(|r| r.last_sent_version == version && r.last_sent_phase == Some(phase)) {
            info!(workload = %key, version, phase = %phase, "skipping duplicate event after restart");
            counter!("rollwatch_events_deduplicated_total", "kind" => key.kind.as_str()).increment(1);
            self.gauge.refresh(key, &state.previous_version, version, state.last_updated.unwrap_or(now));
            let sent = SentPhase { phase, sent_at: rec.last_sent_at.unwrap_or(now) };
            self.remember(key, &state, Some(sent));
            if timer_started || timer_cleared {
                self.persist(key, &state, version, Some(sent)).await;
            }
            return PassOutcome::resolved(phase, false);
        }

        let version_changed = state.current_version != version;
        let phase_changed = last_sent.map(|s| s.phase) != Some(phase);
        if !(version_changed || phase_changed) {
            if timer_started || timer_cleared {
                self.remember(key, &state, last_sent);
                self.persist(key, &state, version, last_sent).await;
            }
            return PassOutcome::resolved(phase, false);
        }

        if version_changed {
            state.previous_version = std::mem::replace(&mut state.current_version, version.to_string());
            state.last_updated = Some(now);
            self.gauge.refresh(key, &state.previous_version, version, now);
        }
        let sent = SentPhase { phase, sent_at: now };
        self.remember(key, &state, Some(sent));
        self.persist(key, &state, version, Some(sent)).await;

        let event = WorkloadUpdateEvent {
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            kind: key.kind,
            previous_version: state.previous_version.clone(),
            current_version: version.to_string(),
            labels: snap.labels().clone(),
            phase,
            status,
        };
        let emitted = self.emit(event).await;
        if emitted {
            match (version_changed, last_sent) {
                (true, _) => info!(workload = %key, previous = %state.previous_version, version, phase = %phase, "workload version updated"),
                (false, Some(prev)) => info!(workload = %key, version, from = %prev.phase, to = %phase, "workload phase updated"),
                (false, None) => info!(workload = %key, version, phase = %phase, "workload phase updated"),
            }
        }
        PassOutcome::resolved(phase, emitted)
    }

    fn remember(&self, key: &WorkloadKey, state: &VersionState, sent: Option<SentPhase>) {
        let mut st = self.write();
        st.versions.insert(key.clone(), state.clone());
        match sent {
            Some(sent) => st.phases.insert(key.clone(), sent),
            None => st.phases.remove(key),
        };
    }

    async fn persist(&self, key: &WorkloadKey, state: &VersionState, version: &str, sent: Option<SentPhase>) {
        let record = PersistedRolloutRecord {
            rollout_started: state.rollout_started,
            version: version.to_string(),
            previous_version: state.previous_version.clone(),
            last_sent_version: state.current_version.clone(),
            last_sent_phase: sent.map(|s| s.phase),
            last_sent_at: sent.map(|s| s.sent_at),
        };
        if let Err(e) = self.store.upsert(key, &record).await {
            warn!(workload = %key, error = %e, "failed to persist rollout record");
            counter!("rollwatch_persist_failures_total", "op" => "upsert").increment(1);
        }
    }

    /// Blocking hand-off to the event queue; gives up only on shutdown.
    async fn emit(&self, event: WorkloadUpdateEvent) -> bool {
        let kind = event.kind.as_str();
        tokio::select! {
            biased;
            res = self.events.send(event) => match res {
                Ok(()) => {
                    counter!("rollwatch_events_emitted_total", "kind" => kind).increment(1);
                    true
                }
                Err(_) => {
                    warn!(kind, "event queue closed; update dropped");
                    false
                }
            },
            _ = self.cancel.cancelled() => {
                debug!(kind, "shutdown while waiting for event queue");
                false
            }
        }
    }

    /// The workload is gone: drop its record, its memory and its gauge series.
    pub async fn handle_deletion(&self, key: &WorkloadKey) {
        if !self.filter.should_watch_namespace(&key.namespace) {
            return;
        }
        info!(workload = %key, "workload deleted; cleaning up state");
        if let Err(e) = self.store.delete(key).await {
            warn!(workload = %key, error = %e, "failed to delete rollout record");
            counter!("rollwatch_persist_failures_total", "op" => "delete").increment(1);
        }
        {
            let mut st = self.write();
            st.versions.remove(key);
            st.phases.remove(key);
        }
        self.gauge.remove(key);
    }
}

/// Rebuild memory from a record. The timer only carries over for the version it was started for.
fn restore(rec: &PersistedRolloutRecord, version: &str) -> VersionState {
    VersionState {
        previous_version: rec.previous_version.clone(),
        current_version: rec.last_sent_version.clone(),
        last_updated: rec.last_sent_at,
        rollout_started: rec.rollout_started.filter(|_| rec.version == version),
    }
}

/// Classify the snapshot, starting the rollout timer if needed. Returns the
/// phase, failure detail, and whether the timer was started by this call.
fn resolve_phase(snap: &dyn WorkloadSnapshot, state: &mut VersionState, now: DateTime<Utc>) -> (Phase, Option<StatusDetail>, bool) {
    if snap.has_failed() {
        return (Phase::Failed, snap.failure(), false);
    }
    if snap.is_rolling_out() {
        let timer_started = state.rollout_started.is_none();
        let started = *state.rollout_started.get_or_insert(now);
        let timed_out = (now - started).to_std().is_ok_and(|elapsed| elapsed >= ROLLOUT_TIMEOUT);
        if timed_out {
            let status = StatusDetail {
                reason: "RolloutTimeout".to_string(),
                message: format!("rollout did not complete within {} minutes", ROLLOUT_TIMEOUT.as_secs() / 60),
            };
            return (Phase::Failed, Some(status), timer_started);
        }
        return (Phase::RollingOut, None, timer_started);
    }
    let total = snap.total_replicas();
    if snap.ready_replicas() == total && snap.updated_replicas() == total {
        (Phase::Success, None, false)
    } else {
        (Phase::Progressing, None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollwatch_kubehub::workload::fixtures::{deployment, statefulset, with_progress_condition};
    use rollwatch_kubehub::WorkloadObject;

    fn t(s: &str) -> DateTime<Utc> { s.parse().unwrap() }

    #[test]
    fn native_failure_wins_over_rolling_out() {
        let snap = with_progress_condition(deployment("ns", "a", Some("1"), 3, 1, 1), "False", "ProgressDeadlineExceeded")
            .into_snapshot();
        let mut state = VersionState::default();
        let (phase, status, started) = resolve_phase(snap.as_ref(), &mut state, Utc::now());
        assert_eq!(phase, Phase::Failed);
        assert_eq!(status.unwrap().reason, "ProgressDeadlineExceeded");
        assert!(!started);
        assert!(state.rollout_started.is_none());
    }

    #[test]
    fn timer_starts_once_and_times_out_at_the_boundary() {
        let snap = deployment("ns", "a", Some("1"), 3, 1, 3).into_snapshot();
        let mut state = VersionState::default();
        let t0 = t("2024-05-01T10:00:00Z");
        assert_eq!(resolve_phase(snap.as_ref(), &mut state, t0).0, Phase::RollingOut);
        assert_eq!(state.rollout_started, Some(t0));

        let almost = t0 + chrono::Duration::seconds(15 * 60 - 1);
        let (phase, _, started) = resolve_phase(snap.as_ref(), &mut state, almost);
        assert_eq!((phase, started), (Phase::RollingOut, false));

        let (phase, status, _) = resolve_phase(snap.as_ref(), &mut state, t0 + chrono::Duration::minutes(15));
        assert_eq!(phase, Phase::Failed);
        assert_eq!(status.unwrap().reason, "RolloutTimeout");
        assert_eq!(state.rollout_started, Some(t0));
    }

    #[test]
    fn converged_and_partially_ready_phases() {
        let mut state = VersionState::default();
        let done = statefulset("ns", "db", Some("1"), Some(2), 2, 2).into_snapshot();
        assert_eq!(resolve_phase(done.as_ref(), &mut state, Utc::now()).0, Phase::Success);
        // No declared replicas: never rolling out, but counters disagree.
        let odd = statefulset("ns", "db", Some("1"), None, 1, 0).into_snapshot();
        assert_eq!(resolve_phase(odd.as_ref(), &mut state, Utc::now()).0, Phase::Progressing);
    }

    #[test]
    fn restore_keeps_timer_only_for_matching_version() {
        let rec = PersistedRolloutRecord {
            rollout_started: Some(t("2024-05-01T10:00:00Z")),
            version: "2".into(),
            previous_version: "1".into(),
            last_sent_version: "2".into(),
            last_sent_phase: Some(Phase::RollingOut),
            last_sent_at: None,
        };
        assert!(restore(&rec, "2").rollout_started.is_some());
        let stale = restore(&rec, "3");
        assert!(stale.rollout_started.is_none());
        assert_eq!(stale.current_version, "2");
        assert_eq!(stale.previous_version, "1");
    }
}
