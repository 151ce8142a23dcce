//! `rollwatch_app_version`: one series per workload.
//!
//! The metrics facade cannot unregister a series, so this gauge lives outside
//! the recorder. The table is the only source of the exposition block served
//! next to the exporter output; replacing or removing an entry drops the old
//! label set from the next scrape.

use std::fmt::Write as _;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use rollwatch_core::WorkloadKey;
use rustc_hash::FxHashMap;

pub const APP_VERSION_METRIC: &str = "rollwatch_app_version";
const APP_VERSION_HELP: &str = "App version for a given workload (Deployment, StatefulSet, DaemonSet)";

static GLOBAL: Lazy<VersionGauge> = Lazy::new(VersionGauge::default);

/// Varying labels of the live series for one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSeries {
    pub previous_version: String,
    pub current_version: String,
    pub last_updated: String,
}

impl VersionSeries {
    fn write_line(&self, key: &WorkloadKey, out: &mut String) {
        let labels = [
            ("namespace", key.namespace.as_str()),
            ("workload", key.name.as_str()),
            ("kind", key.kind.as_str()),
            ("previous_version", self.previous_version.as_str()),
            ("current_version", self.current_version.as_str()),
            ("last_updated", self.last_updated.as_str()),
        ];
        out.push_str(APP_VERSION_METRIC);
        out.push('{');
        for (i, (name, value)) in labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{name}=\"{}\"", escape_label(value));
        }
        out.push_str("} 1\n");
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[derive(Debug, Default)]
pub struct VersionGauge {
    live: RwLock<FxHashMap<WorkloadKey, VersionSeries>>,
}

impl VersionGauge {
    pub fn global() -> &'static VersionGauge { &GLOBAL }

    /// Replace whatever series `key` had with the new label set.
    pub fn refresh(&self, key: &WorkloadKey, previous: &str, current: &str, last_updated: DateTime<Utc>) {
        let next = VersionSeries {
            previous_version: previous.to_string(),
            current_version: current.to_string(),
            last_updated: last_updated.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        self.live.write().unwrap_or_else(PoisonError::into_inner).insert(key.clone(), next);
    }

    pub fn remove(&self, key: &WorkloadKey) {
        self.live.write().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    pub fn series(&self, key: &WorkloadKey) -> Option<VersionSeries> {
        self.live.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn len(&self) -> usize { self.live.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Prometheus text exposition of every live series, sorted by labels.
    /// Empty when no workload is tracked.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = {
            let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
            live.iter()
                .map(|(key, series)| {
                    let mut line = String::new();
                    series.write_line(key, &mut line);
                    line
                })
                .collect()
        };
        if lines.is_empty() {
            return String::new();
        }
        lines.sort_unstable();
        let mut out = format!("# HELP {APP_VERSION_METRIC} {APP_VERSION_HELP}\n# TYPE {APP_VERSION_METRIC} gauge\n");
        lines.iter().for_each(|l| out.push_str(l));
        out
    }
}
