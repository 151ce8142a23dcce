//! Namespace and label gating applied before anything reaches the reconcilers.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;

pub const DEFAULT_EXCLUDED_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    /// Glob patterns (`*`, `?`) of namespaces to watch; empty means all.
    pub watch_namespaces: Vec<String>,
    /// Glob patterns of namespaces to skip. Checked first.
    pub exclude_namespaces: Vec<String>,
    /// Label keys that must be present.
    pub require_labels: Vec<String>,
    /// `key` or `key=value`; a match excludes the resource.
    pub exclude_labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResourceFilter {
    watch: Vec<Regex>,
    exclude: Vec<Regex>,
    require_labels: Vec<String>,
    exclude_labels: Vec<(String, Option<String>)>,
}

impl ResourceFilter {
    pub fn new(cfg: FilterConfig) -> Self {
        Self {
            watch: compile_all(&cfg.watch_namespaces),
            exclude: compile_all(&cfg.exclude_namespaces),
            require_labels: cfg.require_labels,
            exclude_labels: cfg
                .exclude_labels
                .iter()
                .map(|s| match s.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (s.clone(), None),
                })
                .collect(),
        }
    }

    /// Filter that lets everything through.
    pub fn allow_all() -> Self { Self::new(FilterConfig::default()) }

    pub fn should_watch_namespace(&self, namespace: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(namespace)) {
            return false;
        }
        self.watch.is_empty() || self.watch.iter().any(|re| re.is_match(namespace))
    }

    pub fn should_watch_resource(&self, labels: &BTreeMap<String, String>) -> bool {
        if !self.require_labels.iter().all(|k| labels.contains_key(k)) {
            return false;
        }
        !self.exclude_labels.iter().any(|(k, v)| match (labels.get(k), v) {
            (Some(_), None) => true,
            (Some(actual), Some(want)) => actual == want,
            (None, _) => false,
        })
    }
}

/// Translate a shell glob into an anchored regex. `*` and `?` do not cross `/`.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

fn compile_all(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match glob_to_regex(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring invalid namespace pattern");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(watch: &[&str], exclude: &[&str]) -> ResourceFilter {
        ResourceFilter::new(FilterConfig {
            watch_namespaces: watch.iter().map(|s| s.to_string()).collect(),
            exclude_namespaces: exclude.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn exclusion_wins_over_watch() {
        let f = filter(&["prod-*"], &["prod-secret"]);
        assert!(f.should_watch_namespace("prod-eu"));
        assert!(!f.should_watch_namespace("prod-secret"));
        assert!(!f.should_watch_namespace("staging"));
    }

    #[test]
    fn empty_watch_list_allows_everything_not_excluded() {
        let f = filter(&[], &DEFAULT_EXCLUDED_NAMESPACES);
        assert!(f.should_watch_namespace("default"));
        assert!(!f.should_watch_namespace("kube-system"));
        assert!(ResourceFilter::allow_all().should_watch_namespace("kube-system"));
    }

    #[test]
    fn glob_metacharacters_are_literal() {
        let f = filter(&["team.a?"], &[]);
        assert!(f.should_watch_namespace("team.a1"));
        assert!(!f.should_watch_namespace("teamxa1"));
    }

    #[test]
    fn label_requirements_and_exclusions() {
        let f = ResourceFilter::new(FilterConfig {
            require_labels: vec!["app".into()],
            exclude_labels: vec!["tier=internal".into(), "ignore".into()],
            ..Default::default()
        });
        let labels = |pairs: &[(&str, &str)]| pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        assert!(f.should_watch_resource(&labels(&[("app", "api"), ("tier", "public")])));
        assert!(!f.should_watch_resource(&labels(&[("tier", "public")])));
        assert!(!f.should_watch_resource(&labels(&[("app", "api"), ("tier", "internal")])));
        assert!(!f.should_watch_resource(&labels(&[("app", "api"), ("ignore", "")])));
    }
}
