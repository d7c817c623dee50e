//! Rolling per-node utilization history and the underutilization predicate.
//!
//! The tracker is written by the refresh loop once per tick and read by the
//! candidate identifier. The observation window is supplied per call because
//! node-groups may override it. Readers receive deep copies; the internal
//! structures never escape the lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Node;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::quantity;

/* ============================= CAPABILITY ============================= */

/// Instantaneous usage for one node as reported by the metrics source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeUsage {
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
}

/// Metrics source capability. Returns `None` when usage for the node is
/// unavailable; the tracker then records nothing rather than a zero.
pub trait MetricsSource: Send + Sync {
    fn node_usage(&self, node: &str) -> impl Future<Output = Option<NodeUsage>> + Send;
}

/* ============================= SAMPLES ============================= */

/// One utilization observation. Percentages are clamped to [0, 100].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationSample {
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Outcome of the underutilization predicate for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UtilizationVerdict {
    Underutilized,
    /// History does not yet span the full observation window.
    InsufficientHistory,
    /// At least one retained sample breaches a threshold.
    AboveThreshold {
        cpu_percent: f64,
        memory_percent: f64,
    },
}

impl UtilizationVerdict {
    pub fn is_underutilized(&self) -> bool {
        matches!(self, UtilizationVerdict::Underutilized)
    }
}

/// Partial-success report from one refresh pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub sampled: usize,
    /// Nodes for which the metrics source had no usage data.
    pub missing: Vec<String>,
}

/* ============================= TRACKER ============================= */

#[derive(Default)]
pub struct UtilizationTracker {
    histories: RwLock<HashMap<String, VecDeque<UtilizationSample>>>,
}

impl UtilizationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll the metrics source for each node and append one sample per node.
    ///
    /// Nodes without usage data or without parseable allocatable produce no
    /// sample and are listed in the report. Samples older than `window` are
    /// evicted, keeping the newest sample at or before the window start as
    /// the coverage anchor.
    pub async fn refresh<M: MetricsSource>(
        &self,
        nodes: &[Node],
        source: &M,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RefreshReport {
        let mut report = RefreshReport::default();

        // All awaits happen before the write lock is taken.
        let mut collected: Vec<(String, UtilizationSample)> = Vec::with_capacity(nodes.len());
        for node in nodes {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            let Some(usage) = source.node_usage(&name).await else {
                report.missing.push(name);
                continue;
            };
            let Some(sample) = sample_from_usage(node, usage, now) else {
                warn!(node = %name, "node_allocatable_unparseable");
                report.missing.push(name);
                continue;
            };
            collected.push((name, sample));
        }

        let cutoff = now - chrono_window(window);
        let mut histories = self.histories.write().expect("utilization lock poisoned");
        for (name, sample) in collected {
            let history = histories.entry(name.clone()).or_default();
            if let Some(last) = history.back() {
                // History must stay monotone in insertion time.
                if sample.at <= last.at {
                    debug!(node = %name, "utilization_sample_not_newer_skipped");
                    continue;
                }
            }
            history.push_back(sample);
            while history.len() >= 2 && history[1].at <= cutoff {
                history.pop_front();
            }
            report.sampled += 1;
        }

        report
    }

    /// True iff the node has history spanning the full window and every
    /// retained sample is below both thresholds.
    pub fn verdict(
        &self,
        node: &str,
        cpu_threshold: f64,
        memory_threshold: f64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> UtilizationVerdict {
        let histories = self.histories.read().expect("utilization lock poisoned");
        let Some(history) = histories.get(node) else {
            return UtilizationVerdict::InsufficientHistory;
        };

        let cutoff = now - chrono_window(window);
        let floor = window_floor(history, cutoff);
        let retained: Vec<&UtilizationSample> =
            history.iter().filter(|s| s.at >= floor).collect();

        let covered =
            retained.len() >= 2 && retained.first().is_some_and(|first| first.at <= cutoff);
        if !covered {
            return UtilizationVerdict::InsufficientHistory;
        }

        for sample in &retained {
            if sample.cpu_percent >= cpu_threshold || sample.memory_percent >= memory_threshold {
                return UtilizationVerdict::AboveThreshold {
                    cpu_percent: sample.cpu_percent,
                    memory_percent: sample.memory_percent,
                };
            }
        }
        UtilizationVerdict::Underutilized
    }

    /// Average CPU/memory percent over the samples inside the window,
    /// `None` without history.
    pub fn window_average(
        &self,
        node: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Option<(f64, f64)> {
        let histories = self.histories.read().expect("utilization lock poisoned");
        let history = histories.get(node)?;
        let floor = window_floor(history, now - chrono_window(window));
        let retained: Vec<&UtilizationSample> =
            history.iter().filter(|s| s.at >= floor).collect();
        if retained.is_empty() {
            return None;
        }
        let n = retained.len() as f64;
        let (cpu, mem) = retained
            .iter()
            .fold((0.0, 0.0), |(c, m), s| (c + s.cpu_percent, m + s.memory_percent));
        Some((cpu / n, mem / n))
    }

    /// Defensive copy of the node's retained samples.
    pub fn snapshot(&self, node: &str) -> Vec<UtilizationSample> {
        let histories = self.histories.read().expect("utilization lock poisoned");
        histories
            .get(node)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop history for nodes that no longer exist.
    pub fn retain_nodes(&self, live: &[String]) {
        let mut histories = self.histories.write().expect("utilization lock poisoned");
        histories.retain(|name, _| live.iter().any(|n| n == name));
    }
}

fn chrono_window(window: Duration) -> ChronoDuration {
    ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::minutes(10))
}

/// Oldest timestamp still relevant: the newest sample at or before the window
/// start anchors coverage, everything older is expired.
fn window_floor(history: &VecDeque<UtilizationSample>, cutoff: DateTime<Utc>) -> DateTime<Utc> {
    history
        .iter()
        .rev()
        .find(|s| s.at <= cutoff)
        .map(|s| s.at)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn sample_from_usage(
    node: &Node,
    usage: NodeUsage,
    now: DateTime<Utc>,
) -> Option<UtilizationSample> {
    let allocatable = node.status.as_ref()?.allocatable.as_ref()?;
    let cpu_alloc = quantity::cpu_millis(allocatable.get("cpu")?)?;
    let mem_alloc = quantity::memory_bytes(allocatable.get("memory")?)?;
    if cpu_alloc <= 0 || mem_alloc <= 0 {
        return None;
    }
    Some(UtilizationSample {
        at: now,
        cpu_percent: percent(usage.cpu_millicores, cpu_alloc),
        memory_percent: percent(usage.memory_bytes, mem_alloc),
    })
}

fn percent(used: i64, allocatable: i64) -> f64 {
    (used as f64 / allocatable as f64 * 100.0).clamp(0.0, 100.0)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const WINDOW: Duration = Duration::from_secs(600);

    fn test_node(name: &str, cpu: &str, memory: &str) -> Node {
        let mut allocatable = BTreeMap::new();
        allocatable.insert("cpu".to_string(), Quantity(cpu.to_string()));
        allocatable.insert("memory".to_string(), Quantity(memory.to_string()));
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                allocatable: Some(allocatable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Metrics source returning canned usage per node; `None` when absent.
    struct FixedSource {
        usage: Mutex<HashMap<String, NodeUsage>>,
    }

    impl FixedSource {
        fn new(entries: &[(&str, i64, i64)]) -> Self {
            let mut usage = HashMap::new();
            for (name, cpu, mem) in entries {
                usage.insert(
                    name.to_string(),
                    NodeUsage {
                        cpu_millicores: *cpu,
                        memory_bytes: *mem,
                    },
                );
            }
            Self {
                usage: Mutex::new(usage),
            }
        }
    }

    impl MetricsSource for FixedSource {
        async fn node_usage(&self, node: &str) -> Option<NodeUsage> {
            self.usage.lock().unwrap().get(node).copied()
        }
    }

    fn gib(n: i64) -> i64 {
        n * 1024 * 1024 * 1024
    }

    #[tokio::test]
    async fn test_refresh_appends_samples() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);
        let now = Utc::now();

        let report = tracker.refresh(&nodes, &source, WINDOW, now).await;
        assert_eq!(report.sampled, 1);
        assert!(report.missing.is_empty());

        let samples = tracker.snapshot("a");
        assert_eq!(samples.len(), 1);
        assert!((samples[0].cpu_percent - 15.0).abs() < 1e-9);
        assert!((samples[0].memory_percent - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_refresh_missing_metrics_no_sample() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi"), test_node("b", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);

        let report = tracker.refresh(&nodes, &source, WINDOW, Utc::now()).await;
        assert_eq!(report.sampled, 1);
        assert_eq!(report.missing, vec!["b".to_string()]);
        assert!(tracker.snapshot("b").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_zero_allocatable_omits_metric() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "0", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);

        let report = tracker.refresh(&nodes, &source, WINDOW, Utc::now()).await;
        assert_eq!(report.sampled, 0);
        assert_eq!(report.missing, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_clamps_over_100_percent() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "1", "1Gi")];
        let source = FixedSource::new(&[("a", 5000, gib(4))]);

        tracker.refresh(&nodes, &source, WINDOW, Utc::now()).await;
        let samples = tracker.snapshot("a");
        assert_eq!(samples[0].cpu_percent, 100.0);
        assert_eq!(samples[0].memory_percent, 100.0);
    }

    #[tokio::test]
    async fn test_refresh_rejects_non_monotone_sample() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);
        let now = Utc::now();

        tracker.refresh(&nodes, &source, WINDOW, now).await;
        let report = tracker.refresh(&nodes, &source, WINDOW, now).await;
        assert_eq!(report.sampled, 0);
        assert_eq!(tracker.snapshot("a").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_history_never_underutilized() {
        let tracker = UtilizationTracker::new();
        assert_eq!(
            tracker.verdict("ghost", 50.0, 50.0, WINDOW, Utc::now()),
            UtilizationVerdict::InsufficientHistory
        );
    }

    #[tokio::test]
    async fn test_short_history_insufficient() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);
        let now = Utc::now();

        // Two samples only five minutes apart: below thresholds but not
        // spanning the window.
        tracker
            .refresh(&nodes, &source, WINDOW, now - ChronoDuration::minutes(5))
            .await;
        tracker.refresh(&nodes, &source, WINDOW, now).await;

        assert_eq!(
            tracker.verdict("a", 50.0, 50.0, WINDOW, now),
            UtilizationVerdict::InsufficientHistory
        );
    }

    #[tokio::test]
    async fn test_full_window_below_thresholds_is_underutilized() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);
        let now = Utc::now();

        for minutes in [10, 8, 6, 4, 2, 0] {
            tracker
                .refresh(&nodes, &source, WINDOW, now - ChronoDuration::minutes(minutes))
                .await;
        }

        assert_eq!(
            tracker.verdict("a", 50.0, 50.0, WINDOW, now),
            UtilizationVerdict::Underutilized
        );
    }

    #[tokio::test]
    async fn test_one_hot_sample_breaks_underutilization() {
        let tracker = UtilizationTracker::new();
        let node = vec![test_node("a", "4", "8Gi")];
        let now = Utc::now();

        let cool = FixedSource::new(&[("a", 600, gib(2))]);
        let hot = FixedSource::new(&[("a", 3000, gib(2))]);

        tracker
            .refresh(&node, &cool, WINDOW, now - ChronoDuration::minutes(10))
            .await;
        tracker
            .refresh(&node, &hot, WINDOW, now - ChronoDuration::minutes(5))
            .await;
        tracker.refresh(&node, &cool, WINDOW, now).await;

        match tracker.verdict("a", 50.0, 50.0, WINDOW, now) {
            UtilizationVerdict::AboveThreshold { cpu_percent, .. } => {
                assert!(cpu_percent >= 50.0);
            }
            other => panic!("expected AboveThreshold, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eviction_keeps_window_anchor() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);
        let now = Utc::now();

        // Samples across 30 minutes; only ~10 minutes plus the anchor remain.
        for minutes in [30, 25, 20, 15, 10, 5, 0] {
            tracker
                .refresh(&nodes, &source, WINDOW, now - ChronoDuration::minutes(minutes))
                .await;
        }

        let samples = tracker.snapshot("a");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].at, now - ChronoDuration::minutes(10));
        assert_eq!(
            tracker.verdict("a", 50.0, 50.0, WINDOW, now),
            UtilizationVerdict::Underutilized
        );
    }

    #[tokio::test]
    async fn test_window_average() {
        let tracker = UtilizationTracker::new();
        let node = vec![test_node("a", "4", "8Gi")];
        let now = Utc::now();

        let low = FixedSource::new(&[("a", 400, gib(1))]);
        let high = FixedSource::new(&[("a", 800, gib(3))]);

        tracker
            .refresh(&node, &low, WINDOW, now - ChronoDuration::minutes(2))
            .await;
        tracker.refresh(&node, &high, WINDOW, now).await;

        let (cpu, mem) = tracker
            .window_average("a", WINDOW, now)
            .expect("history exists");
        assert!((cpu - 15.0).abs() < 1e-9); // (10 + 20) / 2
        assert!((mem - 25.0).abs() < 1e-9); // (12.5 + 37.5) / 2
    }

    #[tokio::test]
    async fn test_snapshot_is_deep_copy() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2))]);

        tracker.refresh(&nodes, &source, WINDOW, Utc::now()).await;
        let mut snap = tracker.snapshot("a");
        snap.clear();
        assert_eq!(tracker.snapshot("a").len(), 1);
    }

    #[tokio::test]
    async fn test_retain_nodes_drops_stale_history() {
        let tracker = UtilizationTracker::new();
        let nodes = vec![test_node("a", "4", "8Gi"), test_node("b", "4", "8Gi")];
        let source = FixedSource::new(&[("a", 600, gib(2)), ("b", 600, gib(2))]);

        tracker.refresh(&nodes, &source, WINDOW, Utc::now()).await;
        tracker.retain_nodes(&["a".to_string()]);

        assert_eq!(tracker.snapshot("a").len(), 1);
        assert!(tracker.snapshot("b").is_empty());
    }
}
