use chrono::NaiveTime;
use std::time::Duration;
use tracing::warn;

use crate::crd::NodeGroup;

/* ============================= ANNOTATIONS ============================= */

/// Nodes carrying this annotation with value `"true"` are never scaled down.
pub const PROTECT_ANNOTATION: &str = "autoscaler.vpsie.io/scale-down-disabled";

const PREFIX: &str = "autoscaler.vpsie.io/";

/* ============================= CONFIG ============================= */

/// Tunables for the scale-down pipeline.
///
/// Compiled defaults apply cluster-wide; any field can be overridden per
/// NodeGroup through `autoscaler.vpsie.io/<key>` annotations on the group.
/// Invalid annotation values are logged and ignored, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDownConfig {
    /// Duration utilization must stay below thresholds to qualify a node.
    pub observation_window: Duration,
    /// CPU percent upper bound for "underutilized".
    pub cpu_threshold: f64,
    /// Memory percent upper bound for "underutilized".
    pub memory_threshold: f64,
    /// Minimum gap between successful scale-downs of one group.
    pub cooldown: Duration,
    /// Ceiling on candidates returned per tick.
    pub max_removal_per_tick: usize,
    /// Overall drain deadline.
    pub drain_timeout: Duration,
    /// Concurrent eviction requests during one drain.
    pub eviction_concurrency: usize,
    /// Per-pod retry cap for transient eviction errors.
    pub eviction_max_retries: u32,
    /// Cluster-wide cap on in-flight VM terminations.
    pub global_termination_concurrency: usize,
    /// Per-call timeout on provider requests.
    pub provider_call_timeout: Duration,
    /// Namespaces whose pods block scale-down of their node.
    pub system_namespaces: Vec<String>,
    /// Optional daily window outside which scale-down is disabled.
    pub time_window: Option<TimeWindow>,
}

impl Default for ScaleDownConfig {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(10 * 60),
            cpu_threshold: 50.0,
            memory_threshold: 50.0,
            cooldown: Duration::from_secs(10 * 60),
            max_removal_per_tick: 3,
            drain_timeout: Duration::from_secs(5 * 60),
            eviction_concurrency: 4,
            eviction_max_retries: 5,
            global_termination_concurrency: 8,
            provider_call_timeout: Duration::from_secs(30),
            system_namespaces: vec!["kube-system".to_string(), "kube-public".to_string()],
            time_window: None,
        }
    }
}

impl ScaleDownConfig {
    /// Resolve the effective configuration for a group from its annotations.
    pub fn for_group(group: &NodeGroup) -> Self {
        let mut cfg = Self::default();
        let Some(annotations) = group.metadata.annotations.as_ref() else {
            return cfg;
        };

        for (key, value) in annotations {
            let Some(key) = key.strip_prefix(PREFIX) else {
                continue;
            };
            let applied = match key {
                "observation-window" => {
                    apply(parse_duration(value), &mut cfg.observation_window)
                }
                "cpu-threshold" => apply(parse_percent(value), &mut cfg.cpu_threshold),
                "memory-threshold" => apply(parse_percent(value), &mut cfg.memory_threshold),
                "cooldown" => apply(parse_duration(value), &mut cfg.cooldown),
                "max-removal-per-tick" => {
                    apply(value.parse().ok(), &mut cfg.max_removal_per_tick)
                }
                "drain-timeout" => apply(parse_duration(value), &mut cfg.drain_timeout),
                "eviction-concurrency" => {
                    apply(value.parse().ok(), &mut cfg.eviction_concurrency)
                }
                "eviction-max-retries" => {
                    apply(value.parse().ok(), &mut cfg.eviction_max_retries)
                }
                "global-termination-concurrency" => {
                    apply(value.parse().ok(), &mut cfg.global_termination_concurrency)
                }
                "provider-call-timeout" => {
                    apply(parse_duration(value), &mut cfg.provider_call_timeout)
                }
                "system-namespaces" => {
                    let parsed: Vec<String> = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if parsed.is_empty() {
                        false
                    } else {
                        cfg.system_namespaces = parsed;
                        true
                    }
                }
                "time-window-annotation" => match TimeWindow::parse(value) {
                    Some(w) => {
                        cfg.time_window = Some(w);
                        true
                    }
                    None => false,
                },
                "scale-down-disabled" => continue,
                _ => {
                    warn!(annotation = %key, "unknown_config_annotation");
                    continue;
                }
            };
            if !applied {
                warn!(annotation = %key, value = %value, "invalid_config_annotation");
            }
        }

        cfg
    }
}

fn apply<T>(parsed: Option<T>, target: &mut T) -> bool {
    match parsed {
        Some(v) => {
            *target = v;
            true
        }
        None => false,
    }
}

/* ============================= VALUE PARSING ============================= */

/// Parse a duration like `"30s"`, `"10m"`, `"1h"`, or bare seconds (`"600"`).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = match s.char_indices().rfind(|(_, c)| c.is_ascii_digit()) {
        Some((i, _)) => s.split_at(i + 1),
        None => return None,
    };
    let n: u64 = num.parse().ok()?;
    match unit {
        "" | "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

fn parse_percent(s: &str) -> Option<f64> {
    let n: f64 = s.trim().trim_end_matches('%').parse().ok()?;
    (0.0..=100.0).contains(&n).then_some(n)
}

/* ============================= TIME WINDOW ============================= */

/// A daily `HH:MM-HH:MM` window. A window whose end precedes its start wraps
/// across midnight and is treated as two disjoint intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Accepts `"08:00-20:00"`, also with a Unicode dash separator.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (start, end) = s.split_once(['-', '–'])?;
        Some(Self {
            start: NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?,
            end: NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?,
        })
    }

    /// Whether `t` falls inside the window (bounds inclusive).
    /// A degenerate window with `start == end` covers the whole day.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/* ============================= TESTS ============================= */
