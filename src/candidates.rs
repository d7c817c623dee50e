//! Ranks underutilized nodes for removal, subject to the group floor and
//! cooldown. Candidates are ephemeral: rebuilt from scratch on every tick.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::config::ScaleDownConfig;
use crate::crd::{MemberPhase, NodeGroup, NodeMember};
use crate::utilization::UtilizationTracker;

/// A node proposed for removal, with the data safety evaluation needs.
#[derive(Debug, Clone)]
pub struct ScaleDownCandidate {
    pub member: String,
    pub node: String,
    pub avg_cpu: f64,
    pub avg_memory: f64,
    /// Lower is removed first: `0.6 * avg_cpu + 0.4 * avg_memory`.
    pub priority: f64,
    pub last_ready: Option<DateTime<Utc>>,
    /// Pods bound to the node at snapshot time.
    pub pods: Vec<Pod>,
}

/// Total order over candidates: priority ascending, then oldest ready first
/// (members with no recorded ready time sort last), then node name.
pub fn candidate_order(a: &ScaleDownCandidate, b: &ScaleDownCandidate) -> Ordering {
    a.priority
        .total_cmp(&b.priority)
        .then_with(|| match (a.last_ready, b.last_ready) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.node.cmp(&b.node))
}

/// Produce the ranked candidate list for one group.
///
/// Returns empty when the group is at its floor or still inside the cooldown
/// window; otherwise at most `max_removal_per_tick` Ready, underutilized
/// members, lowest priority first.
pub fn identify(
    group: &NodeGroup,
    members: &[NodeMember],
    pods_by_node: &HashMap<String, Vec<Pod>>,
    tracker: &UtilizationTracker,
    cfg: &ScaleDownConfig,
    now: DateTime<Utc>,
) -> Vec<ScaleDownCandidate> {
    let current = group.current_count();
    if current <= group.spec.min_size {
        debug!(
            group = %group.metadata.name.as_deref().unwrap_or_default(),
            current,
            min = group.spec.min_size,
            "identify_at_floor"
        );
        return Vec::new();
    }

    if let Some(last) = group.status.as_ref().and_then(|s| s.last_scale_down_time()) {
        let elapsed = (now - last).to_std().unwrap_or_default();
        if elapsed < cfg.cooldown {
            debug!(
                group = %group.metadata.name.as_deref().unwrap_or_default(),
                elapsed_secs = elapsed.as_secs(),
                "identify_in_cooldown"
            );
            return Vec::new();
        }
    }

    let mut candidates: Vec<ScaleDownCandidate> = Vec::new();
    for member in members {
        if member.phase() != MemberPhase::Ready {
            continue;
        }
        let Some(node) = member.node_name() else {
            continue;
        };
        if !tracker
            .verdict(
                node,
                cfg.cpu_threshold,
                cfg.memory_threshold,
                cfg.observation_window,
                now,
            )
            .is_underutilized()
        {
            continue;
        }
        let (avg_cpu, avg_memory) = tracker
            .window_average(node, cfg.observation_window, now)
            .unwrap_or((0.0, 0.0));
        candidates.push(ScaleDownCandidate {
            member: member.metadata.name.clone().unwrap_or_default(),
            node: node.to_string(),
            avg_cpu,
            avg_memory,
            priority: 0.6 * avg_cpu + 0.4 * avg_memory,
            last_ready: member.phase_entered(MemberPhase::Ready),
            pods: pods_by_node.get(node).cloned().unwrap_or_default(),
        });
    }

    candidates.sort_by(candidate_order);
    candidates.truncate(cfg.max_removal_per_tick);
    candidates
}

/* ============================= TESTS ============================= */
