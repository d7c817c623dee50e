//! One scale-down reconciliation pass for a node-group.
//!
//! Drives the pipeline: refresh utilization, identify candidates, evaluate
//! safety, drain, terminate. Generic over the cluster, metrics, and provider
//! capabilities so the whole pass runs against mocks in tests.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::candidates::{self, ScaleDownCandidate};
use crate::cluster::ClusterOps;
use crate::config::ScaleDownConfig;
use crate::crd::{MemberPhase, NodeGroup, NodeMember};
use crate::drain::{self, DrainLimits, DrainOutcome, InFlightSet};
use crate::metrics;
use crate::provider::{ExecutorLimits, ProviderExecutor, VmProvider};
use crate::safety::{self, SafetyVerdict};
use crate::utilization::{MetricsSource, RefreshReport, UtilizationTracker};

/* ============================= CONTEXT ============================= */

/// Long-lived dependencies shared by every pass.
pub struct ScaleDownContext<C, M, P>
where
    C: ClusterOps,
    M: MetricsSource,
    P: VmProvider,
{
    pub cluster: C,
    pub metrics_source: M,
    pub executor: Arc<ProviderExecutor<P>>,
    pub tracker: Arc<UtilizationTracker>,
    pub in_flight: Arc<InFlightSet>,
}

/* ============================= SUMMARY ============================= */

/// A node removed by this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNode {
    pub member: String,
    pub node: String,
    /// Provider-confirmed deletion time; the cooldown window starts here.
    pub completed_at: DateTime<Utc>,
}

/// What one pass did, for status reporting.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub refresh: RefreshReport,
    pub candidates: usize,
    pub removed: Option<RemovedNode>,
    /// Safety rejections as (node, reason code).
    pub blocked: Vec<(String, &'static str)>,
    pub errors: Vec<String>,
    /// Set when the pass stopped before identifying candidates.
    pub skipped: Option<String>,
}

impl PassSummary {
    pub fn message(&self) -> String {
        if let Some(skipped) = &self.skipped {
            return format!("scale-down skipped: {skipped}");
        }
        match (&self.removed, self.blocked.first()) {
            (Some(removed), _) => format!("scaled down node {}", removed.node),
            (None, Some((node, reason))) => {
                format!("scale-down of {node} blocked: {reason}")
            }
            (None, None) if self.errors.is_empty() => "no scale-down candidates".to_string(),
            (None, None) => format!("scale-down failed: {}", self.errors.join("; ")),
        }
    }
}

/* ============================= PASS ============================= */

/// Run one scale-down pass for `group`. Status patching is the caller's
/// responsibility; everything here reports through the returned summary.
pub async fn run_scale_down_pass<C, M, P>(
    ctx: &ScaleDownContext<C, M, P>,
    group: &NodeGroup,
    now: DateTime<Utc>,
) -> Result<PassSummary>
where
    C: ClusterOps,
    M: MetricsSource,
    P: VmProvider,
{
    let group_name = group.metadata.name.clone().unwrap_or_default();
    let namespace = group.metadata.namespace.clone().unwrap_or_default();
    let cfg = ScaleDownConfig::for_group(group);
    let mut summary = PassSummary::default();

    let members = ctx.cluster.list_group_members(&namespace, &group_name).await?;
    let node_names: Vec<String> = members
        .iter()
        .filter_map(|m| m.node_name().map(str::to_string))
        .collect();

    let snapshot = ctx.cluster.group_snapshot(&node_names).await?;
    summary.refresh = ctx
        .tracker
        .refresh(&snapshot.nodes, &ctx.metrics_source, cfg.observation_window, now)
        .await;
    ctx.tracker.retain_nodes(&node_names);

    if let Some(window) = &cfg.time_window {
        if !window.contains(now.time()) {
            summary.skipped = Some("outside the configured scale-down window".to_string());
            return Ok(summary);
        }
    }

    let candidates = candidates::identify(
        group,
        &members,
        &snapshot.pods_by_node,
        &ctx.tracker,
        &cfg,
        now,
    );
    summary.candidates = candidates.len();

    // Nodes removed earlier in this pass must count against the floor seen
    // by later evaluations; the status subresource is only patched after the
    // pass returns.
    let mut observed_group = group.clone();

    for candidate in &candidates {
        match safety::evaluate(&candidate.node, &observed_group, &cfg, &snapshot, now) {
            SafetyVerdict::Allow => {}
            SafetyVerdict::Block { reason, description } => {
                info!(
                    group = %group_name,
                    node = %candidate.node,
                    reason = reason.code(),
                    %description,
                    "scaledown_candidate_blocked"
                );
                summary.blocked.push((candidate.node.clone(), reason.code()));
                continue;
            }
        }

        let Some(member) = members
            .iter()
            .find(|m| m.metadata.name.as_deref() == Some(candidate.member.as_str()))
        else {
            continue;
        };
        if member.phase() != MemberPhase::Ready {
            // Another workflow took this member between snapshot and now.
            warn!(member = %candidate.member, phase = member.phase().key(), "member_phase_changed_mid_pass");
            summary
                .errors
                .push(format!("member {} left Ready mid-pass", candidate.member));
            continue;
        }

        let Some(_claim) = ctx.in_flight.try_begin(&candidate.node) else {
            info!(node = %candidate.node, "drain_already_in_flight");
            continue;
        };

        match remove_candidate(ctx, &namespace, member, candidate, &cfg).await {
            Ok(completed_at) => {
                summary.removed = Some(RemovedNode {
                    member: candidate.member.clone(),
                    node: candidate.node.clone(),
                    completed_at,
                });
                let remaining = observed_group.current_count().saturating_sub(1);
                observed_group
                    .status
                    .get_or_insert_with(Default::default)
                    .current_count = Some(remaining);
                // The next removal must wait out the cooldown from this
                // completion; with a zero cooldown further candidates may
                // proceed this tick, gated on the decremented count above.
                if !cfg.cooldown.is_zero() {
                    break;
                }
            }
            Err(error) => {
                summary.errors.push(error);
            }
        }
    }

    Ok(summary)
}

/// Drain one candidate and terminate its VM. Returns the provider-confirmed
/// completion time. Any failure leaves the node uncordoned.
async fn remove_candidate<C, M, P>(
    ctx: &ScaleDownContext<C, M, P>,
    namespace: &str,
    member: &NodeMember,
    candidate: &ScaleDownCandidate,
    cfg: &ScaleDownConfig,
) -> Result<DateTime<Utc>, String>
where
    C: ClusterOps,
    M: MetricsSource,
    P: VmProvider,
{
    let limits = DrainLimits::from(cfg);
    let (outcome, guard) = drain::drain_node(&ctx.cluster, &candidate.node, &limits).await;

    let guard = match outcome {
        DrainOutcome::Succeeded { evicted } => {
            info!(node = %candidate.node, evicted, "drain_succeeded");
            guard.expect("successful drain returns an armed guard")
        }
        DrainOutcome::TimedOut { remaining } => {
            metrics::SCALE_DOWN_ERRORS
                .with_label_values(&["drain_timeout"])
                .inc();
            return Err(format!(
                "drain of {} timed out with {} pod(s) remaining",
                candidate.node,
                remaining.len()
            ));
        }
        DrainOutcome::Failed { error } => {
            metrics::SCALE_DOWN_ERRORS
                .with_label_values(&["drain_failed"])
                .inc();
            return Err(format!("drain of {} failed: {error}", candidate.node));
        }
    };

    // The node is cordoned and empty: mark the member Draining and hand it
    // to the provider executor.
    let member_name = member.metadata.name.clone().unwrap_or_default();
    if let Err(e) = ctx
        .cluster
        .set_member_phase(namespace, &member_name, MemberPhase::Draining, None)
        .await
    {
        guard.release().await;
        return Err(format!("marking member {member_name} Draining: {e:#}"));
    }

    let mut draining = member.clone();
    let mut status = draining.status.take().unwrap_or_default();
    status.phase = Some(MemberPhase::Draining);
    draining.status = Some(status);

    let executor_limits = ExecutorLimits::from(cfg);
    match ctx
        .executor
        .terminate(&ctx.cluster, &draining, &executor_limits)
        .await
    {
        Ok(()) => {
            // The VM is gone; the cordon dies with the node.
            guard.disarm();
            Ok(Utc::now())
        }
        Err(error) => {
            guard.release().await;
            Err(format!(
                "terminating member {member_name}: {}",
                error.message()
            ))
        }
    }
}
