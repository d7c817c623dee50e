//! Node drain: cordon, evict with bounded concurrency, report the outcome.
//!
//! The uncordon guarantee is carried by [`CordonGuard`]: whatever happens to
//! the invoking task (deadline, fatal error, or outright cancellation), a
//! cordoned node either proceeds to termination or is made schedulable again
//! on a fresh task with its own short budget.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterOps, EvictOutcome};
use crate::config::ScaleDownConfig;
use crate::metrics;
use crate::safety::is_evictable;

/// Budget for the decoupled uncordon, independent of any caller deadline.
pub const UNCORDON_BUDGET: Duration = Duration::from_secs(10);

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 10_000;

/* ============================= LIMITS ============================= */

#[derive(Debug, Clone)]
pub struct DrainLimits {
    /// Overall deadline for one drain.
    pub deadline: Duration,
    /// Concurrent eviction requests.
    pub concurrency: usize,
    /// Per-pod cap on transient-error retries.
    pub max_retries: u32,
}

impl From<&ScaleDownConfig> for DrainLimits {
    fn from(cfg: &ScaleDownConfig) -> Self {
        Self {
            deadline: cfg.drain_timeout,
            concurrency: cfg.eviction_concurrency,
            max_retries: cfg.eviction_max_retries,
        }
    }
}

/* ============================= OUTCOME ============================= */

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Succeeded { evicted: usize },
    TimedOut { remaining: Vec<String> },
    Failed { error: String },
}

impl DrainOutcome {
    pub fn result_label(&self) -> &'static str {
        match self {
            DrainOutcome::Succeeded { .. } => "success",
            DrainOutcome::TimedOut { .. } => "timeout",
            DrainOutcome::Failed { .. } => "error",
        }
    }
}

/* ============================= IN-FLIGHT SET ============================= */

/// Process-wide registry of nodes currently being drained. A second drain
/// request for the same node is rejected instead of queued.
#[derive(Default)]
pub struct InFlightSet {
    inner: Mutex<HashSet<String>>,
}

impl InFlightSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the node, or `None` if a drain already owns it.
    pub fn try_begin(self: &Arc<Self>, node: &str) -> Option<InFlightGuard> {
        let mut set = self.inner.lock().expect("in-flight lock poisoned");
        if !set.insert(node.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(self),
            node: node.to_string(),
        })
    }

    pub fn contains(&self, node: &str) -> bool {
        self.inner
            .lock()
            .expect("in-flight lock poisoned")
            .contains(node)
    }
}

pub struct InFlightGuard {
    set: Arc<InFlightSet>,
    node: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .inner
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.node);
    }
}

/* ============================= CORDON GUARD ============================= */

/// Owns the cordon placed on a node. Dropping an armed guard spawns the
/// uncordon on a detached task so the guarantee survives caller cancellation;
/// [`CordonGuard::release`] uncordons in-line for deterministic failure paths.
pub struct CordonGuard<C: ClusterOps> {
    cluster: C,
    node: String,
    armed: bool,
}

impl<C: ClusterOps> CordonGuard<C> {
    pub fn new(cluster: C, node: &str) -> Self {
        Self {
            cluster,
            node: node.to_string(),
            armed: true,
        }
    }

    /// The node is being removed; leaving it cordoned is correct.
    pub fn disarm(mut self) {
        self.armed = false;
    }

    /// Uncordon now, on a fresh budget. If this future is cancelled before
    /// completing, the drop path still fires.
    pub async fn release(mut self) {
        uncordon_with_budget(self.cluster.clone(), self.node.clone()).await;
        self.armed = false;
    }
}

impl<C: ClusterOps> Drop for CordonGuard<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cluster = self.cluster.clone();
        let node = std::mem::take(&mut self.node);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(uncordon_with_budget(cluster, node));
            }
            Err(_) => warn!(node = %node, "uncordon_skipped_no_runtime"),
        }
    }
}

async fn uncordon_with_budget<C: ClusterOps>(cluster: C, node: String) {
    match tokio::time::timeout(UNCORDON_BUDGET, cluster.uncordon(&node)).await {
        Ok(Ok(())) => info!(node = %node, "node_uncordoned"),
        Ok(Err(e)) => warn!(node = %node, error = %e, "uncordon_failed"),
        Err(_) => warn!(node = %node, "uncordon_timed_out"),
    }
}

/* ============================= DRAIN ============================= */

/// Drain one node. On success the returned guard is armed and the caller
/// decides its fate: `disarm()` once the VM is confirmed gone, `release()`
/// if termination fails. Non-success outcomes uncordon before returning
/// (except a failed cordon, which left nothing to undo).
pub async fn drain_node<C: ClusterOps>(
    cluster: &C,
    node: &str,
    limits: &DrainLimits,
) -> (DrainOutcome, Option<CordonGuard<C>>) {
    let started = Instant::now();
    info!(node = %node, "drain_start");

    if let Err(e) = cluster.cordon(node).await {
        let outcome = DrainOutcome::Failed {
            error: format!("cordon failed: {e:#}"),
        };
        observe_drain(node, &outcome, started, 0);
        return (outcome, None);
    }
    let guard = CordonGuard::new(cluster.clone(), node);

    let pods = match cluster.list_pods_on_node(node).await {
        Ok(pods) => pods,
        Err(e) => {
            let outcome = DrainOutcome::Failed {
                error: format!("listing pods failed: {e:#}"),
            };
            guard.release().await;
            observe_drain(node, &outcome, started, 0);
            return (outcome, None);
        }
    };

    let targets: Vec<Pod> = pods.into_iter().filter(|p| is_evictable(p)).collect();
    let evicted = AtomicUsize::new(0);
    let pending: Mutex<HashSet<String>> = Mutex::new(
        targets
            .iter()
            .map(|p| p.metadata.name.clone().unwrap_or_default())
            .collect(),
    );

    let evict_phase = async {
        let mut errors: Vec<String> = futures::stream::iter(targets.into_iter().map(|pod| {
            let ns = pod.metadata.namespace.clone().unwrap_or_default();
            let name = pod.metadata.name.clone().unwrap_or_default();
            evict_one(cluster, ns, name, limits, &evicted, &pending)
        }))
        .buffer_unordered(limits.concurrency.max(1))
        .filter_map(|maybe_err| async move { maybe_err })
        .collect()
        .await;
        errors.sort();
        errors
    };

    let (outcome, guard) = match tokio::time::timeout(limits.deadline, evict_phase).await {
        Ok(errors) if errors.is_empty() => (
            DrainOutcome::Succeeded {
                evicted: evicted.load(Ordering::Relaxed),
            },
            Some(guard),
        ),
        Ok(errors) => {
            guard.release().await;
            (
                DrainOutcome::Failed {
                    error: errors.join("; "),
                },
                None,
            )
        }
        Err(_elapsed) => {
            guard.release().await;
            let mut remaining: Vec<String> = pending
                .lock()
                .expect("pending lock poisoned")
                .iter()
                .cloned()
                .collect();
            remaining.sort();
            (DrainOutcome::TimedOut { remaining }, None)
        }
    };

    observe_drain(node, &outcome, started, evicted.load(Ordering::Relaxed));
    (outcome, guard)
}

/// Evict a single pod and fold the outcome into the shared counters, returning
/// an error string for the drain-phase error list (or `None` on success).
async fn evict_one<C: ClusterOps>(
    cluster: &C,
    ns: String,
    name: String,
    limits: &DrainLimits,
    evicted: &AtomicUsize,
    pending: &Mutex<HashSet<String>>,
) -> Option<String> {
    match evict_with_retry(cluster, &ns, &name, limits).await {
        Ok(freshly_evicted) => {
            if freshly_evicted {
                evicted.fetch_add(1, Ordering::Relaxed);
            }
            pending.lock().expect("pending lock poisoned").remove(&name);
            None
        }
        Err(error) => Some(format!("{ns}/{name}: {error}")),
    }
}

/// Evict one pod until it succeeds, is found gone, exhausts its transient
/// retry budget, or hits a definitive rejection. Budget rejections back off
/// indefinitely; the drain deadline bounds them.
async fn evict_with_retry<C: ClusterOps>(
    cluster: &C,
    namespace: &str,
    name: &str,
    limits: &DrainLimits,
) -> Result<bool, String> {
    let mut pdb_attempts: u32 = 0;
    let mut transient_attempts: u32 = 0;
    loop {
        match cluster.evict_pod(namespace, name).await {
            EvictOutcome::Evicted => {
                debug!(pod = %name, "pod_evicted");
                return Ok(true);
            }
            EvictOutcome::Gone => {
                debug!(pod = %name, "pod_already_gone");
                return Ok(false);
            }
            EvictOutcome::PdbBlocked => {
                debug!(pod = %name, attempt = pdb_attempts, "eviction_blocked_by_budget");
                tokio::time::sleep(backoff_delay(pdb_attempts)).await;
                pdb_attempts = pdb_attempts.saturating_add(1);
            }
            EvictOutcome::Transient(error) => {
                transient_attempts += 1;
                if transient_attempts > limits.max_retries {
                    return Err(format!("retries exhausted: {error}"));
                }
                warn!(pod = %name, attempt = transient_attempts, error = %error, "eviction_retry");
                tokio::time::sleep(backoff_delay(transient_attempts)).await;
            }
            EvictOutcome::Fatal(error) => return Err(error),
        }
    }
}

/// Capped exponential back-off with ±20% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

fn observe_drain(node: &str, outcome: &DrainOutcome, started: Instant, evicted: usize) {
    let duration = started.elapsed();
    metrics::DRAIN_DURATION
        .with_label_values(&[outcome.result_label()])
        .observe(duration.as_secs_f64());
    if !matches!(outcome, DrainOutcome::Failed { .. }) {
        metrics::DRAIN_PODS_EVICTED.observe(evicted as f64);
    }
    info!(
        node = %node,
        result = outcome.result_label(),
        evicted,
        duration_ms = duration.as_millis() as u64,
        "drain_finished"
    );
}

/* ============================= TESTS ============================= */
