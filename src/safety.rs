//! Safety predicates guarding node removal.
//!
//! Every candidate passes through the checks in order; the first
//! failure short-circuits with a machine-readable reason code. Evaluation is
//! pure over an immutable [`ClusterSnapshot`] taken before any eviction
//! begins, so the same input always yields the same verdict.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, Taint, Toleration};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::config::{PROTECT_ANNOTATION, ScaleDownConfig};
use crate::crd::NodeGroup;
use crate::metrics;
use crate::quantity;

/* ============================= VERDICT ============================= */

/// Closed set of rejection reasons. `code()` values are the external
/// contract used in status fields and the `scaledown_blocked_total` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    MinFloor,
    Cooldown,
    Protected,
    SystemPod,
    LocalStorage,
    PdbBlocked,
    RescheduleCapacity,
    TolerationMismatch,
    SelectorMismatch,
}

impl BlockReason {
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::MinFloor => "min_floor",
            BlockReason::Cooldown => "cooldown",
            BlockReason::Protected => "protected",
            BlockReason::SystemPod => "system_pod",
            BlockReason::LocalStorage => "local_storage",
            BlockReason::PdbBlocked => "pdb_blocked",
            BlockReason::RescheduleCapacity => "reschedule_capacity",
            BlockReason::TolerationMismatch => "toleration_mismatch",
            BlockReason::SelectorMismatch => "selector_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    Allow,
    Block {
        reason: BlockReason,
        description: String,
    },
}

impl SafetyVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, SafetyVerdict::Allow)
    }

    pub fn reason(&self) -> Option<BlockReason> {
        match self {
            SafetyVerdict::Allow => None,
            SafetyVerdict::Block { reason, .. } => Some(*reason),
        }
    }
}

/* ============================= SNAPSHOT ============================= */

/// Immutable view of the cluster state relevant to one evaluation pass,
/// assembled before eviction begins. Pods arriving later are ignored for
/// the current pass.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// Ready nodes of the group, including the candidate itself.
    pub nodes: Vec<Node>,
    /// Pods bound to each node, keyed by node name.
    pub pods_by_node: HashMap<String, Vec<Pod>>,
    /// All disruption budgets that may cover pods of this group.
    pub pdbs: Vec<PodDisruptionBudget>,
    /// StorageClass name per PVC, keyed by `namespace/claim`. A claim absent
    /// from the map failed lookup and is treated as node-local (fail-closed).
    /// `None` means the claim relies on the cluster default class, which we
    /// cannot verify either.
    pub pvc_storage_classes: HashMap<String, Option<String>>,
    /// StorageClasses whose provisioner pins volumes to a node.
    pub local_storage_classes: HashSet<String>,
}

impl ClusterSnapshot {
    pub fn pods_on(&self, node: &str) -> &[Pod] {
        self.pods_by_node.get(node).map(Vec::as_slice).unwrap_or(&[])
    }
}

/* ============================= POD CLASSIFICATION ============================= */

/// Static pods materialized by the kubelet; they cannot be evicted.
pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"))
}

/// DaemonSet pods are left in place: their controller ignores cordons.
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata.owner_references.as_ref().is_some_and(|owners| {
        owners
            .iter()
            .any(|o| o.controller == Some(true) && o.kind == "DaemonSet")
    })
}

pub fn is_terminal_pod(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Pods a drain must actually move off the node.
pub fn is_evictable(pod: &Pod) -> bool {
    !is_mirror_pod(pod) && !is_daemonset_pod(pod) && !is_terminal_pod(pod)
}

fn pod_id(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/* ============================= EVALUATION ============================= */

/// Run every safety check for one candidate node. Records blocked-reason metrics on
/// rejection; otherwise side-effect free.
pub fn evaluate(
    node_name: &str,
    group: &NodeGroup,
    cfg: &ScaleDownConfig,
    snapshot: &ClusterSnapshot,
    now: DateTime<Utc>,
) -> SafetyVerdict {
    let verdict = evaluate_inner(node_name, group, cfg, snapshot, now);
    if let SafetyVerdict::Block { reason, description } = &verdict {
        metrics::SCALEDOWN_BLOCKED
            .with_label_values(&[reason.code()])
            .inc();
        metrics::SAFETY_CHECK_FAILURES
            .with_label_values(&[reason.code()])
            .inc();
        debug!(node = %node_name, reason = reason.code(), %description, "scaledown_blocked");
    }
    verdict
}

fn evaluate_inner(
    node_name: &str,
    group: &NodeGroup,
    cfg: &ScaleDownConfig,
    snapshot: &ClusterSnapshot,
    now: DateTime<Utc>,
) -> SafetyVerdict {
    let pods = snapshot.pods_on(node_name);
    let node = snapshot
        .nodes
        .iter()
        .find(|n| n.metadata.name.as_deref() == Some(node_name));

    // Group floor.
    let current = group.current_count();
    if current <= group.spec.min_size {
        return block(
            BlockReason::MinFloor,
            format!(
                "removal would drop the group to {} members, below minSize {}",
                current.saturating_sub(1),
                group.spec.min_size
            ),
        );
    }

    // Cooldown.
    if let Some(last) = group.status.as_ref().and_then(|s| s.last_scale_down_time()) {
        let elapsed = (now - last).to_std().unwrap_or_default();
        if elapsed < cfg.cooldown {
            return block(
                BlockReason::Cooldown,
                format!(
                    "last scale-down completed {}s ago, cooldown is {}s",
                    elapsed.as_secs(),
                    cfg.cooldown.as_secs()
                ),
            );
        }
    }

    // Protection annotation on the node.
    if node
        .and_then(|n| n.metadata.annotations.as_ref())
        .and_then(|a| a.get(PROTECT_ANNOTATION))
        .is_some_and(|v| v == "true")
    {
        return block(
            BlockReason::Protected,
            format!("node carries {PROTECT_ANNOTATION}=true"),
        );
    }

    // Non-mirror, non-DaemonSet pods in privileged namespaces.
    let operator_namespace = group.metadata.namespace.as_deref().unwrap_or_default();
    for pod in pods {
        if is_mirror_pod(pod) || is_daemonset_pod(pod) {
            continue;
        }
        let ns = pod.metadata.namespace.as_deref().unwrap_or_default();
        if ns == operator_namespace || cfg.system_namespaces.iter().any(|s| s == ns) {
            return block(
                BlockReason::SystemPod,
                format!("pod {} runs in privileged namespace {ns}", pod_id(pod)),
            );
        }
    }

    // Node-local storage.
    for pod in pods.iter().filter(|p| is_evictable(p)) {
        if let Some(volume) = local_volume(pod, snapshot) {
            return block(
                BlockReason::LocalStorage,
                format!("pod {} mounts local volume {volume}", pod_id(pod)),
            );
        }
    }

    // Disruption budgets with no headroom.
    for pod in pods.iter().filter(|p| is_evictable(p)) {
        for pdb in covering_pdbs(pod, &snapshot.pdbs) {
            let allowed = pdb
                .status
                .as_ref()
                .map(|s| s.disruptions_allowed)
                .unwrap_or(0);
            if allowed <= 0 {
                return block(
                    BlockReason::PdbBlocked,
                    format!(
                        "pod {} is covered by budget {} with zero allowed disruptions",
                        pod_id(pod),
                        pdb.metadata.name.as_deref().unwrap_or_default()
                    ),
                );
            }
        }
    }

    let remaining: Vec<&Node> = snapshot
        .nodes
        .iter()
        .filter(|n| n.metadata.name.as_deref() != Some(node_name))
        .collect();
    let evictable: Vec<&Pod> = pods.iter().filter(|p| is_evictable(p)).collect();

    // Reschedule capacity on the remaining nodes.
    if let Some(pod) = first_unplaceable(&evictable, &remaining, snapshot) {
        return block(
            BlockReason::RescheduleCapacity,
            format!(
                "pod {} does not fit on the remaining {} node(s)",
                pod_id(pod),
                remaining.len()
            ),
        );
    }

    // Taints on every surviving node that some pod does not tolerate.
    for pod in &evictable {
        let tolerated_somewhere = remaining
            .iter()
            .any(|n| pod_tolerates_node(pod, n));
        if !tolerated_somewhere {
            return block(
                BlockReason::TolerationMismatch,
                format!(
                    "pod {} tolerates no other node's taints",
                    pod_id(pod)
                ),
            );
        }
    }

    // Node selectors / required affinity satisfied only by this node.
    for pod in &evictable {
        if !has_placement_constraints(pod) {
            continue;
        }
        let placeable = remaining.iter().any(|n| pod_matches_node(pod, n));
        if !placeable {
            return block(
                BlockReason::SelectorMismatch,
                format!(
                    "pod {} has a node selector or affinity satisfied only by {node_name}",
                    pod_id(pod)
                ),
            );
        }
    }

    SafetyVerdict::Allow
}

fn block(reason: BlockReason, description: String) -> SafetyVerdict {
    SafetyVerdict::Block {
        reason,
        description,
    }
}

/* ============================= LOCAL STORAGE ============================= */

/// Name of the first node-local volume on the pod, if any.
fn local_volume(pod: &Pod, snapshot: &ClusterSnapshot) -> Option<String> {
    let volumes = pod.spec.as_ref()?.volumes.as_ref()?;
    for volume in volumes {
        if volume.empty_dir.is_some() || volume.host_path.is_some() {
            return Some(volume.name.clone());
        }
        if let Some(claim) = &volume.persistent_volume_claim {
            let ns = pod.metadata.namespace.as_deref().unwrap_or_default();
            let key = format!("{ns}/{}", claim.claim_name);
            match snapshot.pvc_storage_classes.get(&key) {
                Some(Some(class)) => {
                    if snapshot.local_storage_classes.contains(class) {
                        return Some(volume.name.clone());
                    }
                }
                // Default class or failed lookup: unverifiable, fail closed.
                Some(None) | None => return Some(volume.name.clone()),
            }
        }
    }
    None
}

/* ============================= PDB MATCHING ============================= */

/// Budgets in the pod's namespace whose selector matches the pod's labels.
fn covering_pdbs<'a>(
    pod: &Pod,
    pdbs: &'a [PodDisruptionBudget],
) -> impl Iterator<Item = &'a PodDisruptionBudget> {
    let ns = pod.metadata.namespace.clone().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    pdbs.iter().filter(move |pdb| {
        pdb.metadata.namespace.as_deref() == Some(ns.as_str())
            && pdb
                .spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|sel| selector_matches(sel, &labels))
    })
}

/// Evaluate a label selector against a label set (`matchLabels` plus
/// `matchExpressions`). An empty selector matches everything, per API
/// convention.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            let value = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or(&[]);
            let ok = match expr.operator.as_str() {
                "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
                "NotIn" => value.is_none_or(|v| !values.iter().any(|x| x == v)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

/* ============================= CAPACITY ============================= */

/// First-fit decreasing over the remaining nodes; returns the first pod that
/// cannot be placed, or `None` when everything fits. DaemonSet and mirror
/// pods are excluded by the caller: their controllers re-place them without
/// consuming the headroom modeled here.
fn first_unplaceable<'a>(
    evictable: &[&'a Pod],
    remaining: &[&Node],
    snapshot: &ClusterSnapshot,
) -> Option<&'a Pod> {
    // Free capacity per remaining node: allocatable minus current requests.
    let mut free: Vec<(i64, i64)> = remaining
        .iter()
        .map(|node| {
            let (cpu_alloc, mem_alloc) = node_allocatable(node);
            let name = node.metadata.name.as_deref().unwrap_or_default();
            let (cpu_used, mem_used) = snapshot
                .pods_on(name)
                .iter()
                .filter(|p| !is_terminal_pod(p))
                .fold((0, 0), |(c, m), p| {
                    (
                        c + quantity::pod_cpu_request_millis(p),
                        m + quantity::pod_memory_request_bytes(p),
                    )
                });
            (cpu_alloc - cpu_used, mem_alloc - mem_used)
        })
        .collect();

    let mut pods: Vec<&Pod> = evictable.to_vec();
    pods.sort_by(|a, b| {
        let key = |p: &Pod| {
            (
                quantity::pod_cpu_request_millis(p),
                quantity::pod_memory_request_bytes(p),
            )
        };
        key(b).cmp(&key(a))
    });

    for pod in pods {
        let cpu = quantity::pod_cpu_request_millis(pod);
        let mem = quantity::pod_memory_request_bytes(pod);
        let slot = free
            .iter_mut()
            .find(|(free_cpu, free_mem)| *free_cpu >= cpu && *free_mem >= mem);
        match slot {
            Some((free_cpu, free_mem)) => {
                *free_cpu -= cpu;
                *free_mem -= mem;
            }
            None => return Some(pod),
        }
    }
    None
}

fn node_allocatable(node: &Node) -> (i64, i64) {
    let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else {
        return (0, 0);
    };
    (
        allocatable
            .get("cpu")
            .and_then(quantity::cpu_millis)
            .unwrap_or(0),
        allocatable
            .get("memory")
            .and_then(quantity::memory_bytes)
            .unwrap_or(0),
    )
}

/* ============================= TAINTS ============================= */

/// Whether the pod tolerates every scheduling-relevant taint on the node.
pub fn pod_tolerates_node(pod: &Pod, node: &Node) -> bool {
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or(&[]);
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or(&[]);

    taints
        .iter()
        .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        .all(|taint| tolerations.iter().any(|tol| toleration_matches(tol, taint)))
}

fn toleration_matches(tol: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = tol.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    let operator = tol.operator.as_deref().unwrap_or("Equal");
    match operator {
        "Exists" => match tol.key.as_deref() {
            None | Some("") => true,
            Some(key) => key == taint.key,
        },
        _ => {
            tol.key.as_deref() == Some(taint.key.as_str())
                && tol.value.as_deref().unwrap_or_default()
                    == taint.value.as_deref().unwrap_or_default()
        }
    }
}

/* ============================= SELECTORS ============================= */

fn has_placement_constraints(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    let has_selector = spec.node_selector.as_ref().is_some_and(|s| !s.is_empty());
    let has_affinity = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
        .is_some();
    has_selector || has_affinity
}

/// Whether the node satisfies the pod's `nodeSelector` and required
/// node-affinity terms.
pub fn pod_matches_node(pod: &Pod, node: &Node) -> bool {
    let empty = BTreeMap::new();
    let node_labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    let Some(spec) = pod.spec.as_ref() else {
        return true;
    };

    if let Some(selector) = &spec.node_selector {
        for (k, v) in selector {
            if node_labels.get(k) != Some(v) {
                return false;
            }
        }
    }

    let required = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref());
    if let Some(node_selector) = required {
        // Terms are ORed; requirements within a term are ANDed.
        let node_name = node.metadata.name.as_deref().unwrap_or_default();
        let matched = node_selector.node_selector_terms.iter().any(|term| {
            let exprs_ok = term.match_expressions.as_deref().unwrap_or(&[]).iter().all(
                |req| node_requirement_matches(req, node_labels),
            );
            let fields_ok = term.match_fields.as_deref().unwrap_or(&[]).iter().all(|req| {
                // Only metadata.name is a recognized field selector.
                let mut fields = BTreeMap::new();
                fields.insert("metadata.name".to_string(), node_name.to_string());
                node_requirement_matches(req, &fields)
            });
            exprs_ok && fields_ok
        });
        if !matched {
            return false;
        }
    }

    true
}

fn node_requirement_matches(
    req: &k8s_openapi::api::core::v1::NodeSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> bool {
    let value = labels.get(&req.key);
    let values = req.values.as_deref().unwrap_or(&[]);
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => value.is_none_or(|v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" => numeric_cmp(value, values, |a, b| a > b),
        "Lt" => numeric_cmp(value, values, |a, b| a < b),
        _ => false,
    }
}

fn numeric_cmp(value: Option<&String>, values: &[String], cmp: fn(i64, i64) -> bool) -> bool {
    let (Some(v), Some(bound)) = (value, values.first()) else {
        return false;
    };
    match (v.parse::<i64>(), bound.parse::<i64>()) {
        (Ok(a), Ok(b)) => cmp(a, b),
        _ => false,
    }
}

/* ============================= TESTS ============================= */
