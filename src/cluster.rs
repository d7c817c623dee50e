//! Cluster API capability consumed by the scale-down pipeline.
//!
//! The core depends on [`ClusterOps`], not on `kube::Client` directly, so the
//! drain and termination protocols can be driven end-to-end in tests.
//! [`KubeClusterOps`] is the production implementation.

use anyhow::{Context, Result};
use futures::future;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::crd::{MemberPhase, NodeMember};
use crate::safety::ClusterSnapshot;

pub const FIELD_MANAGER: &str = "vpsie-autoscaler";

/// Provisioners whose volumes are pinned to one node.
const LOCAL_PROVISIONERS: &[&str] = &[
    "kubernetes.io/no-provisioner",
    "rancher.io/local-path",
    "openebs.io/local",
];

/* ============================= EVICTION OUTCOME ============================= */

/// Classified result of one eviction request.
#[derive(Debug, Clone, PartialEq)]
pub enum EvictOutcome {
    Evicted,
    /// 429: granting the eviction would violate a disruption budget.
    PdbBlocked,
    /// 404: the pod is already gone, which is what we wanted.
    Gone,
    /// 5xx or connection-level failure; worth retrying.
    Transient(String),
    /// Definitive rejection; retrying cannot help.
    Fatal(String),
}

pub fn classify_evict_error(err: kube::Error) -> EvictOutcome {
    match err {
        kube::Error::Api(ae) => match ae.code {
            429 => EvictOutcome::PdbBlocked,
            404 => EvictOutcome::Gone,
            500..=599 => EvictOutcome::Transient(ae.to_string()),
            _ => EvictOutcome::Fatal(ae.to_string()),
        },
        other => EvictOutcome::Transient(other.to_string()),
    }
}

/* ============================= CAPABILITY ============================= */

/// Cluster operations the scale-down core needs. Implementations must be
/// cheap to clone; the drain guard clones one into its cleanup task.
pub trait ClusterOps: Clone + Send + Sync + 'static {
    fn list_group_members<'a>(
        &'a self,
        namespace: &'a str,
        group: &'a str,
    ) -> BoxFuture<'a, Result<Vec<NodeMember>>>;

    /// Assemble the immutable evaluation snapshot for the given member nodes.
    fn group_snapshot<'a>(&'a self, node_names: &'a [String]) -> BoxFuture<'a, Result<ClusterSnapshot>>;

    fn list_pods_on_node<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<Vec<Pod>>>;

    fn cordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<()>>;

    fn uncordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<()>>;

    fn evict_pod<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, EvictOutcome>;

    fn set_member_phase<'a>(
        &'a self,
        namespace: &'a str,
        member: &'a str,
        phase: MemberPhase,
        reason: Option<String>,
    ) -> BoxFuture<'a, Result<()>>;
}

/* ============================= KUBE IMPLEMENTATION ============================= */

#[derive(Clone)]
pub struct KubeClusterOps {
    client: Client,
}

impl KubeClusterOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ClusterOps for KubeClusterOps {
    fn list_group_members<'a>(
        &'a self,
        namespace: &'a str,
        group: &'a str,
    ) -> BoxFuture<'a, Result<Vec<NodeMember>>> {
        Box::pin(async move {
            let members: Api<NodeMember> = Api::namespaced(self.client.clone(), namespace);
            let list = members
                .list(&ListParams::default())
                .await
                .context("listing node members")?;
            Ok(list
                .items
                .into_iter()
                .filter(|m| m.spec.group == group)
                .collect())
        })
    }

    fn group_snapshot<'a>(&'a self, node_names: &'a [String]) -> BoxFuture<'a, Result<ClusterSnapshot>> {
        Box::pin(async move {
            let nodes_api: Api<Node> = Api::all(self.client.clone());
            let nodes: Vec<Node> = nodes_api
                .list(&ListParams::default())
                .await
                .context("listing nodes")?
                .items
                .into_iter()
                .filter(|n| {
                    n.metadata
                        .name
                        .as_ref()
                        .is_some_and(|name| node_names.contains(name))
                        && is_node_ready(n)
                })
                .collect();

            let mut pods_by_node = HashMap::new();
            for node in &nodes {
                let name = node.name_any();
                let pods = self.list_pods_on_node(&name).await?;
                pods_by_node.insert(name, pods);
            }

            let pdbs_api: Api<PodDisruptionBudget> = Api::all(self.client.clone());
            let pdbs = pdbs_api
                .list(&ListParams::default())
                .await
                .context("listing disruption budgets")?
                .items;

            let local_storage_classes = self.local_storage_classes().await?;
            let pvc_storage_classes = self.resolve_pvcs(&pods_by_node).await;

            Ok(ClusterSnapshot {
                nodes,
                pods_by_node,
                pdbs,
                pvc_storage_classes,
                local_storage_classes,
            })
        })
    }

    fn list_pods_on_node<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<Vec<Pod>>> {
        Box::pin(async move {
            let pods: Api<Pod> = Api::all(self.client.clone());
            let list = pods
                .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
                .await
                .with_context(|| format!("listing pods on node {node}"))?;
            Ok(list.items)
        })
    }

    fn cordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let nodes: Api<Node> = Api::all(self.client.clone());
            nodes
                .cordon(node)
                .await
                .with_context(|| format!("cordoning node {node}"))?;
            Ok(())
        })
    }

    fn uncordon<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let nodes: Api<Node> = Api::all(self.client.clone());
            nodes
                .uncordon(node)
                .await
                .with_context(|| format!("uncordoning node {node}"))?;
            Ok(())
        })
    }

    fn evict_pod<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, EvictOutcome> {
        Box::pin(async move {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            match pods.evict(name, &EvictParams::default()).await {
                Ok(_) => EvictOutcome::Evicted,
                Err(e) => classify_evict_error(e),
            }
        })
    }

    fn set_member_phase<'a>(
        &'a self,
        namespace: &'a str,
        member: &'a str,
        phase: MemberPhase,
        reason: Option<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let members: Api<NodeMember> = Api::namespaced(self.client.clone(), namespace);
            let now = chrono::Utc::now().to_rfc3339();
            let mut timestamps = serde_json::Map::new();
            timestamps.insert(phase.key().to_string(), serde_json::Value::String(now));
            let mut status = serde_json::json!({ "phase": phase });
            status["phaseTimestamps"] = serde_json::Value::Object(timestamps);
            if let Some(reason) = reason {
                status["failureReason"] = serde_json::Value::String(reason);
            }
            members
                .patch_status(
                    member,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&serde_json::json!({ "status": status })),
                )
                .await
                .with_context(|| format!("updating phase of member {member}"))?;
            debug!(member = %member, phase = phase.key(), "member_phase_updated");
            Ok(())
        })
    }
}

impl KubeClusterOps {
    async fn local_storage_classes(&self) -> Result<HashSet<String>> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let list = classes
            .list(&ListParams::default())
            .await
            .context("listing storage classes")?;
        Ok(list
            .items
            .into_iter()
            .filter(|sc| LOCAL_PROVISIONERS.contains(&sc.provisioner.as_str()))
            .filter_map(|sc| sc.metadata.name)
            .collect())
    }

    /// Resolve the StorageClass of every PVC referenced by the given pods.
    /// Claims whose lookup fails stay absent from the map, which downstream
    /// treats as node-local.
    async fn resolve_pvcs(
        &self,
        pods_by_node: &HashMap<String, Vec<Pod>>,
    ) -> HashMap<String, Option<String>> {
        let mut claims: HashSet<(String, String)> = HashSet::new();
        for pod in pods_by_node.values().flatten() {
            let ns = pod.metadata.namespace.clone().unwrap_or_default();
            let volumes = pod.spec.as_ref().and_then(|s| s.volumes.as_deref());
            for volume in volumes.unwrap_or(&[]) {
                if let Some(pvc) = &volume.persistent_volume_claim {
                    claims.insert((ns.clone(), pvc.claim_name.clone()));
                }
            }
        }

        let lookups = claims.into_iter().map(|(ns, name)| {
            let client = self.client.clone();
            async move {
                let api: Api<PersistentVolumeClaim> = Api::namespaced(client, &ns);
                match api.get(&name).await {
                    Ok(pvc) => {
                        let class = pvc.spec.and_then(|s| s.storage_class_name);
                        Some((format!("{ns}/{name}"), class))
                    }
                    Err(e) => {
                        warn!(claim = %format!("{ns}/{name}"), error = %e, "pvc_lookup_failed");
                        None
                    }
                }
            }
        });

        future::join_all(lookups).await.into_iter().flatten().collect()
    }
}

/* ============================= METRICS SOURCE ============================= */

/// Node usage from the `metrics.k8s.io` aggregated API (metrics-server).
/// The API group has no typed bindings, so readings go through
/// [`DynamicObject`].
#[derive(Clone)]
pub struct MetricsApiSource {
    client: Client,
}

impl MetricsApiSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<kube::api::DynamicObject> {
        let gvk = kube::core::GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics");
        let resource = kube::api::ApiResource::from_gvk_with_plural(&gvk, "nodes");
        Api::all_with(self.client.clone(), &resource)
    }
}

impl crate::utilization::MetricsSource for MetricsApiSource {
    async fn node_usage(&self, node: &str) -> Option<crate::utilization::NodeUsage> {
        let object = match self.api().get(node).await {
            Ok(object) => object,
            Err(e) => {
                debug!(node = %node, error = %e, "node_metrics_unavailable");
                return None;
            }
        };
        let usage = object.data.get("usage")?;
        let cpu = usage.get("cpu")?.as_str()?;
        let memory = usage.get("memory")?.as_str()?;
        Some(crate::utilization::NodeUsage {
            cpu_millicores: crate::quantity::parse_cpu_str(cpu)?,
            memory_bytes: crate::quantity::parse_memory_str(memory)?,
        })
    }
}

/* ============================= NODE STATE ============================= */

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn is_node_cordoned(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/* ============================= TESTS ============================= */
