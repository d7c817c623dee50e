#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{
    Container, Node, NodeCondition, NodeStatus, Pod, PodSpec, ResourceRequirements,
};
use k8s_openapi::api::policy::v1::{
    PodDisruptionBudget, PodDisruptionBudgetSpec, PodDisruptionBudgetStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use vpsie_autoscaler::cluster::{ClusterOps, EvictOutcome};
use vpsie_autoscaler::crd::{
    MemberPhase, NodeGroup, NodeGroupSpec, NodeGroupStatus, NodeMember, NodeMemberSpec,
    NodeMemberStatus,
};
use vpsie_autoscaler::provider::{ProviderError, VmProvider};
use vpsie_autoscaler::safety::ClusterSnapshot;
use vpsie_autoscaler::utilization::{MetricsSource, NodeUsage};

/* ============================= BUILDERS ============================= */

pub fn btree(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A Ready node with the given allocatable.
pub fn make_test_node(name: &str, cpu: &str, memory: &str) -> Node {
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
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A running pod bound to `node` with the given requests and labels.
pub fn make_test_pod(
    name: &str,
    namespace: &str,
    node: &str,
    cpu_request: &str,
    memory_request: &str,
    labels: &[(&str, &str)],
) -> Pod {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(cpu_request.to_string()));
    requests.insert("memory".to_string(), Quantity(memory_request.to_string()));
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: if labels.is_empty() {
                None
            } else {
                Some(btree(labels))
            },
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn make_group(name: &str, min: u32, max: u32, current: u32) -> NodeGroup {
    NodeGroup {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("vpsie-system".to_string()),
            ..Default::default()
        },
        spec: NodeGroupSpec {
            min_size: min,
            max_size: max,
            datacenter_id: "dc-fra-1".to_string(),
            offerings: vec!["standard-4".to_string()],
            image: "ubuntu-22.04".to_string(),
            kubernetes_version: None,
        },
        status: Some(NodeGroupStatus {
            current_count: Some(current),
            ..Default::default()
        }),
    }
}

pub fn make_member(name: &str, group: &str, node: &str, phase: MemberPhase) -> NodeMember {
    let mut member = NodeMember::new(
        name,
        NodeMemberSpec {
            vm_id: format!("vm-{name}"),
            group: group.to_string(),
            offering: "standard-4".to_string(),
        },
    );
    member.metadata.namespace = Some("vpsie-system".to_string());
    member.status = Some(NodeMemberStatus {
        phase: Some(phase),
        node_name: Some(node.to_string()),
        phase_timestamps: None,
        failure_reason: None,
    });
    member
}

/* ============================= MOCK CLUSTER ============================= */

/// Scripted response for evictions of one pod.
#[derive(Debug, Clone)]
pub enum EvictPlan {
    Ok,
    Gone,
    PdbBlocked,
    TransientThenOk { failures: u32 },
    Fatal,
}

#[derive(Default)]
pub struct MockClusterState {
    pub members: Vec<NodeMember>,
    pub snapshot: ClusterSnapshot,
    pub pods_on_node: HashMap<String, Vec<Pod>>,
    /// Eviction behavior per pod name; missing entries evict cleanly.
    pub evict_plans: HashMap<String, EvictPlan>,
    pub cordoned: HashSet<String>,
    /// Ordered record of cordon/uncordon/evict calls.
    pub events: Vec<String>,
    /// Last phase written per member, with the optional failure reason.
    pub phases: HashMap<String, (MemberPhase, Option<String>)>,
    pub fail_cordon: bool,
}

#[derive(Clone, Default)]
pub struct MockCluster {
    pub state: Arc<Mutex<MockClusterState>>,
}

impl MockCluster {
    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn is_cordoned(&self, node: &str) -> bool {
        self.state.lock().unwrap().cordoned.contains(node)
    }

    pub fn phase_of(&self, member: &str) -> Option<(MemberPhase, Option<String>)> {
        self.state.lock().unwrap().phases.get(member).cloned()
    }
}

impl ClusterOps for MockCluster {
    fn list_group_members<'a>(
        &'a self,
        _namespace: &'a str,
        group: &'a str,
    ) -> futures::future::BoxFuture<'a, anyhow::Result<Vec<NodeMember>>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .members
                .iter()
                .filter(|m| m.spec.group == group)
                .cloned()
                .collect())
        })
    }

    fn group_snapshot<'a>(
        &'a self,
        _node_names: &'a [String],
    ) -> futures::future::BoxFuture<'a, anyhow::Result<ClusterSnapshot>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().snapshot.clone()) })
    }

    fn list_pods_on_node<'a>(
        &'a self,
        node: &'a str,
    ) -> futures::future::BoxFuture<'a, anyhow::Result<Vec<Pod>>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .pods_on_node
                .get(node)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn cordon<'a>(&'a self, node: &'a str) -> futures::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_cordon {
                anyhow::bail!("cordon refused by test");
            }
            state.cordoned.insert(node.to_string());
            state.events.push(format!("cordon:{node}"));
            Ok(())
        })
    }

    fn uncordon<'a>(&'a self, node: &'a str) -> futures::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.cordoned.remove(node);
            state.events.push(format!("uncordon:{node}"));
            Ok(())
        })
    }

    fn evict_pod<'a>(
        &'a self,
        _namespace: &'a str,
        name: &'a str,
    ) -> futures::future::BoxFuture<'a, EvictOutcome> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.events.push(format!("evict:{name}"));
            let plan = state.evict_plans.get(name).cloned().unwrap_or(EvictPlan::Ok);
            match plan {
                EvictPlan::Ok => {
                    remove_pod(&mut state, name);
                    EvictOutcome::Evicted
                }
                EvictPlan::Gone => EvictOutcome::Gone,
                EvictPlan::PdbBlocked => EvictOutcome::PdbBlocked,
                EvictPlan::TransientThenOk { failures } => {
                    if failures == 0 {
                        remove_pod(&mut state, name);
                        EvictOutcome::Evicted
                    } else {
                        state
                            .evict_plans
                            .insert(name.to_string(), EvictPlan::TransientThenOk {
                                failures: failures - 1,
                            });
                        EvictOutcome::Transient("injected 503".to_string())
                    }
                }
                EvictPlan::Fatal => EvictOutcome::Fatal("injected rejection".to_string()),
            }
        })
    }

    fn set_member_phase<'a>(
        &'a self,
        _namespace: &'a str,
        member: &'a str,
        phase: MemberPhase,
        reason: Option<String>,
    ) -> futures::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.state
                .lock()
                .unwrap()
                .phases
                .insert(member.to_string(), (phase, reason));
            Ok(())
        })
    }
}

fn remove_pod(state: &mut MockClusterState, name: &str) {
    for pods in state.pods_on_node.values_mut() {
        pods.retain(|p| p.metadata.name.as_deref() != Some(name));
    }
}

/* ============================= MOCK PROVIDER ============================= */

#[derive(Default)]
pub struct MockProviderState {
    /// Responses popped per call; empty means success.
    pub script: VecDeque<Result<(), ProviderError>>,
    pub calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockProvider {
    pub state: Arc<Mutex<MockProviderState>>,
}

impl MockProvider {
    pub fn scripted(script: Vec<Result<(), ProviderError>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockProviderState {
                script: script.into(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl VmProvider for MockProvider {
    async fn delete_vm(&self, vm_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(vm_id.to_string());
        state.script.pop_front().unwrap_or(Ok(()))
    }
}

/* ============================= MOCK METRICS ============================= */

#[derive(Clone, Default)]
pub struct MockMetrics {
    pub usage: Arc<Mutex<HashMap<String, NodeUsage>>>,
}

impl MockMetrics {
    pub fn with_usage(entries: &[(&str, i64, i64)]) -> Self {
        let usage = entries
            .iter()
            .map(|(name, cpu, mem)| {
                (
                    name.to_string(),
                    NodeUsage {
                        cpu_millicores: *cpu,
                        memory_bytes: *mem,
                    },
                )
            })
            .collect();
        Self {
            usage: Arc::new(Mutex::new(usage)),
        }
    }
}

impl MetricsSource for MockMetrics {
    async fn node_usage(&self, node: &str) -> Option<NodeUsage> {
        self.usage.lock().unwrap().get(node).copied()
    }
}

/* ============================= PDB BUILDER ============================= */

pub fn make_pdb(
    name: &str,
    namespace: &str,
    match_labels: &[(&str, &str)],
    disruptions_allowed: i32,
) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(btree(match_labels)),
                match_expressions: None,
            }),
            ..Default::default()
        }),
        status: Some(PodDisruptionBudgetStatus {
            disruptions_allowed,
            ..Default::default()
        }),
    }
}
