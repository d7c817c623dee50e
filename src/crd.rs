use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/* ============================= MEMBER PHASE ============================= */

/// Lifecycle phase of a managed VM.
///
/// Transitions are driven by the lifecycle watcher (up to `Ready`) and the
/// scale-down pipeline (`Ready` → `Draining` → `Deleting`). `Failed` is
/// terminal until an operator intervenes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MemberPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Ready,
    Draining,
    Deleting,
    Failed,
}

impl MemberPhase {
    /// Lowercase key used in `phaseTimestamps` and log fields.
    pub fn key(&self) -> &'static str {
        match self {
            MemberPhase::Pending => "pending",
            MemberPhase::Provisioning => "provisioning",
            MemberPhase::Running => "running",
            MemberPhase::Ready => "ready",
            MemberPhase::Draining => "draining",
            MemberPhase::Deleting => "deleting",
            MemberPhase::Failed => "failed",
        }
    }
}

/* ============================= NODE GROUP ============================= */

/// NodeGroup declares a pool of VPSie VMs managed as cluster nodes.
///
/// The operator scales the pool between `minSize` and `maxSize`; placement
/// fields describe where and what to provision.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "autoscaler.vpsie.io",
    version = "v1",
    kind = "NodeGroup",
    plural = "nodegroups",
    status = "NodeGroupStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Minimum number of members the group may shrink to.
    pub min_size: u32,

    /// Maximum number of members the group may grow to.
    pub max_size: u32,

    /// VPSie datacenter identifier for new VMs.
    pub datacenter_id: String,

    /// Acceptable VM offerings, in order of preference.
    pub offerings: Vec<String>,

    /// OS image used for new VMs.
    pub image: String,

    /// Kubernetes version members join with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

impl NodeGroupSpec {
    /// Structural validation beyond what the schema can express.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_size > self.max_size {
            return Err(format!(
                "minSize ({}) must not exceed maxSize ({})",
                self.min_size, self.max_size
            ));
        }
        Ok(())
    }
}

/// Per-member summary embedded in the group status.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberSummary {
    pub name: String,
    pub phase: MemberPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// Observed state of a NodeGroup, written through the status subresource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<MemberSummary>>,

    /// RFC 3339 timestamp of the last completed scale-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_up: Option<String>,

    /// RFC 3339 timestamp of the last provider-confirmed scale-down.
    /// The cooldown window is measured from this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_down: Option<String>,

    /// Reason code of the most recent safety rejection, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_blocked_reason: Option<String>,

    /// Human-readable summary of the last reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeGroupStatus {
    pub fn last_scale_down_time(&self) -> Option<DateTime<Utc>> {
        parse_rfc3339(self.last_scale_down.as_deref()?)
    }

    pub fn last_scale_up_time(&self) -> Option<DateTime<Utc>> {
        parse_rfc3339(self.last_scale_up.as_deref()?)
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl NodeGroup {
    /// Observed member count, falling back to zero before the first status write.
    pub fn current_count(&self) -> u32 {
        self.status
            .as_ref()
            .and_then(|s| s.current_count)
            .unwrap_or(0)
    }
}

/* ============================= NODE MEMBER ============================= */

/// NodeMember tracks one managed VM inside a NodeGroup.
///
/// Created by the scale-up path; the scale-down pipeline drives it through
/// `Draining` and `Deleting`, after which the lifecycle watcher garbage-
/// collects the record.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "autoscaler.vpsie.io",
    version = "v1",
    kind = "NodeMember",
    plural = "nodemembers",
    status = "NodeMemberStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodeMemberSpec {
    /// Provider VM identifier.
    pub vm_id: String,

    /// Name of the owning NodeGroup (same namespace).
    pub group: String,

    /// VM offering this member was provisioned with.
    pub offering: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeMemberStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MemberPhase>,

    /// Cluster node name once the VM has joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// RFC 3339 timestamp of each phase entry, keyed by phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_timestamps: Option<BTreeMap<String, String>>,

    /// Populated when the member enters `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl NodeMember {
    pub fn phase(&self) -> MemberPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn node_name(&self) -> Option<&str> {
        self.status.as_ref()?.node_name.as_deref()
    }

    /// When this member entered the given phase, if recorded.
    pub fn phase_entered(&self, phase: MemberPhase) -> Option<DateTime<Utc>> {
        let stamps = self.status.as_ref()?.phase_timestamps.as_ref()?;
        parse_rfc3339(stamps.get(phase.key())?)
    }
}

/* ============================= TESTS ============================= */
