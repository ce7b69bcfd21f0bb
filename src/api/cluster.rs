//! `ProxmoxCluster` — desired and observed state for one Kubernetes
//! cluster (spec.md §3).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The `ProxmoxCluster` custom resource ties a Cluster API `Cluster` to a
/// Proxmox VE deployment: which nodes may host VMs, the address pools new
/// machines draw from, and the control-plane endpoint consumers connect to.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ProxmoxCluster",
    plural = "proxmoxclusters",
    singular = "proxmoxcluster",
    shortname = "pxc",
    namespaced,
    status = "ProxmoxClusterStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterSpec {
    pub control_plane_endpoint: ControlPlaneEndpoint,

    /// Cluster API sets this once an external control plane has taken
    /// over lifecycle management; the reconciler still accounts pools and
    /// the node ledger, but no longer mutates the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_managed: Option<bool>,

    /// Proxmox nodes machines in this cluster may be scheduled to, unless
    /// overridden per-machine. Empty means "the template's source node".
    #[serde(default)]
    pub allowed_nodes: Vec<String>,

    #[serde(default)]
    pub scheduler_hints: SchedulerHints,

    /// One entry per deployment zone. At least one zone is required, and
    /// each zone must set at least one of `ipv4_config`/`ipv6_config`.
    pub zones: Vec<ZoneConfig>,

    /// Nameservers handed to every machine unless overridden per-NIC.
    /// Must contain at least one entry.
    pub dns_servers: Vec<String>,

    /// Per machine-type clone templates used when a `ProxmoxMachine` omits
    /// its own `templateSource`.
    #[serde(default)]
    pub clone_spec: Option<CloneSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<Vec<String>>,

    pub credentials_secret_ref: SecretRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneEndpoint {
    /// IP literal or FQDN.
    pub host: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerHints {
    /// Percentage of node memory considered reservable. 0 disables the
    /// memory check entirely (the scheduler always returns the full
    /// total as reservable). Default 100.
    #[serde(default = "default_memory_adjustment")]
    pub memory_adjustment_percentage: u8,
}

impl Default for SchedulerHints {
    fn default() -> Self {
        Self {
            memory_adjustment_percentage: default_memory_adjustment(),
        }
    }
}

fn default_memory_adjustment() -> u8 {
    100
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_config: Option<AddressPoolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_config: Option<AddressPoolConfig>,
}

/// Addresses as individual IPs, `a-b` ranges, or CIDRs — exactly the
/// address-string forms an in-cluster IPAM `InClusterIPPool` accepts.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddressPoolConfig {
    pub addresses: Vec<String>,
    pub prefix: u8,
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloneSpec {
    pub machine_spec: Vec<MachineTypeTemplate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTypeTemplate {
    /// e.g. "controlPlane" or "worker". Admission requires at least one
    /// entry with `machineType == "controlPlane"`.
    pub machine_type: String,
    pub template: crate::api::machine::TemplateSource,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterStatus {
    #[serde(default)]
    pub ready: bool,

    /// Pool object references created per `(zone, family)`.
    #[serde(default)]
    pub zone_pools: Vec<ZonePoolRefs>,

    #[serde(default)]
    pub node_location: NodeLocationLedger,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ZonePoolRefs {
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_pool: Option<PoolObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_pool: Option<PoolObjectRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolObjectRef {
    pub kind: String,
    pub name: String,
}

/// The eventually-consistent projection of which Proxmox node currently
/// hosts each machine, split by CAPI role.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocationLedger {
    #[serde(default)]
    pub control_plane: Vec<NodeLocationEntry>,
    #[serde(default)]
    pub workers: Vec<NodeLocationEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocationEntry {
    pub machine_name: String,
    pub proxmox_node: String,
    pub zone: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineRole {
    ControlPlane,
    Worker,
}

impl MachineRole {
    /// The `machineType` string a `CloneSpec` entry uses for this role.
    pub fn clone_spec_key(self) -> &'static str {
        match self {
            MachineRole::ControlPlane => "controlPlane",
            MachineRole::Worker => "worker",
        }
    }
}

impl NodeLocationLedger {
    fn list_mut(&mut self, role: MachineRole) -> &mut Vec<NodeLocationEntry> {
        match role {
            MachineRole::ControlPlane => &mut self.control_plane,
            MachineRole::Worker => &mut self.workers,
        }
    }

    fn list(&self, role: MachineRole) -> &Vec<NodeLocationEntry> {
        match role {
            MachineRole::ControlPlane => &self.control_plane,
            MachineRole::Worker => &self.workers,
        }
    }

    /// Idempotently records (or updates) `machine_name`'s location under
    /// `role`. Returns whether the ledger changed, so callers can decide
    /// whether a status patch is needed.
    pub fn upsert(&mut self, role: MachineRole, machine_name: &str, proxmox_node: &str, zone: &str) -> bool {
        // A machine only ever occupies one role; remove any stale entry
        // under the other role first (e.g. a machine's role changed).
        let other = match role {
            MachineRole::ControlPlane => MachineRole::Worker,
            MachineRole::Worker => MachineRole::ControlPlane,
        };
        let mut changed = self.remove_from(other, machine_name);

        let list = self.list_mut(role);
        if let Some(entry) = list.iter_mut().find(|e| e.machine_name == machine_name) {
            if entry.proxmox_node != proxmox_node || entry.zone != zone {
                entry.proxmox_node = proxmox_node.to_string();
                entry.zone = zone.to_string();
                changed = true;
            }
        } else {
            list.push(NodeLocationEntry {
                machine_name: machine_name.to_string(),
                proxmox_node: proxmox_node.to_string(),
                zone: zone.to_string(),
            });
            changed = true;
        }
        changed
    }

    fn remove_from(&mut self, role: MachineRole, machine_name: &str) -> bool {
        let list = self.list_mut(role);
        let before = list.len();
        list.retain(|e| e.machine_name != machine_name);
        before != list.len()
    }

    /// Removes `machine_name` from the ledger entirely, returning whether
    /// anything changed.
    pub fn remove(&mut self, machine_name: &str) -> bool {
        let a = self.remove_from(MachineRole::ControlPlane, machine_name);
        let b = self.remove_from(MachineRole::Worker, machine_name);
        a || b
    }

    /// Count of machines of `role` currently hosted on `node`, used by the
    /// scheduler's even-spread tie-break.
    pub fn count_on_node(&self, role: MachineRole, node: &str) -> usize {
        self.list(role).iter().filter(|e| e.proxmox_node == node).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_upsert_is_idempotent() {
        let mut ledger = NodeLocationLedger::default();
        assert!(ledger.upsert(MachineRole::Worker, "m1", "pve1", "zone-a"));
        assert!(!ledger.upsert(MachineRole::Worker, "m1", "pve1", "zone-a"));
        assert_eq!(ledger.workers.len(), 1);
        assert_eq!(ledger.count_on_node(MachineRole::Worker, "pve1"), 1);
    }

    #[test]
    fn ledger_moves_role_on_upsert() {
        let mut ledger = NodeLocationLedger::default();
        ledger.upsert(MachineRole::Worker, "m1", "pve1", "zone-a");
        ledger.upsert(MachineRole::ControlPlane, "m1", "pve1", "zone-a");
        assert!(ledger.workers.is_empty());
        assert_eq!(ledger.control_plane.len(), 1);
    }

    #[test]
    fn ledger_remove() {
        let mut ledger = NodeLocationLedger::default();
        ledger.upsert(MachineRole::Worker, "m1", "pve1", "zone-a");
        assert!(ledger.remove("m1"));
        assert!(!ledger.remove("m1"));
    }
}
