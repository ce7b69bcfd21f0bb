//! `ProxmoxMachine` — desired and observed state for one VM (spec.md §3).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ProxmoxMachine",
    plural = "proxmoxmachines",
    singular = "proxmoxmachine",
    shortname = "pxm",
    namespaced,
    status = "ProxmoxMachineStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.proxmoxNode"}"#,
    printcolumn = r#"{"name":"VMID","type":"integer","jsonPath":".spec.vmId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineSpec {
    /// Omit to fall back to the owning `ProxmoxCluster`'s `cloneSpec` entry
    /// for this machine's role (spec.md §3's cluster-level template
    /// fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_source: Option<TemplateSource>,

    #[serde(default)]
    pub clone_flags: CloneFlags,

    pub cpu: CpuSpec,

    /// Must be a multiple of 8.
    pub memory_mib: u32,

    pub disks: DiskSpec,

    /// At least one NIC, named `net0`..`netN-1` with consecutive indices.
    pub network: Vec<NetworkDevice>,

    #[serde(default)]
    pub vrfs: Vec<VrfDevice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id_range: Option<VmIdRange>,

    #[serde(default)]
    pub skip_checks: SkipChecks,

    #[serde(default)]
    pub metadata_settings: MetadataSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_nodes: Option<Vec<String>>,

    /// Immutable after create. Lowercase, deduplicated, `^[a-z0-9_][a-z0-9_\-\+\.]*$`.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Populated by the placement scheduler (§4.2) and never by a caller;
    /// `-1` (or absent) means "not yet assigned". Written back optimistically
    /// so the pick survives reconciler restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_data_secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSource {
    /// Set together with `template_id` for explicit-ID mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i64>,

    /// Set alone for tag-selector mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_selector: Option<TemplateSelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSelector {
    pub match_tags: Vec<String>,

    /// Caller-supplied: true when the matched templates live on local
    /// (per-node) storage and the resolver must return one template ID
    /// per allowed node instead of a single cluster-wide one (spec.md §4.3).
    #[serde(default)]
    pub local_storage: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloneFlags {
    #[serde(default = "default_true")]
    pub full: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_name: Option<String>,
}

impl Default for CloneFlags {
    fn default() -> Self {
        Self {
            full: true,
            storage: None,
            format: None,
            target: None,
            snap_name: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    pub sockets: u32,
    pub cores: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub boot_volume: BootVolume,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootVolume {
    /// Immutable. Must be >= 5 GiB.
    pub size_gib: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum NicModel {
    #[default]
    Virtio,
    E1000,
    Rtl8139,
    Vmxnet3,
}

impl NicModel {
    pub fn as_proxmox_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::Rtl8139 => "rtl8139",
            NicModel::Vmxnet3 => "vmxnet3",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    /// One of `InClusterIPPool`, `GlobalInClusterIPPool`.
    pub kind: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<u32>,
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDevice {
    /// `net0`, `net1`, ... consecutive starting at 0.
    pub name: String,
    pub bridge: String,
    #[serde(default)]
    pub model: NicModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    /// `1` (inherit) or `576..=65520`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub default_ipv4: bool,
    #[serde(default)]
    pub default_ipv6: bool,
    #[serde(default)]
    pub ip_pool_refs: Vec<PoolRef>,
    #[serde(default)]
    pub routing_policies: Vec<RoutingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_servers: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VrfDevice {
    pub name: String,
    /// `1..=4294967295`, excluding `254`/`255`.
    pub table: u32,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub routing_policies: Vec<RoutingPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmIdRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SkipChecks {
    #[serde(default)]
    pub qemu_agent: bool,
    #[serde(default)]
    pub cloud_init: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSettings {
    #[serde(default = "default_true")]
    pub inject_provider_id: bool,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            inject_provider_id: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub addresses: Vec<NetworkAddresses>,

    #[serde(default)]
    pub vm_state: VmState,

    #[serde(default)]
    pub bootstrap_data_provided: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxmox_node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,

    /// Which phase submitted `task_ref`, so a restarted reconciler knows
    /// what to do once it observes completion instead of re-deriving it
    /// from VM state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_kind: Option<TaskKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAddresses {
    pub device: String,
    #[serde(default)]
    pub v4: Vec<String>,
    #[serde(default)]
    pub v6: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    NotFound,
    Pending,
    Ready,
}

/// The phase that submitted the in-flight Proxmox task in
/// `status.taskRef`. Lets a restarted reconciler resume awaiting the
/// right task instead of guessing from current VM state (spec.md §4.1,
/// §5's cancellation/resume guarantee).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    Clone,
    Configure,
    Resize,
    Start,
    Delete,
}

impl ProxmoxMachineSpec {
    pub fn has_failed(status: &ProxmoxMachineStatus) -> bool {
        status.failure_reason.is_some() || status.failure_message.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nic_model_default_is_virtio() {
        assert_eq!(NicModel::default(), NicModel::Virtio);
        assert_eq!(NicModel::Virtio.as_proxmox_str(), "virtio");
    }

    #[test]
    fn clone_flags_default_is_full_true() {
        assert!(CloneFlags::default().full);
    }
}
