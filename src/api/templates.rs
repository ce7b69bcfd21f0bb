//! `ProxmoxClusterTemplate` / `ProxmoxMachineTemplate` — CAPI's usual
//! "stamp out a spec" kinds, named in spec.md §6 but not detailed further.
//! They carry no independent reconciler: the out-of-scope upstream CAPI
//! controllers clone their embedded spec onto a fresh `ProxmoxCluster` /
//! `ProxmoxMachine` (see SPEC_FULL.md §2.6).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster::ProxmoxClusterSpec;
use super::machine::ProxmoxMachineSpec;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ProxmoxClusterTemplate",
    plural = "proxmoxclustertemplates",
    singular = "proxmoxclustertemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterTemplateSpec {
    pub template: ClusterTemplateResource,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplateResource {
    pub spec: ProxmoxClusterSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ProxmoxMachineTemplate",
    plural = "proxmoxmachinetemplates",
    singular = "proxmoxmachinetemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineTemplateSpec {
    pub template: MachineTemplateResource,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateResource {
    pub spec: ProxmoxMachineSpec,
}
