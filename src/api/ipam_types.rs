//! Types for the external in-cluster IPAM provider (the `ipam.cluster.x-k8s.io`
//! group) that this system authors claims against and reads addresses from
//! (spec.md §4.4). These CRDs are not reconciled here — no controller in
//! this crate owns their lifecycle — but `kube::CustomResource` still gives
//! us a typed `Api<T>` to create/list/delete them, mirroring how the
//! teacher's code treats any resource it talks to but doesn't own.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const IPAM_GROUP: &str = "ipam.cluster.x-k8s.io";
pub const IPAM_VERSION: &str = "v1beta1";

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpamPoolRef {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "IPAddressClaim",
    plural = "ipaddressclaims",
    namespaced,
    status = "IPAddressClaimStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimSpec {
    pub pool_ref: IpamPoolRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_ref: Option<LocalObjectRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectRef {
    pub name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "IPAddress",
    plural = "ipaddresses",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressSpec {
    pub claim_ref: LocalObjectRef,
    pub pool_ref: IpamPoolRef,
    pub address: String,
    pub prefix: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Namespaced address pool.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "InClusterIPPool",
    plural = "inclusterippools",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InClusterIPPoolSpec {
    pub addresses: Vec<String>,
    pub prefix: u8,
    pub gateway: String,
}

/// Cluster-scoped address pool (no namespace).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "GlobalInClusterIPPool",
    plural = "globalinclusterippools"
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalInClusterIPPoolSpec {
    pub addresses: Vec<String>,
    pub prefix: u8,
    pub gateway: String,
}

pub const ANNOTATION_METRIC: &str = "infrastructure.proxmox.cluster.x-k8s.io/metric";
pub const ANNOTATION_FAMILY: &str = "infrastructure.proxmox.cluster.x-k8s.io/family";
pub const ANNOTATION_POOL_INDEX: &str = "infrastructure.proxmox.cluster.x-k8s.io/pool-index";
pub const LABEL_CLUSTER_NAME: &str = "cluster.x-k8s.io/cluster-name";
