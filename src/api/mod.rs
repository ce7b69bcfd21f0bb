//! CRD type definitions (spec.md §3, §6). Mirrors the `kaniop` /
//! `molnett-neon-operator` convention of deriving `kube::CustomResource`
//! directly on the `*Spec` struct with a companion `status` type.

pub mod cluster;
pub mod conditions;
pub mod ipam_types;
pub mod machine;
pub mod templates;
pub mod validation;

pub use cluster::{ProxmoxCluster, ProxmoxClusterSpec, ProxmoxClusterStatus};
pub use machine::{ProxmoxMachine, ProxmoxMachineSpec, ProxmoxMachineStatus};
pub use templates::{ProxmoxClusterTemplate, ProxmoxMachineTemplate};
