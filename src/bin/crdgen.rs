//! Emits the CRD manifests for all four resource kinds as YAML on stdout.
//!
//! cargo run --bin crdgen | kubectl apply -f -

use kube::CustomResourceExt;
use proxmox_capi::api::{ProxmoxCluster, ProxmoxClusterTemplate, ProxmoxMachine, ProxmoxMachineTemplate};

fn main() -> anyhow::Result<()> {
    let crds = vec![
        serde_yaml::to_string(&ProxmoxCluster::crd())?,
        serde_yaml::to_string(&ProxmoxMachine::crd())?,
        serde_yaml::to_string(&ProxmoxClusterTemplate::crd())?,
        serde_yaml::to_string(&ProxmoxMachineTemplate::crd())?,
    ];
    print!("{}", crds.join("---\n"));
    Ok(())
}
