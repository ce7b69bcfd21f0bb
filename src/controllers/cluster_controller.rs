//! ClusterReconciler (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{error, info, warn};

use super::context::Context;
use crate::api::cluster::{MachineRole, ProxmoxCluster, ProxmoxClusterStatus};
use crate::api::conditions::{self, PAUSED, PROXMOX_AVAILABLE, READY, STATUS_FALSE, STATUS_TRUE, VM_PROVISIONED};
use crate::api::ipam_types::LABEL_CLUSTER_NAME;
use crate::api::machine::ProxmoxMachine;
use crate::errors::{Error, Result};
use crate::ipam;

pub const FINALIZER: &str = "infrastructure.proxmox.cluster.x-k8s.io/cluster-protection";
const FIELD_MANAGER: &str = "proxmox-capi-manager";

pub async fn run(ctx: Arc<Context>) {
    let clusters: Api<ProxmoxCluster> = Api::all(ctx.client.clone());
    if let Err(e) = clusters.list(&Default::default()).await {
        error!("ProxmoxCluster CRD is not queryable: {e:?}. Is it installed?");
        std::process::exit(1);
    }

    Controller::new(clusters, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(cluster: Arc<ProxmoxCluster>, ctx: Arc<Context>) -> Result<Action> {
    let _permit = ctx.cluster_concurrency.clone().acquire_owned().await.expect("semaphore never closed");
    let _timer = ctx.metrics.count_and_measure("cluster");
    ctx.diagnostics.write().await.last_event = chrono::Utc::now();

    let ns = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let clusters: Api<ProxmoxCluster> = Api::namespaced(ctx.client.clone(), &ns);

    info!(cluster = %cluster.name_any(), namespace = %ns, "reconciling cluster");

    let result = finalizer(&clusters, FINALIZER, cluster.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => apply(&cluster, ctx.clone()).await,
            FinalizerEvent::Cleanup(cluster) => cleanup(&cluster, ctx.clone()).await,
        }
    })
    .await;

    if let Err(FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e)) = &result {
        if e.is_terminal() {
            report_terminal_failure(&cluster, &ctx, e).await?;
        }
    }

    result.map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Patches `status.failureReason`/`status.failureMessage` and the `Ready`
/// condition, and emits a `Warning` event, for a terminal error coming out
/// of `apply`/`cleanup` (spec.md §7's two-channel reporting: conditions
/// list and events).
async fn report_terminal_failure(cluster: &ProxmoxCluster, ctx: &Context, error: &Error) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();
    let (reason, message) = error.terminal_parts();

    let mut status = cluster.status.clone().unwrap_or_default();
    status.failure_reason = Some(reason.clone());
    status.failure_message = Some(message.clone());
    status.ready = false;
    conditions::set_condition(&mut status.conditions, READY, STATUS_FALSE, &reason, &message);
    patch_status(&ctx.client, &ns, &name, &status).await?;

    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
    recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason,
                note: Some(message),
                action: "Reconciling".into(),
                secondary: None,
            },
            &cluster.object_ref(&()),
        )
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

async fn apply(cluster: &ProxmoxCluster, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();

    ensure_secret_finalizer(&ctx.client, &ns, &cluster.spec.credentials_secret_ref.name, &name).await?;

    let zone_pools = ipam::ensure_default_pools(&ctx.client, &ns, &name, &cluster.spec).await?;

    let mut status = cluster.status.clone().unwrap_or_default();
    status.zone_pools = zone_pools;

    let proxmox_available = ctx.proxmox.get_all_node_names().await.is_ok();
    conditions::set_condition(
        &mut status.conditions,
        PROXMOX_AVAILABLE,
        if proxmox_available { STATUS_TRUE } else { STATUS_FALSE },
        if proxmox_available { "Reachable" } else { "Unreachable" },
        "",
    );
    let all_machines_ready = machines_ready(&ctx.client, &ns, &name).await?;
    let ready = proxmox_available && status.failure_reason.is_none() && all_machines_ready;
    status.ready = ready;
    conditions::set_condition(
        &mut status.conditions,
        READY,
        if ready { STATUS_TRUE } else { STATUS_FALSE },
        "Reconciled",
        "",
    );

    patch_status(&ctx.client, &ns, &name, &status).await?;

    Ok(Action::requeue(Duration::from_secs(5 * 60)))
}

/// A cluster is only `Ready` once every `ProxmoxMachine` it owns has
/// finished provisioning or is intentionally paused (spec.md §4.6 item 3:
/// fold the summary condition from `{ProxmoxAvailable, VMProvisioned,
/// Paused}`). A cluster with no machines yet is vacuously ready on this
/// axis — it still gates on `proxmox_available` above.
async fn machines_ready(client: &Client, namespace: &str, cluster_name: &str) -> Result<bool> {
    let machines: Api<ProxmoxMachine> = Api::namespaced(client.clone(), namespace);
    let list = machines
        .list(&ListParams::default().labels(&format!("{LABEL_CLUSTER_NAME}={cluster_name}")))
        .await
        .map_err(Error::Kube)?;
    Ok(list.items.iter().all(|m| {
        let conditions = m.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
        machine_is_ready(conditions)
    }))
}

/// A machine counts toward the cluster's `Ready` condition once it's
/// finished provisioning or is intentionally paused.
fn machine_is_ready(conditions: &[k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition]) -> bool {
    conditions::is_true(conditions, VM_PROVISIONED) || conditions::is_true(conditions, PAUSED)
}

async fn cleanup(cluster: &ProxmoxCluster, ctx: Arc<Context>) -> Result<Action> {
    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
    recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("deleting ProxmoxCluster {}", cluster.name_any())),
                action: "Deleting".into(),
                secondary: None,
            },
            &cluster.object_ref(&()),
        )
        .await
        .map_err(Error::Kube)?;

    let ns = cluster.namespace().unwrap_or_else(|| "default".to_string());
    remove_secret_finalizer(&ctx.client, &ns, &cluster.spec.credentials_secret_ref.name, &cluster.name_any()).await?;

    Ok(Action::await_change())
}

async fn ensure_secret_finalizer(client: &Client, namespace: &str, secret_name: &str, cluster_name: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(secret_name).await.map_err(Error::Kube)?;
    let finalizer_value = format!("{}/{}", FINALIZER, cluster_name);
    if secret.finalizers().iter().any(|f| f == &finalizer_value) {
        return Ok(());
    }
    let mut finalizers = secret.finalizers().to_vec();
    finalizers.push(finalizer_value);
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    secrets
        .patch(secret_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

async fn remove_secret_finalizer(client: &Client, namespace: &str, secret_name: &str, cluster_name: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Ok(secret) = secrets.get(secret_name).await else {
        return Ok(());
    };
    let finalizer_value = format!("{}/{}", FINALIZER, cluster_name);
    let finalizers: Vec<String> = secret.finalizers().iter().filter(|f| *f != &finalizer_value).cloned().collect();
    if finalizers.len() == secret.finalizers().len() {
        return Ok(());
    }
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    secrets
        .patch(secret_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

async fn patch_status(client: &Client, namespace: &str, name: &str, status: &ProxmoxClusterStatus) -> Result<()> {
    let clusters: Api<ProxmoxCluster> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "status": status });
    clusters
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

/// Idempotently records `machine_name`'s placement in the cluster's
/// NodeLocation ledger, patching status only if the ledger actually
/// changed. Called by the machine controller once placement is final.
pub async fn update_node_location(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
    role: MachineRole,
    machine_name: &str,
    proxmox_node: &str,
    zone: &str,
) -> Result<bool> {
    let clusters: Api<ProxmoxCluster> = Api::namespaced(client.clone(), namespace);
    let cluster = clusters.get(cluster_name).await.map_err(Error::Kube)?;
    let mut status = cluster.status.unwrap_or_default();
    let changed = status.node_location.upsert(role, machine_name, proxmox_node, zone);
    if changed {
        patch_status(client, namespace, cluster_name, &status).await?;
    }
    Ok(changed)
}

/// Removes `machine_name` from the ledger on machine deletion.
pub async fn remove_node_location(client: &Client, namespace: &str, cluster_name: &str, machine_name: &str) -> Result<bool> {
    let clusters: Api<ProxmoxCluster> = Api::namespaced(client.clone(), namespace);
    let Ok(cluster) = clusters.get(cluster_name).await else {
        return Ok(false);
    };
    let mut status = cluster.status.unwrap_or_default();
    let changed = status.node_location.remove(machine_name);
    if changed {
        patch_status(client, namespace, cluster_name, &status).await?;
    }
    Ok(changed)
}

fn error_policy(cluster: Arc<ProxmoxCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "cluster reconcile failed");
    ctx.metrics.reconcile_failure("cluster", cluster.as_ref(), error);
    match error.requeue_after() {
        Some(d) => Action::requeue(d),
        None => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(type_: &str, status: &str) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition {
        k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: Some("Test".to_string()),
            message: Some(String::new()),
            last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            observed_generation: None,
        }
    }

    #[test]
    fn machine_is_ready_on_vm_provisioned() {
        assert!(machine_is_ready(&[condition(VM_PROVISIONED, STATUS_TRUE)]));
    }

    #[test]
    fn machine_is_ready_on_paused() {
        assert!(machine_is_ready(&[condition(PAUSED, STATUS_TRUE)]));
    }

    #[test]
    fn machine_is_not_ready_while_provisioning() {
        assert!(!machine_is_ready(&[condition(VM_PROVISIONED, STATUS_FALSE)]));
    }

    #[test]
    fn machine_is_not_ready_with_no_conditions() {
        assert!(!machine_is_ready(&[]));
    }
}
