//! MachineReconciler (spec.md §4.1): drives one `ProxmoxMachine` through
//! clone, configure, resize, IP allocation, bootstrap injection, power-on
//! and readiness, phase by phase. Styled after `cluster_controller`'s
//! finalizer-wrapped apply/cleanup split; every phase re-fetches what it
//! needs rather than trusting state a previous reconcile might have seen
//! (spec.md §9's "never cache VM objects across reconciles").

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use super::cluster_controller;
use super::context::Context;
use crate::api::cluster::{MachineRole, ProxmoxCluster};
use crate::api::conditions::{self, STATUS_FALSE, STATUS_TRUE, VM_PROVISIONED};
use crate::api::ipam_types::LABEL_CLUSTER_NAME;
use crate::api::machine::{NetworkAddresses, ProxmoxMachine, ProxmoxMachineStatus, TaskKind, VmState};
use crate::bootstrap::{self, BootstrapFormat, DEFAULT_ISO_DEVICE};
use crate::errors::{Error, Result};
use crate::ipam;
use crate::proxmox::types::{CloneParams, ConfigPatch, Task as ProxTask};
use crate::proxmox::Error as ProxmoxError;
use crate::scheduler;
use crate::template_resolver::{self, Resolution};

pub const FINALIZER: &str = "infrastructure.proxmox.cluster.x-k8s.io/machine-protection";
const FIELD_MANAGER: &str = "proxmox-capi-manager";

/// Label an upstream controller (or the user) sets on a `ProxmoxMachine`
/// to say which of the owning cluster's zones it belongs to. Absent means
/// "the cluster's first configured zone" (spec.md's data model has no
/// explicit per-machine zone field; this is the convention this provider
/// uses to derive one for the NodeLocation ledger and IPAM pool choice).
const LABEL_ZONE: &str = "infrastructure.proxmox.cluster.x-k8s.io/zone";

/// Standard Cluster API convention: presence (any value) marks a machine
/// as control-plane.
const LABEL_CONTROL_PLANE: &str = "cluster.x-k8s.io/control-plane";

const BOOT_DISK_KEY: &str = "scsi0";

pub async fn run(ctx: Arc<Context>) {
    let machines: Api<ProxmoxMachine> = Api::all(ctx.client.clone());
    if let Err(e) = machines.list(&Default::default()).await {
        tracing::error!("ProxmoxMachine CRD is not queryable: {e:?}. Is it installed?");
        std::process::exit(1);
    }

    Controller::new(machines, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(machine: Arc<ProxmoxMachine>, ctx: Arc<Context>) -> Result<Action> {
    let _permit = ctx.machine_concurrency.clone().acquire_owned().await.expect("semaphore never closed");
    let _timer = ctx.metrics.count_and_measure("machine");
    ctx.diagnostics.write().await.last_event = chrono::Utc::now();

    let ns = machine.namespace().unwrap_or_else(|| "default".to_string());
    let machines: Api<ProxmoxMachine> = Api::namespaced(ctx.client.clone(), &ns);

    info!(machine = %machine.name_any(), namespace = %ns, "reconciling machine");

    let result = finalizer(&machines, FINALIZER, machine.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(m) => apply(&m, ctx.clone()).await,
            FinalizerEvent::Cleanup(m) => cleanup(&m, ctx.clone()).await,
        }
    })
    .await;

    if let Err(FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e)) = &result {
        if e.is_terminal() {
            report_terminal_failure(&machine, &ctx, e).await?;
        }
    }

    result.map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Patches `status.failureReason`/`status.failureMessage` and the
/// `VMProvisioned` condition, and emits a `Warning` event, for a terminal
/// error coming out of `apply`/`cleanup` (spec.md §7's two-channel
/// reporting: conditions list and events).
async fn report_terminal_failure(machine: &ProxmoxMachine, ctx: &Context, error: &Error) -> Result<()> {
    let ns = machine.namespace().unwrap_or_else(|| "default".to_string());
    let name = machine.name_any();
    let (reason, message) = error.terminal_parts();

    let mut status = machine.status.clone().unwrap_or_default();
    status.failure_reason = Some(reason.clone());
    status.failure_message = Some(message.clone());
    conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, &reason, &message);
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
            &machine.object_ref(&()),
        )
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

fn cluster_name_of(machine: &ProxmoxMachine) -> Result<String> {
    machine
        .labels()
        .get(LABEL_CLUSTER_NAME)
        .cloned()
        .ok_or_else(|| Error::waiting(format!("{LABEL_CLUSTER_NAME} label not yet set")))
}

fn role_of(machine: &ProxmoxMachine) -> MachineRole {
    if machine.labels().contains_key(LABEL_CONTROL_PLANE) {
        MachineRole::ControlPlane
    } else {
        MachineRole::Worker
    }
}

/// Resolves which template to clone from: the machine's own
/// `templateSource` if set, else the owning cluster's `cloneSpec` entry for
/// this machine's role (spec.md §3's cluster-level template fallback).
fn resolve_template_source(machine: &ProxmoxMachine, cluster: &ProxmoxCluster, role: MachineRole) -> Result<crate::api::machine::TemplateSource> {
    if let Some(ts) = &machine.spec.template_source {
        return Ok(ts.clone());
    }
    let key = role.clone_spec_key();
    cluster
        .spec
        .clone_spec
        .as_ref()
        .and_then(|cs| cs.machine_spec.iter().find(|m| m.machine_type == key))
        .map(|m| m.template.clone())
        .ok_or_else(|| Error::terminal("NoTemplateSource", format!("no templateSource set and owning cluster has no cloneSpec entry for machineType {key}")))
}

fn zone_of(machine: &ProxmoxMachine, cluster: &ProxmoxCluster) -> Result<String> {
    if let Some(zone) = machine.labels().get(LABEL_ZONE) {
        return Ok(zone.clone());
    }
    cluster
        .spec
        .zones
        .first()
        .map(|z| z.name.clone())
        .ok_or_else(|| Error::terminal("NoZonesConfigured", "owning cluster has no zones configured"))
}

/// Polls a task this machine already has in flight for `expected_kind`.
/// Returns `Ok(None)` when there's nothing in flight (phase should
/// proceed to submit one), `Ok(Some(action))` when the caller should stop
/// and return that action (still waiting, or a classified failure), and
/// clears `status.task_ref`/`task_kind` once the task resolves either way.
async fn await_task(
    ctx: &Context,
    status: &mut ProxmoxMachineStatus,
    node: &str,
    expected_kind: TaskKind,
    fail_reason: &str,
    fail_message: &str,
    fail_requeue: Duration,
) -> Result<Option<Action>> {
    if status.task_kind != Some(expected_kind) {
        return Ok(None);
    }
    let Some(upid) = status.task_ref.clone() else {
        status.task_kind = None;
        return Ok(None);
    };
    let task_status = ctx.proxmox.get_task(node, &ProxTask(upid)).await.map_err(Error::Proxmox)?;
    if !task_status.is_complete() {
        return Ok(Some(Action::requeue(Duration::from_secs(5))));
    }
    status.task_ref = None;
    status.task_kind = None;
    if !task_status.is_success() {
        conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, fail_reason, fail_message);
        return Ok(Some(Action::requeue(fail_requeue)));
    }
    Ok(None)
}

async fn apply(machine: &ProxmoxMachine, ctx: Arc<Context>) -> Result<Action> {
    let ns = machine.namespace().unwrap_or_else(|| "default".to_string());
    let name = machine.name_any();
    let machines: Api<ProxmoxMachine> = Api::namespaced(ctx.client.clone(), &ns);
    let mut status = machine.status.clone().unwrap_or_default();

    macro_rules! finish {
        ($action:expr) => {{
            patch_status(&ctx.client, &ns, &name, &status).await?;
            return Ok($action);
        }};
    }

    if crate::api::machine::ProxmoxMachineSpec::has_failed(&status) {
        finish!(Action::await_change());
    }

    // ---- phase 1: gate ----
    let cluster_name = cluster_name_of(machine)?;
    let clusters: Api<ProxmoxCluster> = Api::namespaced(ctx.client.clone(), &ns);
    let cluster = match clusters.get_opt(&cluster_name).await.map_err(Error::Kube)? {
        Some(c) => c,
        None => {
            conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForCluster", "owning ProxmoxCluster not found");
            finish!(Action::requeue(Duration::from_secs(10)));
        }
    };
    let cluster_ready = cluster.status.as_ref().is_some_and(|s| s.ready);
    if !cluster_ready {
        conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForCluster", "owning ProxmoxCluster is not ready");
        finish!(Action::requeue(Duration::from_secs(10)));
    }
    if machine.spec.bootstrap_data_secret_name.is_none() {
        conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForBootstrapData", "bootstrapDataSecretName not yet set");
        finish!(Action::requeue(Duration::from_secs(10)));
    }

    let role = role_of(machine);
    let zone_name = zone_of(machine, &cluster)?;
    let zone = cluster.spec.zones.iter().find(|z| z.name == zone_name).cloned();
    let zone_pools = cluster
        .status
        .as_ref()
        .and_then(|s| s.zone_pools.iter().find(|z| z.zone == zone_name).cloned());

    // ---- phase 2/3: ensure VM exists, await clone task ----
    let vmid = match machine.spec.vm_id.filter(|id| *id >= 100) {
        Some(vmid) => vmid,
        None => {
            let explicit_allowed: Vec<String> = {
                let mut set: BTreeSet<String> = BTreeSet::new();
                if let Some(v) = &machine.spec.allowed_nodes {
                    set.extend(v.iter().cloned());
                }
                set.extend(cluster.spec.allowed_nodes.iter().cloned());
                set.into_iter().collect()
            };

            let template_source = resolve_template_source(machine, &cluster, role)?;

            let candidates = if template_source.template_selector.is_some() {
                ctx.proxmox.list_tagged_templates().await.map_err(Error::Proxmox)?
            } else {
                Vec::new()
            };
            let local_storage = template_source.template_selector.as_ref().is_some_and(|s| s.local_storage);

            let resolution = template_resolver::resolve(&template_source, &candidates, &explicit_allowed, local_storage)
                .map_err(|e| match e {
                    ProxmoxError::TemplateNotFound(_) | ProxmoxError::MultipleTemplatesFound(_) => Error::terminal("TemplateResolutionFailed", e.to_string()),
                    other => Error::Proxmox(other),
                })?;

            let fallback_node = match &resolution {
                Resolution::Shared { node, .. } => node.clone(),
                Resolution::PerNode(map) => map.keys().next().cloned().unwrap_or_default(),
            };
            let node_candidates = scheduler::candidate_nodes(machine.spec.allowed_nodes.as_deref(), &cluster.spec.allowed_nodes, &fallback_node);
            let ledger = cluster.status.as_ref().map(|s| s.node_location.clone()).unwrap_or_default();
            let placement = scheduler::choose_node(
                &ctx.proxmox,
                &node_candidates,
                cluster.spec.scheduler_hints.memory_adjustment_percentage,
                machine.spec.memory_mib,
                &ledger,
                role,
            )
            .await?;

            let (template_node, template_id) = match &resolution {
                Resolution::Shared { node, template_id } => (node.clone(), *template_id),
                Resolution::PerNode(map) => {
                    let id = *map
                        .get(&placement.node)
                        .ok_or_else(|| Error::terminal("TemplateResolutionFailed", format!("no local-storage template for node {}", placement.node)))?;
                    (placement.node.clone(), id)
                }
            };

            let explicit_range = machine.spec.vm_id_range.as_ref().map(|r| (r.start, r.end));
            let new_vmid = scheduler::choose_vm_id(&ctx.proxmox, explicit_range).await?;

            let params = CloneParams {
                newid: new_vmid,
                name: Some(name.clone()),
                target: if placement.node != template_node { Some(placement.node.clone()) } else { None },
                full: if machine.spec.clone_flags.full { 1 } else { 0 },
                storage: machine.spec.clone_flags.storage.clone(),
                format: machine.spec.clone_flags.format.clone(),
                snapname: machine.spec.clone_flags.snap_name.clone(),
            };
            let (_, task) = ctx.proxmox.clone_vm(&template_node, template_id, &params).await.map_err(Error::Proxmox)?;

            let patch = json!({ "spec": { "vmId": new_vmid } });
            machines
                .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(patch))
                .await
                .map_err(Error::Kube)?;

            status.proxmox_node = Some(placement.node.clone());
            status.vm_state = VmState::Pending;
            status.task_ref = Some(task.0);
            status.task_kind = Some(TaskKind::Clone);
            conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "Cloning", "cloning vm from template");
            finish!(Action::requeue(Duration::from_secs(5)));
        }
    };

    let node = status
        .proxmox_node
        .clone()
        .ok_or_else(|| Error::waiting("vm id assigned but hosting node not yet recorded"))?;

    if let Some(action) = await_task(&ctx, &mut status, &node, TaskKind::Clone, "CloningFailed", "clone task failed", Duration::from_secs(30)).await? {
        finish!(action);
    }

    let vm = match ctx.proxmox.get_vm(&node, vmid).await.map_err(Error::Proxmox)? {
        Some(vm) => vm,
        None if status.task_kind.is_none() => {
            // Not found and nothing in flight: the VM disappeared out from
            // under us. Clear the assigned id so the next reconcile falls
            // back into the `None` branch above and actually re-clones
            // (spec.md §4.1 phase 2), instead of looping on this branch
            // forever against an id that will never resolve again.
            let patch = json!({ "spec": { "vmId": null } });
            machines
                .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(patch))
                .await
                .map_err(Error::Kube)?;
            status.proxmox_node = None;
            status.vm_state = VmState::NotFound;
            conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "Recreating", "vm not found, re-cloning");
            finish!(Action::requeue_now());
        }
        None => finish!(Action::requeue(Duration::from_secs(5))),
    };

    // ---- phase 4: reconcile configuration (cpu/memory/tags/netN) ----
    if let Some(action) = await_task(&ctx, &mut status, &node, TaskKind::Configure, "ConfigurationFailed", "config patch failed", Duration::from_secs(15)).await? {
        finish!(action);
    }

    if let Some(action) = reconcile_config(&ctx, &node, vmid, machine, &vm, &mut status).await? {
        finish!(action);
    }

    // ---- phase 5: reconcile disks ----
    if let Some(action) = await_task(&ctx, &mut status, &node, TaskKind::Resize, "DiskReconciliationFailed", "disk resize failed", Duration::from_secs(15)).await? {
        finish!(action);
    }
    if let Some(action) = reconcile_disk(&ctx, &node, vmid, machine, &mut status).await? {
        finish!(action);
    }

    // ---- phase 6: reconcile IP addresses ----
    if let Some(action) = await_task(&ctx, &mut status, &node, TaskKind::Configure, "StaticIPAllocationFailed", "ipconfig patch failed", Duration::from_secs(15)).await? {
        finish!(action);
    }
    let Some(zone) = zone.as_ref() else {
        return Err(Error::terminal("NoZonesConfigured", format!("zone {zone_name} not found on owning cluster")));
    };
    let resolved = match reconcile_ip_addresses(&ctx, &ns, &node, vmid, &name, &cluster_name, machine, zone, zone_pools.as_ref(), &mut status).await? {
        Ok(resolved) => resolved,
        Err(action) => finish!(action),
    };

    // ---- phase 7: reconcile bootstrap data ----
    if let Some(action) = await_task(&ctx, &mut status, &node, TaskKind::Configure, "BootstrapDataReconciliationFailed", "iso attach failed", Duration::from_secs(15)).await? {
        finish!(action);
    }
    if let Some(action) = reconcile_bootstrap(&ctx, &ns, &node, vmid, &name, machine, &cluster, &resolved, &mut status).await? {
        finish!(action);
    }

    // ---- phase 8: power on ----
    if let Some(action) = await_task(&ctx, &mut status, &node, TaskKind::Start, "PoweringOnFailed", "start task failed", Duration::from_secs(15)).await? {
        finish!(action);
    }
    let vm = ctx.proxmox.get_vm(&node, vmid).await.map_err(Error::Proxmox)?.ok_or_else(|| Error::waiting("vm disappeared before power-on"))?;
    if !vm.is_running() {
        let task = ctx.proxmox.start_vm(&node, vmid).await.map_err(Error::Proxmox)?;
        status.task_ref = Some(task.0);
        status.task_kind = Some(TaskKind::Start);
        conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForVMPowerUp", "starting vm");
        finish!(Action::requeue(Duration::from_secs(5)));
    }

    // ---- phase 9: await cloud-init / qemu-agent ----
    if !machine.spec.skip_checks.qemu_agent {
        let agent = ctx.proxmox.qemu_agent_status(&node, vmid).await.map_err(Error::Proxmox)?;
        if !agent.running {
            conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForCloudInit", "qemu-agent not yet responding");
            finish!(Action::requeue(Duration::from_secs(10)));
        }
    }
    if !machine.spec.skip_checks.cloud_init {
        let cloud_init = ctx.proxmox.cloud_init_status(&node, vmid).await.map_err(Error::Proxmox)?;
        if cloud_init.failed {
            return Err(Error::terminal("VMProvisionFailed", "cloud-init reported a non-zero exit status"));
        }
        if cloud_init.running {
            conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForCloudInit", "cloud-init still running");
            finish!(Action::requeue(Duration::from_secs(10)));
        }
    }

    // ---- phase 10: collect addresses ----
    collect_addresses(&ctx, &node, vmid, machine, &mut status).await?;
    cluster_controller::update_node_location(&ctx.client, &ns, &cluster_name, role, &name, &node, &zone_name).await?;

    // ---- phase 11: unmount ISO & finalize ----
    if status.bootstrap_data_provided {
        ctx.proxmox.unmount_cloud_init_iso(&node, vmid, DEFAULT_ISO_DEVICE).await.map_err(Error::Proxmox)?;
        if let Some(vm) = ctx.proxmox.get_vm(&node, vmid).await.map_err(Error::Proxmox)? {
            let remaining: Vec<String> = vm
                .tag_set()
                .into_iter()
                .filter(|t| t != BootstrapFormat::CloudConfig.iso_tag() && t != BootstrapFormat::Ignition.iso_tag())
                .collect();
            if remaining.len() != vm.tag_set().len() {
                let patch = ConfigPatch {
                    tags: Some(remaining.join(";")),
                    ..Default::default()
                };
                ctx.proxmox.configure_vm(&node, vmid, &patch).await.map_err(Error::Proxmox)?;
            }
        }
    }
    if machine.spec.metadata_settings.inject_provider_id && status.provider_id.is_none() {
        if let Some(uuid) = ctx.proxmox.get_bios_uuid(&node, vmid).await.map_err(Error::Proxmox)? {
            status.provider_id = Some(format!("proxmox://{uuid}"));
        }
    }
    status.vm_state = VmState::Ready;
    status.ready = true;
    conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_TRUE, "Provisioned", "vm is ready");
    finish!(Action::requeue(Duration::from_secs(5 * 60)));
}

/// Submits a CPU/memory/tags/network-device config patch when desired
/// state diverges from what's currently on the VM. Returns `Some(action)`
/// when a patch was submitted (caller should stop this reconcile here).
async fn reconcile_config(
    ctx: &Context,
    node: &str,
    vmid: i64,
    machine: &ProxmoxMachine,
    vm: &crate::proxmox::types::Vm,
    status: &mut ProxmoxMachineStatus,
) -> Result<Option<Action>> {
    let current_macs = ctx.proxmox.get_net_macs(node, vmid).await.map_err(Error::Proxmox)?;
    let current_config = ctx.proxmox.get_vm_config(node, vmid).await.map_err(Error::Proxmox)?;
    let mut net = std::collections::BTreeMap::new();
    let mut network_changed = !current_macs.keys().cloned().collect::<BTreeSet<_>>().is_superset(&machine.spec.network.iter().map(|d| d.name.clone()).collect());
    for device in &machine.spec.network {
        match current_config.get(&device.name).and_then(|v| v.as_str()) {
            Some(live) if nic_descriptor_matches(live, device) => {}
            _ => network_changed = true,
        }
        net.insert(device.name.clone(), nic_descriptor(device));
    }

    let desired_tags: BTreeSet<String> = machine.spec.tags.iter().cloned().collect();
    let current_tags: BTreeSet<String> = vm.tag_set().into_iter().collect();
    let tags_changed = !desired_tags.is_subset(&current_tags);
    let cpu_changed = vm.cpus != machine.spec.cpu.sockets * machine.spec.cpu.cores;
    let memory_changed = vm.maxmem != (machine.spec.memory_mib as u64) * 1024 * 1024;

    if !(network_changed || tags_changed || cpu_changed || memory_changed) {
        return Ok(None);
    }

    let merged_tags: Vec<String> = current_tags.union(&desired_tags).cloned().collect();
    let patch = ConfigPatch {
        sockets: Some(machine.spec.cpu.sockets),
        cores: Some(machine.spec.cpu.cores),
        memory: Some(machine.spec.memory_mib),
        tags: Some(merged_tags.join(";")),
        net,
        ..Default::default()
    };
    let task = ctx.proxmox.configure_vm(node, vmid, &patch).await.map_err(Error::Proxmox)?;
    status.task_ref = Some(task.0);
    status.task_kind = Some(TaskKind::Configure);
    conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForVirtualMachineConfig", "applying config patch");
    Ok(Some(Action::requeue(Duration::from_secs(5))))
}

/// Proxmox's `netN=<model>,bridge=<bridge>[,tag=<vlan>][,mtu=<mtu>]`
/// descriptor. `link_mtu` is the physical NIC MTU Proxmox enforces;
/// `mtu` (the guest-visible logical MTU) is consumed by the bootstrap
/// renderer instead, not by Proxmox's own device config.
fn nic_descriptor(device: &crate::api::machine::NetworkDevice) -> String {
    let mut s = format!("{},bridge={}", device.model.as_proxmox_str(), device.bridge);
    if let Some(vlan) = device.vlan {
        s.push_str(&format!(",tag={vlan}"));
    }
    if let Some(mtu) = device.link_mtu {
        s.push_str(&format!(",mtu={mtu}"));
    }
    s
}

/// Compares a live `netN=` descriptor read back from the VM config against
/// `device`'s desired bridge/model/vlan/mtu, ignoring the `=<mac>` suffix
/// Proxmox appends to the model field (that's assigned at clone time, not
/// something this provider sets).
fn nic_descriptor_matches(live: &str, device: &crate::api::machine::NetworkDevice) -> bool {
    let mut fields = live.split(',');
    let Some(model_field) = fields.next() else { return false };
    let model = model_field.split('=').next().unwrap_or("");
    if model != device.model.as_proxmox_str() {
        return false;
    }
    let mut bridge = None;
    let mut vlan = None;
    let mut mtu = None;
    for field in fields {
        if let Some(v) = field.strip_prefix("bridge=") {
            bridge = Some(v);
        } else if let Some(v) = field.strip_prefix("tag=") {
            vlan = v.parse::<u16>().ok();
        } else if let Some(v) = field.strip_prefix("mtu=") {
            mtu = v.parse::<u32>().ok();
        }
    }
    bridge == Some(device.bridge.as_str()) && vlan == device.vlan && mtu == device.link_mtu
}

/// Resizes the boot disk when the desired size grows; a desired size
/// smaller than what's observed is a terminal configuration error (Proxmox
/// disallows shrinking, spec.md §4.1 phase 5 / §8 invariant 5).
async fn reconcile_disk(ctx: &Context, node: &str, vmid: i64, machine: &ProxmoxMachine, status: &mut ProxmoxMachineStatus) -> Result<Option<Action>> {
    let sizes = ctx.proxmox.get_disk_sizes_gib(node, vmid).await.map_err(Error::Proxmox)?;
    let Some(&observed) = sizes.get(BOOT_DISK_KEY) else {
        return Ok(None);
    };
    let desired = machine.spec.disks.boot_volume.size_gib;
    if desired < observed {
        return Err(Error::terminal(
            "DiskShrinkRejected",
            format!("boot volume desired size {desired}GiB is smaller than observed {observed}GiB"),
        ));
    }
    if desired == observed {
        return Ok(None);
    }
    let task = ctx.proxmox.resize_disk(node, vmid, BOOT_DISK_KEY, desired).await.map_err(Error::Proxmox)?;
    status.task_ref = Some(task.0);
    status.task_kind = Some(TaskKind::Resize);
    conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForDiskReconciliation", "resizing boot volume");
    Ok(Some(Action::requeue(Duration::from_secs(5))))
}

/// Authors any missing IP claims, waits for fulfillment, and once every
/// `(device, pool-index)` pair has resolved submits the `ipconfigN=`
/// config patch. Returns `Ok(Err(action))` to signal "stop here", mirroring
/// the other phase helpers without needing a third enum variant.
#[allow(clippy::too_many_arguments)]
async fn reconcile_ip_addresses(
    ctx: &Context,
    ns: &str,
    node: &str,
    vmid: i64,
    machine_name: &str,
    cluster_name: &str,
    machine: &ProxmoxMachine,
    zone: &crate::api::cluster::ZoneConfig,
    zone_pools: Option<&crate::api::cluster::ZonePoolRefs>,
    status: &mut ProxmoxMachineStatus,
) -> Result<std::result::Result<Vec<ipam::ResolvedAddress>, Action>> {
    ipam::author_claims(&ctx.client, ns, cluster_name, machine_name, &machine.spec.network, zone, zone_pools).await?;
    let resolved = ipam::lookup_fulfilled(&ctx.client, ns, machine_name, &machine.spec.network).await?;

    if !ipam::all_resolved(&machine.spec.network, &resolved) {
        conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForStaticIPAllocation", "waiting for ip address claims to be fulfilled");
        return Ok(Err(Action::requeue(Duration::from_secs(10))));
    }

    let mut ipconfig = std::collections::BTreeMap::new();
    for (i, device) in machine.spec.network.iter().enumerate() {
        let per_device: Vec<&ipam::ResolvedAddress> = resolved.iter().filter(|r| r.device == device.name).collect();
        if per_device.is_empty() {
            continue;
        }
        ipconfig.insert(format!("ipconfig{i}"), ipam::encode_ipconfig(&per_device)?);
    }

    let current = ctx.proxmox.get_vm_config(node, vmid).await.map_err(Error::Proxmox)?;
    let needs_patch = ipconfig.iter().any(|(key, value)| current.get(key).and_then(|v| v.as_str()) != Some(value.as_str()));
    if needs_patch {
        let patch = ConfigPatch {
            ipconfig,
            ..Default::default()
        };
        let task = ctx.proxmox.configure_vm(node, vmid, &patch).await.map_err(Error::Proxmox)?;
        status.task_ref = Some(task.0);
        status.task_kind = Some(TaskKind::Configure);
        conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForStaticIPAllocation", "applying ip config patch");
        return Ok(Err(Action::requeue(Duration::from_secs(5))));
    }

    Ok(Ok(resolved))
}

/// Renders and attaches the bootstrap ISO once, then marks
/// `bootstrapDataProvided`. Idempotent: a machine that already has
/// bootstrap data provided is left alone (spec.md §8's no-op-when-ready
/// invariant covers this too).
#[allow(clippy::too_many_arguments)]
async fn reconcile_bootstrap(
    ctx: &Context,
    ns: &str,
    node: &str,
    vmid: i64,
    machine_name: &str,
    machine: &ProxmoxMachine,
    cluster: &ProxmoxCluster,
    resolved: &[ipam::ResolvedAddress],
    status: &mut ProxmoxMachineStatus,
) -> Result<Option<Action>> {
    if status.bootstrap_data_provided {
        return Ok(None);
    }

    let Some(secret_name) = &machine.spec.bootstrap_data_secret_name else {
        return Ok(Some(Action::requeue(Duration::from_secs(10))));
    };
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let secret = secrets.get(secret_name).await.map_err(Error::Kube)?;
    let data = secret.data.unwrap_or_default();
    let format_bytes = data.get("format").ok_or_else(|| Error::waiting("bootstrap secret missing 'format' key"))?;
    let format = BootstrapFormat::from_secret_field(std::str::from_utf8(&format_bytes.0).unwrap_or_default())?;
    let value_bytes = data.get("value").ok_or_else(|| Error::waiting("bootstrap secret missing 'value' key"))?;
    let payload = String::from_utf8(value_bytes.0.clone()).map_err(|e| Error::InvalidSpec(format!("bootstrap payload is not utf-8: {e}")))?;

    let provider_id = if machine.spec.metadata_settings.inject_provider_id {
        ctx.proxmox
            .get_bios_uuid(node, vmid)
            .await
            .map_err(Error::Proxmox)?
            .map(|uuid| format!("proxmox://{uuid}"))
    } else {
        None
    };

    let macs = ctx.proxmox.get_net_macs(node, vmid).await.map_err(Error::Proxmox)?;
    let iso_bytes = bootstrap::render_and_package(
        format,
        &payload,
        machine_name,
        provider_id.as_deref(),
        &machine.spec.network,
        &machine.spec.vrfs,
        &macs,
        resolved,
        &cluster.spec.dns_servers,
    )
    .await?;

    let filename = format!("{machine_name}-bootstrap.iso");
    let volume_id = ctx
        .proxmox
        .upload_iso(node, &ctx.config.iso_storage, &filename, iso_bytes)
        .await
        .map_err(Error::Proxmox)?;
    let task = ctx.proxmox.attach_iso(node, vmid, DEFAULT_ISO_DEVICE, &volume_id).await.map_err(Error::Proxmox)?;

    if let Some(vm) = ctx.proxmox.get_vm(node, vmid).await.map_err(Error::Proxmox)? {
        ctx.proxmox.tag_vm(node, vmid, &vm, &[format.iso_tag().to_string()]).await.map_err(Error::Proxmox)?;
    }

    status.task_ref = Some(task.0);
    status.task_kind = Some(TaskKind::Configure);
    status.bootstrap_data_provided = true;
    conditions::set_condition(&mut status.conditions, VM_PROVISIONED, STATUS_FALSE, "WaitingForBootstrapDataReconciliation", "attaching bootstrap iso");
    Ok(Some(Action::requeue(Duration::from_secs(5))))
}

/// Reads qemu-agent-reported interfaces, matches them to configured NICs
/// by MAC, and records the v4/v6 address lists per device (spec.md §4.1
/// phase 10).
async fn collect_addresses(ctx: &Context, node: &str, vmid: i64, machine: &ProxmoxMachine, status: &mut ProxmoxMachineStatus) -> Result<()> {
    let interfaces = ctx.proxmox.qemu_agent_network_interfaces(node, vmid).await.map_err(Error::Proxmox)?;
    let macs = ctx.proxmox.get_net_macs(node, vmid).await.map_err(Error::Proxmox)?;

    let mut addresses = Vec::new();
    for device in &machine.spec.network {
        let Some(mac) = macs.get(&device.name) else { continue };
        let Some(iface) = interfaces.iter().find(|i| i.hardware_address.eq_ignore_ascii_case(mac)) else {
            continue;
        };
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for addr in &iface.ip_addresses {
            let entry = format!("{}/{}", addr.ip_address, addr.prefix);
            match addr.ip_address_type.as_str() {
                "ipv4" => v4.push(entry),
                "ipv6" => v6.push(entry),
                _ => {}
            }
        }
        addresses.push(NetworkAddresses {
            device: device.name.clone(),
            v4,
            v6,
        });
    }
    status.addresses = addresses;
    Ok(())
}

async fn cleanup(machine: &ProxmoxMachine, ctx: Arc<Context>) -> Result<Action> {
    let ns = machine.namespace().unwrap_or_else(|| "default".to_string());
    let name = machine.name_any();
    let mut status = machine.status.clone().unwrap_or_default();

    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
    recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("deleting ProxmoxMachine {name}")),
                action: "Deleting".into(),
                secondary: None,
            },
            &machine.object_ref(&()),
        )
        .await
        .map_err(Error::Kube)?;

    if let (Some(vmid), Some(node)) = (machine.spec.vm_id.filter(|id| *id >= 100), status.proxmox_node.clone()) {
        if let Some(action) = await_task(&ctx, &mut status, &node, TaskKind::Delete, "DeletionFailed", "vm delete task failed", Duration::from_secs(30)).await? {
            patch_status(&ctx.client, &ns, &name, &status).await?;
            return Ok(action);
        }

        match ctx.proxmox.get_vm(&node, vmid).await.map_err(Error::Proxmox)? {
            Some(vm) if vm.is_running() => {
                ctx.proxmox.stop_vm(&node, vmid).await.map_err(Error::Proxmox)?;
                patch_status(&ctx.client, &ns, &name, &status).await?;
                return Ok(Action::requeue(Duration::from_secs(5)));
            }
            Some(_) => {
                let task = ctx.proxmox.delete_vm(&node, vmid).await.map_err(Error::Proxmox)?;
                status.task_ref = Some(task.0);
                status.task_kind = Some(TaskKind::Delete);
                patch_status(&ctx.client, &ns, &name, &status).await?;
                return Ok(Action::requeue(Duration::from_secs(5)));
            }
            None => {}
        }
    }

    ipam::release_claims(&ctx.client, &ns, &name, &machine.spec.network).await?;
    if let Ok(cluster_name) = cluster_name_of(machine) {
        cluster_controller::remove_node_location(&ctx.client, &ns, &cluster_name, &name).await?;
    }

    Ok(Action::await_change())
}

async fn patch_status(client: &Client, namespace: &str, name: &str, status: &ProxmoxMachineStatus) -> Result<()> {
    let machines: Api<ProxmoxMachine> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "status": status });
    machines
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

fn error_policy(machine: Arc<ProxmoxMachine>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(machine = %machine.name_any(), error = %error, "machine reconcile failed");
    ctx.metrics.reconcile_failure("machine", machine.as_ref(), error);
    match error.requeue_after() {
        Some(d) => Action::requeue(d),
        None => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::machine::NicModel;

    fn device(bridge: &str, vlan: Option<u16>, link_mtu: Option<u32>) -> crate::api::machine::NetworkDevice {
        crate::api::machine::NetworkDevice {
            name: "net0".to_string(),
            bridge: bridge.to_string(),
            model: NicModel::Virtio,
            vlan,
            mtu: None,
            default_ipv4: false,
            default_ipv6: false,
            ip_pool_refs: Vec::new(),
            routing_policies: Vec::new(),
            link_mtu,
            dns_servers: None,
        }
    }

    #[test]
    fn nic_descriptor_builds_expected_string() {
        let dev = device("vmbr0", Some(10), Some(9000));
        assert_eq!(nic_descriptor(&dev), "virtio,bridge=vmbr0,tag=10,mtu=9000");
    }

    #[test]
    fn nic_descriptor_matches_identical_config_with_mac() {
        let dev = device("vmbr0", Some(10), Some(9000));
        assert!(nic_descriptor_matches("virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,tag=10,mtu=9000", &dev));
    }

    #[test]
    fn nic_descriptor_matches_rejects_bridge_change() {
        let dev = device("vmbr0", Some(10), Some(9000));
        assert!(!nic_descriptor_matches("virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr1,tag=10,mtu=9000", &dev));
    }

    #[test]
    fn nic_descriptor_matches_rejects_vlan_change() {
        let dev = device("vmbr0", Some(10), Some(9000));
        assert!(!nic_descriptor_matches("virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,tag=20,mtu=9000", &dev));
    }

    #[test]
    fn nic_descriptor_matches_rejects_model_change() {
        let dev = device("vmbr0", None, None);
        assert!(!nic_descriptor_matches("e1000=AA:BB:CC:DD:EE:FF,bridge=vmbr0", &dev));
    }

    #[test]
    fn nic_descriptor_matches_no_vlan_no_mtu() {
        let dev = device("vmbr0", None, None);
        assert!(nic_descriptor_matches("virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0", &dev));
    }
}
