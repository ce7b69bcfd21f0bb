//! Admission-time validation rules from spec.md §6, kept here as plain
//! functions (the webhook HTTP/TLS plumbing itself is out of scope per
//! spec.md §1 — see SPEC_FULL.md §3) so the invariants are still testable
//! and reusable by the reconcilers that must not trust an un-validated
//! object from an older CRD version.

use std::sync::OnceLock;

use super::cluster::ProxmoxClusterSpec;
use super::machine::{NetworkDevice, ProxmoxMachineSpec, VrfDevice};

fn tag_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_][a-z0-9_\-\+\.]*$").expect("static regex"))
}

const KERNEL_RESERVED_TABLES: [u32; 2] = [254, 255];
const KERNEL_RESERVED_RULE_PRIORITIES: [u32; 3] = [0, 32765, 32766];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    Message(String),
}

fn err(msg: impl Into<String>) -> ValidationError {
    ValidationError::Message(msg.into())
}

pub fn validate_cluster(spec: &ProxmoxClusterSpec) -> Result<(), ValidationError> {
    if spec.zones.is_empty() {
        return Err(err("at least one zone is required"));
    }
    for zone in &spec.zones {
        if zone.ipv4_config.is_none() && zone.ipv6_config.is_none() {
            return Err(err(format!(
                "zone {}: at least one of ipv4Config/ipv6Config must be set",
                zone.name
            )));
        }
    }

    if spec.dns_servers.is_empty() {
        return Err(err("dnsServers must have at least one entry"));
    }

    if let Some(clone_spec) = &spec.clone_spec {
        let has_control_plane = clone_spec
            .machine_spec
            .iter()
            .any(|m| m.machine_type == "controlPlane");
        if !has_control_plane {
            return Err(err(
                "cloneSpec.machineSpec must contain an entry with machineType == \"controlPlane\"",
            ));
        }
    }

    validate_endpoint_not_in_pool(spec)?;

    Ok(())
}

fn validate_endpoint_not_in_pool(spec: &ProxmoxClusterSpec) -> Result<(), ValidationError> {
    let host = &spec.control_plane_endpoint.host;
    let Ok(addr) = host.parse::<std::net::IpAddr>() else {
        // FQDN: nothing further to check here.
        return Ok(());
    };
    for zone in &spec.zones {
        for pool in [&zone.ipv4_config, &zone.ipv6_config].into_iter().flatten() {
            if crate::ipam::pool_contains(pool, &addr) {
                return Err(err(format!(
                    "control plane endpoint {} must not lie within pool addresses of zone {}",
                    addr, zone.name
                )));
            }
        }
    }
    Ok(())
}

pub fn validate_machine(spec: &ProxmoxMachineSpec) -> Result<(), ValidationError> {
    validate_template_source(spec)?;
    validate_tags(&spec.tags)?;
    if spec.disks.boot_volume.size_gib < 5 {
        return Err(err("disks.bootVolume.size must be >= 5 GiB"));
    }
    if spec.memory_mib % 8 != 0 {
        return Err(err("memoryMiB must be a multiple of 8"));
    }
    if spec.cpu.sockets < 1 || spec.cpu.cores < 1 {
        return Err(err("cpu.sockets and cpu.cores must each be >= 1"));
    }
    validate_network(&spec.network)?;
    validate_vrfs(&spec.vrfs)?;
    if let Some(range) = &spec.vm_id_range {
        validate_vm_id_range(range.start, range.end)?;
    }
    Ok(())
}

fn validate_template_source(spec: &ProxmoxMachineSpec) -> Result<(), ValidationError> {
    // `None` defers to the owning cluster's `cloneSpec` fallback, which
    // this function can't see; the reconciler rejects it at apply time if
    // no matching cloneSpec entry exists for the machine's role.
    let Some(ts) = &spec.template_source else {
        return Ok(());
    };
    let explicit = ts.source_node.is_some() && ts.template_id.is_some();
    let selector = ts.template_selector.is_some();
    if explicit == selector {
        return Err(err(
            "exactly one of {sourceNode+templateID} or templateSelector must be set",
        ));
    }
    if ts.source_node.is_some() != ts.template_id.is_some() {
        return Err(err("sourceNode and templateID must be set together"));
    }
    if let Some(selector) = &ts.template_selector {
        if selector.match_tags.is_empty() {
            return Err(err("templateSelector.matchTags must be non-empty"));
        }
        for tag in &selector.match_tags {
            validate_tag(tag)?;
        }
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<(), ValidationError> {
    if !tag_regex().is_match(tag) {
        return Err(err(format!(
            "tag {:?} does not match required pattern ^[a-z0-9_][a-z0-9_\\-\\+\\.]*$",
            tag
        )));
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for tag in tags {
        validate_tag(tag)?;
        if !seen.insert(tag.as_str()) {
            return Err(err(format!("duplicate tag {:?}", tag)));
        }
    }
    Ok(())
}

pub fn validate_vm_id_range(start: i64, end: i64) -> Result<(), ValidationError> {
    if !(100 <= start && start <= end && end <= 999_999_999) {
        return Err(err("vmIdRange requires 100 <= start <= end <= 999999999"));
    }
    Ok(())
}

pub fn validate_mtu(mtu: u32) -> Result<(), ValidationError> {
    if mtu == 1 {
        return Ok(());
    }
    if (2..1280).contains(&mtu) {
        return Err(err(format!(
            "mtu must be at least 1280 or 1, but was {}",
            mtu
        )));
    }
    if !(576..=65520).contains(&mtu) {
        return Err(err("invalid MTU value"));
    }
    Ok(())
}

fn validate_network(devices: &[NetworkDevice]) -> Result<(), ValidationError> {
    if devices.is_empty() {
        return Err(err("at least one NIC is required"));
    }
    let mut default_v4 = 0;
    let mut default_v6 = 0;
    let mut names: Vec<&str> = Vec::with_capacity(devices.len());

    for dev in devices {
        if dev.bridge.is_empty() {
            return Err(err(format!("device {}: bridge must not be empty", dev.name)));
        }
        if let Some(vlan) = dev.vlan {
            if !(1..=4094).contains(&vlan) {
                return Err(err(format!("device {}: vlan must be in 1..=4094", dev.name)));
            }
        }
        if let Some(mtu) = dev.mtu {
            validate_mtu(mtu)
                .map_err(|e| err(format!("device {}: {}", dev.name, e)))?;
        }
        if let Some(link_mtu) = dev.link_mtu {
            if link_mtu < 1280 {
                return Err(err(format!("device {}: linkMtu must be >= 1280", dev.name)));
            }
        }
        for pool in &dev.ip_pool_refs {
            if pool.kind != "InClusterIPPool" && pool.kind != "GlobalInClusterIPPool" {
                return Err(err(format!(
                    "device {}: ipPoolRef kind must be InClusterIPPool or GlobalInClusterIPPool, got {}",
                    dev.name, pool.kind
                )));
            }
        }
        for policy in &dev.routing_policies {
            validate_routing_policy(policy)
                .map_err(|e| err(format!("device {}: {}", dev.name, e)))?;
        }
        if dev.default_ipv4 {
            default_v4 += 1;
        }
        if dev.default_ipv6 {
            default_v6 += 1;
        }
        names.push(&dev.name);
    }

    if default_v4 > 1 {
        return Err(err("at most one NIC may be flagged defaultIPv4"));
    }
    if default_v6 > 1 {
        return Err(err("at most one NIC may be flagged defaultIPv6"));
    }

    validate_consecutive_names(&names)?;

    Ok(())
}

fn validate_consecutive_names(names: &[&str]) -> Result<(), ValidationError> {
    let mut indices: Vec<usize> = Vec::with_capacity(names.len());
    for name in names {
        let idx = name
            .strip_prefix("net")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| err(format!("NIC name {:?} must be of the form netN", name)))?;
        indices.push(idx);
    }
    indices.sort_unstable();
    for (expected, actual) in indices.iter().enumerate() {
        if expected != *actual {
            return Err(err("NIC names must be net0..netN-1 with consecutive indices"));
        }
    }
    Ok(())
}

/// Validates a device-level routing policy, i.e. one not nested under a
/// VRF. VRF-nested policies have their own table-match check in
/// `validate_vrfs` instead, since there the enclosing table is known.
fn validate_routing_policy(policy: &super::machine::RoutingPolicy) -> Result<(), ValidationError> {
    if policy.to.is_none() && policy.from.is_none() {
        return Err(err("routing policy must set at least one of to/from"));
    }
    if KERNEL_RESERVED_RULE_PRIORITIES.contains(&policy.priority) {
        return Err(err(format!(
            "rule priority {} collides with a kernel-reserved priority",
            policy.priority
        )));
    }
    match policy.table {
        Some(table) => {
            if KERNEL_RESERVED_TABLES.contains(&table) {
                return Err(err(format!(
                    "routing table {} collides with a kernel-reserved table",
                    table
                )));
            }
        }
        None => {
            return Err(err("routing policy outside a VRF must set a table"));
        }
    }
    Ok(())
}

fn validate_vrfs(vrfs: &[VrfDevice]) -> Result<(), ValidationError> {
    for vrf in vrfs {
        if vrf.table == 0 || KERNEL_RESERVED_TABLES.contains(&vrf.table) {
            return Err(err(format!(
                "VRF {}: table must not be 0, 254, or 255",
                vrf.name
            )));
        }
        for policy in &vrf.routing_policies {
            if let Some(table) = policy.table {
                if table != vrf.table {
                    return Err(err(format!(
                        "VRF {}: device/rule routing table mismatch {} != {}",
                        vrf.name, vrf.table, table
                    )));
                }
            }
            if KERNEL_RESERVED_RULE_PRIORITIES.contains(&policy.priority) {
                return Err(err(format!(
                    "VRF {}: rule priority {} collides with a kernel-reserved priority",
                    vrf.name, policy.priority
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_boundaries() {
        assert!(validate_mtu(1).is_ok());
        let e = validate_mtu(1279).unwrap_err();
        assert_eq!(e, err("mtu must be at least 1280 or 1, but was 1279"));
        let e = validate_mtu(65521).unwrap_err();
        assert_eq!(e, err("invalid MTU value"));
    }

    #[test]
    fn vm_id_range_bounds() {
        assert!(validate_vm_id_range(100, 200).is_ok());
        assert!(validate_vm_id_range(99, 200).is_err());
        assert!(validate_vm_id_range(100, 1_000_000_000).is_err());
        assert!(validate_vm_id_range(200, 100).is_err());
    }

    #[test]
    fn tag_regex_rejects_uppercase() {
        assert!(validate_tag("worker").is_ok());
        assert!(validate_tag("Worker").is_err());
        assert!(validate_tag("worker-1").is_ok());
    }

    #[test]
    fn consecutive_nic_names_required() {
        assert!(validate_consecutive_names(&["net0", "net1"]).is_ok());
        assert!(validate_consecutive_names(&["net0", "net2"]).is_err());
        assert!(validate_consecutive_names(&["eth0"]).is_err());
    }

    #[test]
    fn vrf_table_excludes_kernel_reserved() {
        let vrf = VrfDevice {
            name: "vrf-green".into(),
            table: 254,
            interfaces: vec![],
            routing_policies: vec![],
        };
        assert!(validate_vrfs(&[vrf]).is_err());
    }

    #[test]
    fn vrf_policy_table_mismatch_is_rejected() {
        let vrf = VrfDevice {
            name: "vrf-green".into(),
            table: 665,
            interfaces: vec!["net1".into()],
            routing_policies: vec![super::super::machine::RoutingPolicy {
                table: Some(667),
                priority: 100,
                to: Some("0.0.0.0/0".into()),
                from: None,
            }],
        };
        let e = validate_vrfs(&[vrf]).unwrap_err();
        assert!(e.to_string().contains("device/rule routing table mismatch 665 != 667"));
    }
}
