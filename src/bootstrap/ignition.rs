//! Ignition (Flatcar) rendering: parses the bootstrap payload as Ignition
//! v2.3 and appends the hostname/environment files and systemd-networkd
//! units this spec requires.

use std::collections::BTreeMap;

use base64::Engine;
use serde_json::{json, Value};

use crate::api::machine::{NetworkDevice, VrfDevice};
use crate::ipam::ResolvedAddress;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{0}")]
    Message(String),
}

fn err(msg: impl Into<String>) -> RenderError {
    RenderError::Message(msg.into())
}

fn data_url(contents: &str) -> String {
    format!(
        "data:text/plain;charset=utf-8;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(contents)
    )
}

fn ignition_file(path: &str, mode: u32, contents: &str) -> Value {
    json!({
        "filesystem": "root",
        "path": path,
        "mode": mode,
        "contents": { "source": data_url(contents) }
    })
}

/// `netN` -> `ethN`, the predictable in-guest name this renderer assumes
/// for Flatcar's systemd-networkd units.
fn eth_name(device_name: &str) -> String {
    device_name.strip_prefix("net").map(|n| format!("eth{n}")).unwrap_or_else(|| device_name.to_string())
}

fn unit_filename(index: usize, eth: &str) -> String {
    format!("{:02}-{}.network", index, eth)
}

fn network_unit_contents(
    device: &NetworkDevice,
    eth: &str,
    mac: &str,
    resolved: &[&ResolvedAddress],
    member_of_vrf: Option<&str>,
    cluster_dns: &[String],
) -> String {
    let mut out = String::new();
    out.push_str("[Match]\n");
    out.push_str(&format!("MACAddress={}\n\n", mac));
    out.push_str("[Network]\n");
    if resolved.is_empty() {
        out.push_str("DHCP=yes\n");
    }
    for dns in device.dns_servers.as_deref().unwrap_or(cluster_dns) {
        out.push_str(&format!("DNS={}\n", dns));
    }
    if let Some(vrf) = member_of_vrf {
        out.push_str(&format!("VRF={}\n", vrf));
    }
    if let Some(mtu) = device.mtu.filter(|m| *m != 1) {
        out.push_str(&format!("MTUBytes={}\n", mtu));
    }
    out.push('\n');
    for addr in resolved {
        out.push_str("[Address]\n");
        out.push_str(&format!("Address={}/{}\n\n", addr.address, addr.prefix));
    }
    for addr in resolved.iter().filter(|a| a.is_default_for_device) {
        if let Some(gw) = &addr.gateway {
            out.push_str("[Route]\n");
            out.push_str(&format!("Gateway={}\n", gw));
            let metric = if eth == "eth0" { 100 } else { 200 };
            out.push_str(&format!("Metric={}\n\n", metric));
        }
    }
    out
}

fn vrf_netdev_contents(vrf: &VrfDevice) -> String {
    format!("[NetDev]\nName={}\nKind=vrf\n\n[VRF]\nTable={}\n", vrf.name, vrf.table)
}

fn vrf_network_contents(vrf: &VrfDevice) -> String {
    format!("[Match]\nName={}\n\n[Network]\n", vrf.name)
}

/// Renders the enriched Ignition config, given the bootstrap payload,
/// the machine's hostname/provider identifiers, its resolved per-device
/// addresses, and the MACs Proxmox assigned.
#[allow(clippy::too_many_arguments)]
pub fn render(
    bootstrap_payload: &str,
    machine_name: &str,
    provider_id: &str,
    network: &[NetworkDevice],
    vrfs: &[VrfDevice],
    macs: &BTreeMap<String, String>,
    resolved: &[ResolvedAddress],
    cluster_dns: &[String],
) -> Result<String, RenderError> {
    if network.is_empty() {
        return Err(err("at least one NIC is required to render ignition network units"));
    }

    let mut config: Value = serde_json::from_str(bootstrap_payload).map_err(|e| err(format!("payload is not valid JSON: {e}")))?;
    let version = config
        .get("ignition")
        .and_then(|i| i.get("version"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !version.starts_with("2.3") {
        return Err(err(format!("expected ignition v2.3 payload, got version {:?}", version)));
    }

    let mut member_of_vrf: BTreeMap<&str, &str> = BTreeMap::new();
    for vrf in vrfs {
        for iface in &vrf.interfaces {
            member_of_vrf.insert(iface.as_str(), vrf.name.as_str());
        }
    }

    let first_ipv4 = resolved.iter().find(|a| a.address.is_ipv4() && a.is_default_for_device);
    let first_ipv6 = resolved.iter().find(|a| a.address.is_ipv6() && a.is_default_for_device);

    let mut env = format!(
        "COREOS_CUSTOM_HOSTNAME={machine_name}\nCOREOS_CUSTOM_INSTANCE_ID={machine_name}\nCOREOS_CUSTOM_PROVIDER_ID={provider_id}\n"
    );
    if let Some(v4) = first_ipv4 {
        env.push_str(&format!("COREOS_CUSTOM_PRIVATE_IPV4={}/{}\n", v4.address, v4.prefix));
    }
    if let Some(v6) = first_ipv6 {
        env.push_str(&format!("COREOS_CUSTOM_PRIVATE_IPV6={}/{}\n", v6.address, v6.prefix));
    }

    let mut files = vec![
        ignition_file("/etc/hostname", 420, &format!("{}\n", machine_name)),
        ignition_file("/etc/proxmox-env", 420, &env),
    ];

    let mut sorted: Vec<&NetworkDevice> = network.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for (index, device) in sorted.iter().enumerate() {
        let eth = eth_name(&device.name);
        let mac = macs.get(&device.name).map(|s| s.as_str()).unwrap_or_default();
        let device_addrs: Vec<&ResolvedAddress> = resolved.iter().filter(|r| r.device == device.name).collect();
        let vrf = member_of_vrf.get(device.name.as_str()).copied();
        let contents = network_unit_contents(device, &eth, mac, &device_addrs, vrf, cluster_dns);
        files.push(ignition_file(&format!("/etc/systemd/network/{}", unit_filename(index, &eth)), 420, &contents));
    }

    for vrf in vrfs {
        files.push(ignition_file(&format!("/etc/systemd/network/{}.netdev", vrf.name), 420, &vrf_netdev_contents(vrf)));
        files.push(ignition_file(&format!("/etc/systemd/network/{}.network", vrf.name), 420, &vrf_network_contents(vrf)));
    }

    let storage = config.as_object_mut().unwrap().entry("storage").or_insert_with(|| json!({"files": []}));
    let existing_files = storage.get_mut("files").and_then(|f| f.as_array_mut());
    match existing_files {
        Some(arr) => arr.extend(files),
        None => {
            storage["files"] = Value::Array(files);
        }
    }

    let systemd = config.as_object_mut().unwrap().entry("systemd").or_insert_with(|| json!({"units": []}));
    let resolved_unit = json!({ "name": "systemd-resolved.service", "enabled": true });
    match systemd.get_mut("units").and_then(|u| u.as_array_mut()) {
        Some(arr) => arr.push(resolved_unit),
        None => systemd["units"] = Value::Array(vec![resolved_unit]),
    }

    serde_json::to_string(&config).map_err(|e| err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, default: bool) -> NetworkDevice {
        NetworkDevice {
            name: name.to_string(),
            bridge: "vmbr0".to_string(),
            model: Default::default(),
            vlan: None,
            mtu: None,
            default_ipv4: default,
            default_ipv6: false,
            ip_pool_refs: Vec::new(),
            routing_policies: Vec::new(),
            link_mtu: None,
            dns_servers: None,
        }
    }

    #[test]
    fn appends_hostname_env_and_network_units() {
        let payload = r#"{"ignition":{"version":"2.3.0"}}"#;
        let net = vec![device("net0", true)];
        let mut macs = BTreeMap::new();
        macs.insert("net0".to_string(), "aa:bb:cc:dd:ee:ff".to_string());
        let resolved = vec![
            ResolvedAddress {
                device: "net0".to_string(),
                pool_index: 0,
                address: "10.1.1.9".parse().unwrap(),
                prefix: 24,
                gateway: Some("10.1.1.1".to_string()),
                is_default_for_device: true,
            },
            ResolvedAddress {
                device: "net0".to_string(),
                pool_index: 1,
                address: "2001:db8::1".parse().unwrap(),
                prefix: 64,
                gateway: Some("2001:db8::".to_string()),
                is_default_for_device: true,
            },
        ];
        let rendered = render(payload, "worker-1", "proxmox://abc", &net, &[], &macs, &resolved, &[]).unwrap();
        assert!(rendered.contains("COREOS_CUSTOM_PRIVATE_IPV4=10.1.1.9/24"));
        assert!(rendered.contains("COREOS_CUSTOM_PRIVATE_IPV6=2001:db8::1/64"));
        assert!(rendered.contains("00-eth0.network"));
        assert!(rendered.contains("systemd-resolved.service"));
    }

    #[test]
    fn rejects_non_v2_3_payload() {
        let payload = r#"{"ignition":{"version":"3.0.0"}}"#;
        let err = render(payload, "m", "proxmox://x", &[device("net0", true)], &[], &BTreeMap::new(), &[], &[]).unwrap_err();
        assert!(matches!(err, RenderError::Message(_)));
    }
}
