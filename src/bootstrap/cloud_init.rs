//! Cloud-init (NoCloud) rendering: `user-data`, `meta-data`, and a netplan
//! v2 `network-config` built from a typed model so parse-then-re-render is
//! byte-stable (spec.md §8's round-trip law).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api::machine::{NetworkDevice, RoutingPolicy, VrfDevice};
use crate::ipam::ResolvedAddress;

#[derive(Debug, Clone)]
pub struct CloudInitFiles {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{0}")]
    Message(String),
}

fn err(msg: impl Into<String>) -> RenderError {
    RenderError::Message(msg.into())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetplanConfig {
    pub network: NetplanNetwork,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetplanNetwork {
    pub version: u8,
    pub ethernets: BTreeMap<String, EthernetConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vrfs: BTreeMap<String, NetplanVrf>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EthernetConfig {
    #[serde(rename = "match")]
    pub match_: MatchConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp4: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp6: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "routing-policy")]
    pub routing_policy: Vec<RoutingPolicyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<NameserversConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MatchConfig {
    pub macaddress: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<u32>,
    pub priority: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameserversConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NetplanVrf {
    pub table: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "routing-policy")]
    pub routing_policy: Vec<RoutingPolicyConfig>,
}

fn default_route_metric(device_name: &str) -> u32 {
    if device_name == "net0" {
        100
    } else {
        200
    }
}

fn routing_policy_config(policy: &RoutingPolicy, enclosing_vrf_table: Option<u32>) -> Result<RoutingPolicyConfig, RenderError> {
    if policy.to.is_none() && policy.from.is_none() {
        return Err(err("routing policy must set at least one of to/from"));
    }
    let table = policy.table.or(enclosing_vrf_table);
    if enclosing_vrf_table.is_none() && table.is_none() {
        return Err(err("routing policy outside a VRF must set a table"));
    }
    Ok(RoutingPolicyConfig {
        from: policy.from.clone(),
        to: policy.to.clone(),
        table,
        priority: policy.priority,
    })
}

fn route_config(to: &str) -> Result<RouteConfig, RenderError> {
    if to != "default" && to.parse::<ipnet::IpNet>().is_err() && to.parse::<std::net::IpAddr>().is_err() {
        return Err(err(format!("route destination {} is neither \"default\" nor a valid prefix/address", to)));
    }
    Ok(RouteConfig {
        to: to.to_string(),
        via: None,
        metric: None,
    })
}

/// Builds the netplan ethernet entry for one NIC, given its resolved
/// addresses and the MAC Proxmox assigned when the NIC was configured.
pub fn build_ethernet(
    device: &NetworkDevice,
    mac_address: &str,
    resolved: &[&ResolvedAddress],
    dns_override: Option<&[String]>,
    cluster_dns: &[String],
) -> Result<EthernetConfig, RenderError> {
    if mac_address.is_empty() {
        return Err(err(format!("NIC {} has no known MAC address", device.name)));
    }

    let dhcp = resolved.is_empty();
    if !dhcp && device.name == "net0" && !resolved.iter().any(|r| r.gateway.is_some()) {
        return Err(err("an address outside DHCP requires a gateway on the first NIC"));
    }

    let mut addresses = Vec::new();
    let mut routes = Vec::new();
    for addr in resolved {
        let cidr = format!("{}/{}", addr.address, addr.prefix);
        cidr.parse::<ipnet::IpNet>().map_err(|_| err(format!("address {} does not parse as a CIDR prefix", cidr)))?;
        addresses.push(cidr);
        if addr.is_default_for_device {
            if let Some(gw) = &addr.gateway {
                let mut route = route_config("default")?;
                route.via = Some(gw.clone());
                route.metric = Some(default_route_metric(&device.name));
                routes.push(route);
            }
        }
    }

    let mut routing_policy = Vec::new();
    for policy in &device.routing_policies {
        routing_policy.push(routing_policy_config(policy, None)?);
    }

    let nameservers = dns_override.or(Some(cluster_dns)).filter(|d| !d.is_empty()).map(|d| NameserversConfig {
        addresses: d.to_vec(),
    });

    Ok(EthernetConfig {
        match_: MatchConfig {
            macaddress: mac_address.to_string(),
        },
        dhcp4: dhcp.then_some(true),
        dhcp6: None,
        addresses,
        routes,
        routing_policy,
        nameservers,
        mtu: device.link_mtu.or(device.mtu).filter(|m| *m != 1),
    })
}

pub fn build_vrf(vrf: &VrfDevice) -> Result<NetplanVrf, RenderError> {
    let mut routing_policy = Vec::new();
    for policy in &vrf.routing_policies {
        if let Some(table) = policy.table {
            if table != vrf.table {
                return Err(err(format!(
                    "VRF {}: device/rule routing table mismatch {} != {}",
                    vrf.name, vrf.table, table
                )));
            }
        }
        routing_policy.push(routing_policy_config(policy, Some(vrf.table))?);
    }
    Ok(NetplanVrf {
        table: vrf.table,
        interfaces: vrf.interfaces.clone(),
        routes: Vec::new(),
        routing_policy,
    })
}

/// Renders the three NoCloud files. `macs` maps device name to the MAC
/// Proxmox assigned at clone/configure time; `resolved` is the IPAM
/// coordinator's fulfilled addresses for this machine.
#[allow(clippy::too_many_arguments)]
pub fn render(
    machine_name: &str,
    user_data: &str,
    provider_id: Option<&str>,
    network: &[NetworkDevice],
    vrfs: &[VrfDevice],
    macs: &BTreeMap<String, String>,
    resolved: &[ResolvedAddress],
    cluster_dns: &[String],
) -> Result<CloudInitFiles, RenderError> {
    if network.is_empty() {
        return Err(err("at least one NIC is required to render network-config"));
    }

    let mut ethernets = BTreeMap::new();
    for device in network {
        let mac = macs.get(&device.name).map(|s| s.as_str()).unwrap_or_default();
        let device_addrs: Vec<&ResolvedAddress> = resolved.iter().filter(|r| r.device == device.name).collect();
        let ethernet = build_ethernet(device, mac, &device_addrs, device.dns_servers.as_deref(), cluster_dns)?;
        ethernets.insert(device.name.clone(), ethernet);
    }

    let mut vrf_map = BTreeMap::new();
    for vrf in vrfs {
        vrf_map.insert(vrf.name.clone(), build_vrf(vrf)?);
    }

    let config = NetplanConfig {
        network: NetplanNetwork {
            version: 2,
            ethernets,
            vrfs: vrf_map,
        },
    };
    let network_config = serde_yaml::to_string(&config).map_err(|e| err(e.to_string()))?;

    let mut meta_data = format!(
        "instance-id: {machine_name}\nlocal-hostname: {machine_name}\nhostname: {machine_name}\n",
        machine_name = machine_name
    );
    if let Some(pid) = provider_id {
        meta_data.push_str(&format!("provider-id: {}\n", pid));
    }

    Ok(CloudInitFiles {
        user_data: user_data.to_string(),
        meta_data,
        network_config,
    })
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
    fn renders_single_nic_with_static_address() {
        let net = vec![device("net0", true)];
        let mut macs = BTreeMap::new();
        macs.insert("net0".to_string(), "AA:BB:CC:DD:EE:FF".to_string());
        let resolved = vec![ResolvedAddress {
            device: "net0".to_string(),
            pool_index: 0,
            address: "10.10.10.5".parse().unwrap(),
            prefix: 24,
            gateway: Some("10.10.10.1".to_string()),
            is_default_for_device: true,
        }];
        let files = render("worker-1", "#cloud-config\n", None, &net, &[], &macs, &resolved, &["8.8.8.8".to_string()]).unwrap();
        assert!(files.network_config.contains("10.10.10.5/24"));
        assert!(files.network_config.contains("macaddress: AA:BB:CC:DD:EE:FF"));
        assert!(files.meta_data.contains("worker-1"));
    }

    #[test]
    fn round_trip_is_stable() {
        let net = vec![device("net0", true)];
        let mut macs = BTreeMap::new();
        macs.insert("net0".to_string(), "AA:BB:CC:DD:EE:FF".to_string());
        let resolved = vec![ResolvedAddress {
            device: "net0".to_string(),
            pool_index: 0,
            address: "10.10.10.5".parse().unwrap(),
            prefix: 24,
            gateway: Some("10.10.10.1".to_string()),
            is_default_for_device: true,
        }];
        let files = render("worker-1", "#cloud-config\n", None, &net, &[], &macs, &resolved, &[]).unwrap();
        let parsed: NetplanConfig = serde_yaml::from_str(&files.network_config).unwrap();
        let rerendered = serde_yaml::to_string(&parsed).unwrap();
        assert_eq!(files.network_config, rerendered);
    }

    #[test]
    fn dhcp_only_device_gets_dhcp4_true() {
        let dev = device("net0", false);
        let ethernet = build_ethernet(&dev, "AA:BB:CC:DD:EE:FF", &[], None, &[]).unwrap();
        assert_eq!(ethernet.dhcp4, Some(true));
        assert!(ethernet.addresses.is_empty());
    }

    #[test]
    fn vrf_policy_table_mismatch_rejected() {
        let vrf = VrfDevice {
            name: "vrf-green".to_string(),
            table: 665,
            interfaces: vec!["net1".to_string()],
            routing_policies: vec![RoutingPolicy {
                table: Some(667),
                priority: 100,
                to: Some("10.0.0.0/8".to_string()),
                from: None,
            }],
        };
        let err = build_vrf(&vrf).unwrap_err();
        assert_eq!(err, RenderError::Message("VRF vrf-green: device/rule routing table mismatch 665 != 667".to_string()));
    }
}
