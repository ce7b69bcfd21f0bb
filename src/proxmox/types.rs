//! Wire types for the Proxmox VE REST API, generalized from the teacher's
//! `LxcConfig`/`VmConfig`/`WorkloadStatus` (src/proxmox.rs) to the fuller
//! VM-lifecycle surface this spec needs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `{"data": ...}` envelope every Proxmox API response is wrapped in.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub data: Option<T>,
}

/// A Proxmox VM as reported by `GET /nodes/{node}/qemu/{vmid}/status/current`
/// and `GET /cluster/resources?type=vm`.
#[derive(Debug, Clone, Deserialize)]
pub struct Vm {
    pub vmid: i64,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    /// "running", "stopped", ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub template: Option<u8>,
}

impl Vm {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_template(&self) -> bool {
        self.template.unwrap_or(0) != 0
    }

    pub fn tag_set(&self) -> Vec<String> {
        match &self.tags {
            Some(s) if !s.is_empty() => s.split(';').map(|t| t.to_string()).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatusMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatus {
    pub memory: NodeStatusMemory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResourceItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub vmid: Option<i64>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub template: Option<u8>,
}

/// An in-flight asynchronous Proxmox operation, identified by its UPID
/// string `UPID:<node>:<pid-hex>:...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task(pub String);

impl Task {
    pub fn node(&self) -> Option<&str> {
        self.0.split(':').nth(1)
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    /// "running" | "stopped"
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_complete(&self) -> bool {
        self.status == "stopped"
    }

    pub fn is_success(&self) -> bool {
        self.is_complete() && self.exitstatus.as_deref() == Some("OK")
    }
}

/// Parameters for `POST /nodes/{node}/qemu/{templateid}/clone`.
#[derive(Debug, Clone, Serialize)]
pub struct CloneParams {
    pub newid: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// 1 = full clone, 0 = linked clone.
    pub full: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapname: Option<String>,
}

/// Parameters for `POST /nodes/{node}/qemu/{vmid}/config` — a sparse
/// key/value patch, matching Proxmox's own "set only what's given" form
/// semantics. Keys absent here are left alone on the VM.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    /// `netN` -> Proxmox NIC descriptor string (model=mac,bridge=...,...).
    #[serde(flatten)]
    pub net: BTreeMap<String, String>,
    /// `ipconfigN` -> `ip=.../gw=...` descriptor.
    #[serde(flatten)]
    pub ipconfig: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cicustom: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
    /// Any other device key (`ide0`, `ide2`, `sata0`, ...) -> descriptor,
    /// used for CD-ROM/ISO attach where the device name is caller-chosen.
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QemuAgentStatus {
    pub running: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudInitStatus {
    pub running: bool,
    pub failed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentNetworkInterface {
    pub name: String,
    #[serde(rename = "hardware-address", default)]
    pub hardware_address: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
    #[serde(rename = "prefix")]
    pub prefix: u8,
}
