//! Manager configuration: Proxmox endpoint/credentials and reconcile
//! tuning, loaded from the environment or flags.
//!
//! Mirrors how the teacher's CLI (`cli/main.rs`) and `alchezar-dashboard`
//! load settings: `clap::Parser` with `env` attributes, `.env` loaded via
//! `dotenv` before parsing.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "proxmox-capi-manager")]
#[command(about = "Cluster API infrastructure provider for Proxmox VE", long_about = None)]
pub struct ManagerConfig {
    /// Base URL of the Proxmox API, e.g. https://10.0.0.5:8006/api2/json
    #[arg(long, env = "PROXMOX_URL")]
    pub proxmox_url: String,

    /// API token id, e.g. root@pam!capi
    #[arg(long, env = "PROXMOX_TOKEN_ID")]
    pub proxmox_token_id: String,

    /// API token secret
    #[arg(long, env = "PROXMOX_TOKEN_SECRET")]
    pub proxmox_token_secret: String,

    /// Skip TLS verification (Proxmox commonly runs with a self-signed cert)
    #[arg(long, env = "PROXMOX_INSECURE_SKIP_VERIFY", default_value_t = true)]
    pub proxmox_insecure_skip_verify: bool,

    /// Maximum number of ProxmoxMachine reconciles running concurrently
    #[arg(long, env = "MACHINE_CONCURRENCY", default_value_t = 10)]
    pub machine_concurrency: usize,

    /// Maximum number of ProxmoxCluster reconciles running concurrently
    #[arg(long, env = "CLUSTER_CONCURRENCY", default_value_t = 4)]
    pub cluster_concurrency: usize,

    /// Namespace to restrict watches to; empty means cluster-wide
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,

    /// Proxmox storage (content type `iso`) bootstrap ISOs are uploaded to
    /// before being attached as a CD-ROM.
    #[arg(long, env = "ISO_STORAGE", default_value = "local")]
    pub iso_storage: String,
}

impl ManagerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenv::dotenv();
        Ok(Self::parse())
    }
}
