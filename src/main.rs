//! `proxmox-capi-manager` — the controller-manager binary.
//!
//! Loads `ManagerConfig` from the environment/flags, builds the shared
//! `Context` (Kubernetes client, Proxmox facade, metrics), and runs the
//! cluster and machine reconcile loops side by side until shut down.

use std::sync::Arc;

use kube::Client;
use tracing_subscriber::EnvFilter;

use proxmox_capi::config::ManagerConfig;
use proxmox_capi::controllers::{cluster_controller, machine_controller, State};
use proxmox_capi::proxmox::ProxmoxClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .json()
        .init();

    let config = ManagerConfig::load()?;
    tracing::info!(
        proxmox_url = %config.proxmox_url,
        machine_concurrency = config.machine_concurrency,
        cluster_concurrency = config.cluster_concurrency,
        "starting proxmox-capi-manager"
    );

    let client = Client::try_default().await?;
    let proxmox = ProxmoxClient::new(
        &config.proxmox_url,
        &config.proxmox_token_id,
        &config.proxmox_token_secret,
        config.proxmox_insecure_skip_verify,
    )?;

    let state = State::default();
    let ctx = state.to_context(client, proxmox, config);

    tokio::join!(cluster_controller::run(ctx.clone()), machine_controller::run(ctx));

    tracing::info!("proxmox-capi-manager shut down");
    Ok(())
}
