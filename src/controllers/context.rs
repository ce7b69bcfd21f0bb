//! Shared reconciler context: Kubernetes client, Proxmox facade, metrics,
//! and diagnostics — generalized from the teacher's `State`/`Context`
//! pair in the molnett-neon-operator reference controller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::events::{Recorder, Reporter};
use kube::Client;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};

use super::metrics::Metrics;
use crate::config::ManagerConfig;
use crate::proxmox::ProxmoxClient;

pub struct Context {
    pub client: Client,
    pub proxmox: ProxmoxClient,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Metrics,
    /// Bounds how many `ProxmoxMachine` reconciles run at once
    /// (`ManagerConfig::machine_concurrency`).
    pub machine_concurrency: Arc<Semaphore>,
    /// Bounds how many `ProxmoxCluster` reconciles run at once
    /// (`ManagerConfig::cluster_concurrency`).
    pub cluster_concurrency: Arc<Semaphore>,
    pub config: ManagerConfig,
}

#[derive(Clone, Default)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    registry: prometheus::Registry,
}

impl State {
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context(&self, client: Client, proxmox: ProxmoxClient, config: ManagerConfig) -> Arc<Context> {
        Arc::new(Context {
            client,
            proxmox,
            metrics: Metrics::default().register(&self.registry).expect("metrics register"),
            diagnostics: self.diagnostics.clone(),
            machine_concurrency: Arc::new(Semaphore::new(config.machine_concurrency)),
            cluster_concurrency: Arc::new(Semaphore::new(config.cluster_concurrency)),
            config,
        })
    }
}

#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "proxmox-capi-manager".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}
