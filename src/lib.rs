//! Cluster API infrastructure provider for Proxmox VE.
//!
//! The library crate exports the CRD types, the reconcile phases, and the
//! helper subsystems (scheduler, template resolver, IPAM coordinator,
//! bootstrap renderer, Proxmox facade) that the `proxmox-capi-manager`
//! binary wires into a running controller, and that `crdgen` uses to emit
//! CRD manifests.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod controllers;
pub mod errors;
pub mod ipam;
pub mod proxmox;
pub mod scheduler;
pub mod template_resolver;

pub use config::ManagerConfig;
pub use errors::Error;
pub use proxmox::ProxmoxClient;
