//! Proxmox VE API facade (spec.md §4.7), generalized from the teacher's
//! `src/proxmox.rs` hand-rolled client.

pub mod client;
pub mod error;
pub mod types;

pub use client::ProxmoxClient;
pub use error::{Error, Result};
