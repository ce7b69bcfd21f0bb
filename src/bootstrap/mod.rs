//! Bootstrap Renderer (spec.md §4.5): turns the bootstrap-data secret into
//! a cloud-init or Ignition payload and packages it as a CD-ROM ISO.

pub mod cloud_init;
pub mod ignition;
pub mod iso;

use std::collections::BTreeMap;

use crate::api::machine::{NetworkDevice, VrfDevice};
use crate::errors::{Error, Result};
use crate::ipam::ResolvedAddress;

pub const DEFAULT_ISO_DEVICE: &str = "ide0";

/// The ISO's origin, tagged onto the VM so phase 11 (unmount & finalize)
/// knows which device to detach and, for Ignition, which tag to strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapFormat {
    CloudConfig,
    Ignition,
}

impl BootstrapFormat {
    pub fn from_secret_field(format: &str) -> Result<Self> {
        match format {
            "cloud-config" => Ok(BootstrapFormat::CloudConfig),
            "ignition" => Ok(BootstrapFormat::Ignition),
            other => Err(Error::InvalidSpec(format!("unsupported bootstrap data format {other:?}"))),
        }
    }

    pub fn iso_tag(self) -> &'static str {
        match self {
            BootstrapFormat::CloudConfig => "bootstrap-iso-nocloud",
            BootstrapFormat::Ignition => "bootstrap-iso-ignition",
        }
    }

    fn volume_id(self) -> &'static str {
        match self {
            BootstrapFormat::CloudConfig => iso::NOCLOUD_VOLUME_ID,
            BootstrapFormat::Ignition => iso::IGNITION_VOLUME_ID,
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn render_and_package(
    format: BootstrapFormat,
    bootstrap_payload: &str,
    machine_name: &str,
    provider_id: Option<&str>,
    network: &[NetworkDevice],
    vrfs: &[VrfDevice],
    macs: &BTreeMap<String, String>,
    resolved: &[ResolvedAddress],
    cluster_dns: &[String],
) -> Result<Vec<u8>> {
    let files: Vec<(String, Vec<u8>)> = match format {
        BootstrapFormat::CloudConfig => {
            let rendered = cloud_init::render(machine_name, bootstrap_payload, provider_id, network, vrfs, macs, resolved, cluster_dns)
                .map_err(|e| Error::InvalidSpec(e.to_string()))?;
            vec![
                ("user-data".to_string(), rendered.user_data.into_bytes()),
                ("meta-data".to_string(), rendered.meta_data.into_bytes()),
                ("network-config".to_string(), rendered.network_config.into_bytes()),
            ]
        }
        BootstrapFormat::Ignition => {
            let provider_id = provider_id.unwrap_or_default();
            let rendered = ignition::render(bootstrap_payload, machine_name, provider_id, network, vrfs, macs, resolved, cluster_dns)
                .map_err(|e| Error::InvalidSpec(e.to_string()))?;
            vec![("user_data".to_string(), rendered.into_bytes())]
        }
    };

    let refs: Vec<(&str, &[u8])> = files.iter().map(|(name, bytes)| (name.as_str(), bytes.as_slice())).collect();
    iso::build_iso(&refs, format.volume_id()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_secret_field() {
        assert_eq!(BootstrapFormat::from_secret_field("cloud-config").unwrap(), BootstrapFormat::CloudConfig);
        assert_eq!(BootstrapFormat::from_secret_field("ignition").unwrap(), BootstrapFormat::Ignition);
        assert!(BootstrapFormat::from_secret_field("yaml").is_err());
    }
}
