//! ISO injection: packages rendered bootstrap files as an ISO9660 image
//! and uploads it to Proxmox storage as CD-ROM content.
//!
//! No pure-Rust ISO9660 writer is part of this stack, so (as real
//! hypervisor tooling commonly does) this shells out to `genisoimage`
//! (falling back to `mkisofs`), matching how Packer/Terraform's libvirt
//! tooling builds NoCloud/Ignition seed images.

use std::path::Path;

use tokio::process::Command;

use crate::errors::{Error, Result};

pub const NOCLOUD_VOLUME_ID: &str = "cidata";
pub const IGNITION_VOLUME_ID: &str = "ignition";

/// Writes `files` (name, contents) into a scratch directory and builds an
/// ISO9660+Joliet+RockRidge image with the given volume label.
pub async fn build_iso(files: &[(&str, &[u8])], volume_id: &str) -> Result<Vec<u8>> {
    let workdir = tempfile::tempdir().map_err(|e| Error::Transient(format!("tempdir: {e}")))?;
    for (name, contents) in files {
        let path = workdir.path().join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::Transient(format!("writing {name}: {e}")))?;
    }

    let iso_path = workdir.path().join("seed.iso");
    let status = run_iso_builder(workdir.path(), &iso_path, volume_id).await?;
    if !status.success() {
        return Err(Error::Transient(format!("iso builder exited with {status}")));
    }

    tokio::fs::read(&iso_path)
        .await
        .map_err(|e| Error::Transient(format!("reading built iso: {e}")))
}

async fn run_iso_builder(workdir: &Path, iso_path: &Path, volume_id: &str) -> Result<std::process::ExitStatus> {
    for binary in ["genisoimage", "mkisofs"] {
        let result = Command::new(binary)
            .arg("-output")
            .arg(iso_path)
            .arg("-volid")
            .arg(volume_id)
            .arg("-joliet")
            .arg("-rock")
            .arg(workdir)
            .status()
            .await;
        match result {
            Ok(status) => return Ok(status),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::Transient(format!("spawning {binary}: {e}"))),
        }
    }
    Err(Error::Transient("neither genisoimage nor mkisofs is installed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_ids_match_datasource_expectations() {
        assert_eq!(NOCLOUD_VOLUME_ID, "cidata");
        assert_eq!(IGNITION_VOLUME_ID, "ignition");
    }
}
