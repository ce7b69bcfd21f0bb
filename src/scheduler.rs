//! Placement Scheduler (spec.md §4.2): picks the Proxmox node and VM ID a
//! new machine lands on.

use std::collections::BTreeSet;

use tracing::debug;

use crate::api::cluster::{MachineRole, NodeLocationLedger};
use crate::errors::{Error, Result};
use crate::proxmox::{Error as ProxmoxError, ProxmoxClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub node: String,
}

/// Candidate node set: machine-level `allowedNodes` override union
/// cluster-level `allowedNodes`; if both are empty, the template's source
/// node is the only candidate.
pub fn candidate_nodes(
    machine_allowed: Option<&[String]>,
    cluster_allowed: &[String],
    template_source_node: &str,
) -> Vec<String> {
    let mut set: BTreeSet<String> = BTreeSet::new();
    if let Some(nodes) = machine_allowed {
        set.extend(nodes.iter().cloned());
    }
    set.extend(cluster_allowed.iter().cloned());
    if set.is_empty() {
        set.insert(template_source_node.to_string());
    }
    set.into_iter().collect()
}

/// Filters candidates to those with enough reservable memory headroom,
/// then picks the one hosting the fewest same-role machines on the
/// ledger, tie-broken lexicographically.
pub async fn choose_node(
    client: &ProxmoxClient,
    candidates: &[String],
    memory_adjustment_pct: u8,
    desired_memory_mib: u32,
    ledger: &NodeLocationLedger,
    role: MachineRole,
) -> Result<Placement> {
    let desired_bytes = (desired_memory_mib as u64) << 20;
    let mut admissible = Vec::new();

    for node in candidates {
        let reservable = client
            .get_reservable_memory_bytes(node, memory_adjustment_pct)
            .await
            .map_err(Error::Proxmox)?;
        debug!(node, reservable, desired_bytes, "evaluated node admissibility");
        if reservable >= desired_bytes {
            admissible.push(node.clone());
        }
    }

    if admissible.is_empty() {
        return Err(Error::Transient(format!(
            "no admissible node among {:?} for {} MiB",
            candidates, desired_memory_mib
        )));
    }

    admissible.sort_by(|a, b| {
        let count_a = ledger.count_on_node(role, a);
        let count_b = ledger.count_on_node(role, b);
        count_a.cmp(&count_b).then_with(|| a.cmp(b))
    });

    Ok(Placement {
        node: admissible[0].clone(),
    })
}

/// Selects a free VM ID, preferring the explicit range when the machine
/// specifies one. An explicit range being exhausted is terminal; the
/// open-ended default range is practically inexhaustible so its
/// exhaustion is reported the same way for completeness.
pub async fn choose_vm_id(client: &ProxmoxClient, explicit_range: Option<(i64, i64)>) -> Result<i64> {
    let (start, end) = explicit_range.unwrap_or((100, 999_999_999));
    for candidate in start..=end {
        match client.check_id(candidate).await {
            Ok(true) => return Ok(candidate),
            Ok(false) => continue,
            Err(e) => return Err(Error::Proxmox(e)),
        }
    }
    let exhausted = ProxmoxError::VmIdRangeExhausted { start, end };
    if explicit_range.is_some() {
        Err(Error::terminal("VmIdRangeExhausted", exhausted.to_string()))
    } else {
        Err(Error::Proxmox(exhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_nodes_falls_back_to_template_source() {
        let nodes = candidate_nodes(None, &[], "pve1");
        assert_eq!(nodes, vec!["pve1".to_string()]);
    }

    #[test]
    fn candidate_nodes_unions_and_dedupes() {
        let machine = vec!["pve1".to_string(), "pve2".to_string()];
        let nodes = candidate_nodes(Some(&machine), &["pve2".to_string(), "pve3".to_string()], "pve9");
        assert_eq!(nodes, vec!["pve1".to_string(), "pve2".to_string(), "pve3".to_string()]);
    }
}
