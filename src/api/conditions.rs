//! Helpers around the CAPI-style condition list carried by both
//! `ProxmoxCluster` and `ProxmoxMachine` status (spec.md §3, §7).

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const VM_PROVISIONED: &str = "VMProvisioned";
pub const PROXMOX_AVAILABLE: &str = "ProxmoxAvailable";
pub const READY: &str = "Ready";
pub const PAUSED: &str = "Paused";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

/// Sets (inserts or updates in place) a condition by type, following the
/// usual CAPI/controller-runtime convention of one entry per `type_`.
pub fn set_condition(conditions: &mut Vec<Condition>, type_: &str, status: &str, reason: &str, message: &str) {
    let now = Time(Utc::now());
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        existing.observed_generation = None;
        return;
    }
    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: now,
        observed_generation: None,
    });
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == STATUS_TRUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_upserts() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, VM_PROVISIONED, STATUS_FALSE, "Cloning", "cloning vm");
        assert_eq!(conditions.len(), 1);
        set_condition(&mut conditions, VM_PROVISIONED, STATUS_TRUE, "Ready", "vm ready");
        assert_eq!(conditions.len(), 1);
        assert!(is_true(&conditions, VM_PROVISIONED));
    }
}
