//! Template Resolver (spec.md §4.3): resolves a `templateSource` to a
//! concrete `(node, templateID)` — or, for local-storage clusters, one per
//! allowed node.

use std::collections::{BTreeMap, BTreeSet};

use crate::api::machine::TemplateSource;
use crate::proxmox::types::Vm;
use crate::proxmox::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Shared-storage: a single template usable from any allowed node.
    Shared { node: String, template_id: i64 },
    /// Local-storage: one template per allowed node.
    PerNode(BTreeMap<String, i64>),
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut set: BTreeSet<String> = tags.iter().map(|t| t.to_lowercase()).collect();
    set.retain(|t| !t.is_empty());
    set.into_iter().collect()
}

/// `candidates` is the raw cluster-wide template enumeration (already
/// filtered to `isTemplate=true` entries with non-empty tags by the
/// Proxmox facade's `list_tagged_templates`).
pub fn resolve(
    source: &TemplateSource,
    candidates: &[Vm],
    allowed_nodes: &[String],
    local_storage: bool,
) -> Result<Resolution, Error> {
    if let (Some(node), Some(template_id)) = (&source.source_node, source.template_id) {
        return Ok(Resolution::Shared {
            node: node.clone(),
            template_id,
        });
    }

    let Some(selector) = &source.template_selector else {
        return Err(Error::TemplateNotFound(Vec::new()));
    };
    let desired = normalize_tags(&selector.match_tags);

    let matches: Vec<&Vm> = candidates
        .iter()
        .filter(|vm| normalize_tags(&vm.tag_set()) == desired)
        .collect();

    if matches.is_empty() {
        return Err(Error::TemplateNotFound(desired));
    }

    if local_storage {
        let mut per_node: BTreeMap<String, i64> = BTreeMap::new();
        for vm in &matches {
            if let Some(existing) = per_node.get(&vm.node) {
                if *existing != vm.vmid {
                    return Err(Error::MultipleTemplatesFound(vm.node.clone()));
                }
            } else {
                per_node.insert(vm.node.clone(), vm.vmid);
            }
        }
        for node in allowed_nodes {
            if !per_node.contains_key(node) {
                return Err(Error::TemplateNotFound(desired));
            }
        }
        Ok(Resolution::PerNode(per_node))
    } else {
        let mut by_node: BTreeMap<&str, i64> = BTreeMap::new();
        for vm in &matches {
            if by_node.insert(vm.node.as_str(), vm.vmid).is_some() {
                return Err(Error::MultipleTemplatesFound(vm.node.clone()));
            }
        }
        if by_node.len() > 1 {
            return Err(Error::MultipleTemplatesFound(
                by_node.keys().next().unwrap_or(&"").to_string(),
            ));
        }
        let (node, template_id) = by_node.into_iter().next().expect("matches non-empty");
        Ok(Resolution::Shared {
            node: node.to_string(),
            template_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::machine::TemplateSelector;

    fn vm(node: &str, id: i64, tags: &str) -> Vm {
        Vm {
            vmid: id,
            node: node.to_string(),
            name: None,
            status: "stopped".to_string(),
            maxmem: 0,
            cpus: 0,
            tags: Some(tags.to_string()),
            template: Some(1),
        }
    }

    fn selector(tags: &[&str]) -> TemplateSource {
        TemplateSource {
            source_node: None,
            template_id: None,
            template_selector: Some(TemplateSelector {
                match_tags: tags.iter().map(|s| s.to_string()).collect(),
                local_storage: false,
            }),
        }
    }

    #[test]
    fn explicit_mode_is_passthrough() {
        let source = TemplateSource {
            source_node: Some("pve1".to_string()),
            template_id: Some(9000),
            template_selector: None,
        };
        let resolved = resolve(&source, &[], &[], false).unwrap();
        assert_eq!(
            resolved,
            Resolution::Shared {
                node: "pve1".to_string(),
                template_id: 9000
            }
        );
    }

    #[test]
    fn selector_mode_requires_exact_tag_set() {
        let candidates = vec![vm("pve1", 9000, "k8s;v1.30"), vm("pve2", 9001, "k8s;v1.29")];
        let source = selector(&["k8s", "v1.30"]);
        let resolved = resolve(&source, &candidates, &[], false).unwrap();
        assert_eq!(
            resolved,
            Resolution::Shared {
                node: "pve1".to_string(),
                template_id: 9000
            }
        );
    }

    #[test]
    fn zero_matches_is_template_not_found() {
        let source = selector(&["missing"]);
        let err = resolve(&source, &[], &[], false).unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(_)));
    }

    #[test]
    fn multiple_matches_same_node_is_fatal() {
        let candidates = vec![vm("pve1", 9000, "k8s;v1.30"), vm("pve1", 9002, "k8s;v1.30")];
        let source = selector(&["k8s", "v1.30"]);
        let err = resolve(&source, &candidates, &[], false).unwrap_err();
        assert!(matches!(err, Error::MultipleTemplatesFound(_)));
    }

    #[test]
    fn local_storage_requires_full_node_coverage() {
        let candidates = vec![vm("pve1", 9000, "k8s;v1.30")];
        let source = selector(&["k8s", "v1.30"]);
        let err = resolve(&source, &candidates, &["pve1".to_string(), "pve2".to_string()], true).unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(_)));
    }

    #[test]
    fn local_storage_returns_per_node_map_when_covered() {
        let candidates = vec![vm("pve1", 9000, "k8s;v1.30"), vm("pve2", 9001, "k8s;v1.30")];
        let source = selector(&["k8s", "v1.30"]);
        let resolved = resolve(&source, &candidates, &["pve1".to_string(), "pve2".to_string()], true).unwrap();
        match resolved {
            Resolution::PerNode(map) => {
                assert_eq!(map.get("pve1"), Some(&9000));
                assert_eq!(map.get("pve2"), Some(&9001));
            }
            _ => panic!("expected per-node resolution"),
        }
    }
}
