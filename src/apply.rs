use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::adapter::{AdapterError, WorkloadAdapter, FIELD_MANAGER};
use crate::recommend::{AlignmentRecommendation, ContainerAlignment};
use crate::workload::{format_cpu, format_memory, ContainerResources, WorkloadReference};

/* ============================= TYPES ============================= */

/// Field managers owned by continuous-reconciliation controllers.
/// Matched case-insensitively by substring.
pub const GITOPS_MANAGERS: &[&str] = &["argocd", "flux", "helm-controller", "kustomize-controller"];

/// One admitted value diverging from what was requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDrift {
    pub container: String,
    pub field: String,
    pub requested: String,
    pub admitted: String,
}

/// Per-container formatted field values, keyed container → field.
pub type ResourceMap = BTreeMap<String, BTreeMap<String, String>>;

/// Structured outcome of an apply attempt. Returned even on failure;
/// only unrecoverable invariant violations surface as errors upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ApplyResult {
    pub applied: bool,
    pub denial_reasons: Vec<String>,
    pub conflict_manager: Option<String>,
    pub gitops_conflict: bool,
    pub error: Option<String>,
    pub requested: ResourceMap,
    pub admitted: ResourceMap,
    pub drifts: Vec<ResourceDrift>,
}

impl ApplyResult {
    /// A gate denial: nothing was submitted.
    pub fn denied(reasons: Vec<String>) -> Self {
        Self {
            denial_reasons: reasons,
            ..Default::default()
        }
    }
}

/* ============================= PATCH BUILDING ============================= */

/// Build the minimal server-side-apply document: identity fields plus
/// only the container resources being changed.
pub fn build_apply_patch(
    workload: &WorkloadReference,
    containers: &[ContainerAlignment],
) -> serde_json::Value {
    let container_entries: Vec<serde_json::Value> = containers
        .iter()
        .map(|c| {
            serde_json::json!({
                "name": c.recommended.name,
                "resources": {
                    "requests": {
                        "cpu": format_cpu(c.recommended.cpu_request),
                        "memory": format_memory(c.recommended.memory_request),
                    },
                    "limits": {
                        "cpu": format_cpu(c.recommended.cpu_limit),
                        "memory": format_memory(c.recommended.memory_limit),
                    },
                }
            })
        })
        .collect();

    serde_json::json!({
        "apiVersion": workload.kind.api_version(),
        "kind": workload.kind.as_str(),
        "metadata": {
            "name": workload.name,
            "namespace": workload.namespace,
        },
        "spec": {
            "template": {
                "spec": {
                    "containers": container_entries,
                }
            }
        }
    })
}

/* ============================= CONFLICT CLASSIFICATION ============================= */

/// Does this error message describe a server-side-apply conflict?
pub fn is_conflict_error(message: &str) -> bool {
    message.contains("conflict") || message.contains("Conflict") || message.contains("409")
}

/// Pick the conflicting field manager out of the managedFields owners.
///
/// A GitOps controller is preferred and flagged; otherwise the first
/// owner that is neither kubenow itself nor a GitOps manager is blamed.
pub fn classify_conflict(owners: &[String]) -> (Option<String>, bool) {
    let is_gitops = |owner: &str| {
        let lower = owner.to_lowercase();
        GITOPS_MANAGERS.iter().any(|g| lower.contains(g))
    };

    if let Some(gitops) = owners.iter().find(|o| is_gitops(o)) {
        return (Some(gitops.clone()), true);
    }

    let other = owners
        .iter()
        .find(|o| o.as_str() != FIELD_MANAGER && !is_gitops(o));
    (other.cloned(), false)
}

/* ============================= DRIFT ============================= */

fn formatted_fields(r: &ContainerResources) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("cpu_request".to_string(), format_cpu(r.cpu_request)),
        ("cpu_limit".to_string(), format_cpu(r.cpu_limit)),
        ("memory_request".to_string(), format_memory(r.memory_request)),
        ("memory_limit".to_string(), format_memory(r.memory_limit)),
    ])
}

/// Map of what the patch asked for, container → field → value.
pub fn requested_map(containers: &[ContainerAlignment]) -> ResourceMap {
    containers
        .iter()
        .map(|c| (c.recommended.name.clone(), formatted_fields(&c.recommended)))
        .collect()
}

/// Map of what the cluster admitted.
pub fn admitted_map(admitted: &[ContainerResources]) -> ResourceMap {
    admitted
        .iter()
        .map(|c| (c.name.clone(), formatted_fields(c)))
        .collect()
}

/// Compare requested against admitted values field by field. A
/// container missing from the read-back compares as all-zero values.
pub fn compute_drift(
    containers: &[ContainerAlignment],
    admitted: &[ContainerResources],
) -> Vec<ResourceDrift> {
    let mut drifts = Vec::new();

    for c in containers {
        let name = &c.recommended.name;
        let empty = ContainerResources {
            name: name.clone(),
            ..Default::default()
        };
        let actual = admitted.iter().find(|a| &a.name == name).unwrap_or(&empty);

        let requested = formatted_fields(&c.recommended);
        let observed = formatted_fields(actual);

        for (field, want) in requested {
            let got = observed.get(&field).cloned().unwrap_or_default();
            if got != want {
                drifts.push(ResourceDrift {
                    container: name.clone(),
                    field,
                    requested: want,
                    admitted: got,
                });
            }
        }
    }

    drifts
}

/* ============================= EXECUTION ============================= */

/// Submit the server-side apply and verify admission via read-back.
///
/// Gate denials never reach this function; it assumes the caller has
/// already checked actionability and created the audit bundle.
pub async fn execute(
    adapter: &WorkloadAdapter,
    workload: &WorkloadReference,
    recommendation: &AlignmentRecommendation,
) -> ApplyResult {
    let mut result = ApplyResult {
        requested: requested_map(&recommendation.containers),
        ..Default::default()
    };

    let patch = build_apply_patch(workload, &recommendation.containers);

    match adapter.apply_ssa(workload, &patch).await {
        Ok(()) => {
            info!(workload = %workload.key(), "server_side_apply_succeeded");
            result.applied = true;
        }
        Err(e) => {
            let message = e.to_string();
            if matches!(e, AdapterError::Api(_)) && is_conflict_error(&message) {
                let owners = adapter
                    .managed_field_owners(workload)
                    .await
                    .unwrap_or_default();
                let (manager, gitops) = classify_conflict(&owners);
                warn!(
                    workload = %workload.key(),
                    manager = manager.as_deref().unwrap_or("unknown"),
                    gitops,
                    "server_side_apply_conflict"
                );
                result.conflict_manager = manager;
                result.gitops_conflict = gitops;
            }
            result.error = Some(message);
            return result;
        }
    }

    // Read back the admitted state; failure here is a soft error, the
    // apply itself already landed.
    match adapter.container_resources(workload).await {
        Ok(admitted) => {
            result.admitted = admitted_map(&admitted);
            result.drifts = compute_drift(&recommendation.containers, &admitted);
            if !result.drifts.is_empty() {
                warn!(
                    workload = %workload.key(),
                    drifts = result.drifts.len(),
                    "post_apply_drift_detected"
                );
            }
        }
        Err(e) => {
            warn!(workload = %workload.key(), error = %e, "post_apply_readback_failed");
            result.error = Some(format!("post-apply read-back failed: {e}"));
        }
    }

    result
}

/* ============================= TESTS ============================= */
