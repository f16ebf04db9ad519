use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::identity::Identity;
use crate::recommend::{AlignmentRecommendation, Confidence, Evidence, SafetyRating};
use crate::workload::{format_cpu, format_memory, WorkloadReference};

/* ============================= VOLATILE FIELDS ============================= */

const VOLATILE_METADATA_FIELDS: &[&str] = &[
    "resourceVersion",
    "generation",
    "managedFields",
    "uid",
    "creationTimestamp",
];

/// Strip server-maintained metadata and the whole status subtree so the
/// object can be compared and diffed across reads.
pub fn strip_volatile_fields(obj: &mut serde_json::Value) {
    if let Some(map) = obj.as_object_mut() {
        map.remove("status");
        if let Some(metadata) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in VOLATILE_METADATA_FIELDS {
                metadata.remove(*field);
            }
        }
    }
}

/* ============================= DIFF ============================= */

/// POSIX unified diff with 3 lines of context, labeled
/// `before.yaml` / `after.yaml`.
pub fn unified_diff(before: &str, after: &str) -> String {
    similar::TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header("before.yaml", "after.yaml")
        .to_string()
}

/* ============================= DECISION RECORD ============================= */

pub const DECISION_VERSION: u32 = 1;

/// Terminal status of an audit bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleStatus {
    #[serde(rename = "applied")]
    Applied,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "denied")]
    Denied,
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleStatus::Applied => "applied",
            BundleStatus::Failed => "failed",
            BundleStatus::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// One per-field change recorded in the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionChange {
    pub container: String,
    pub field: String,
    pub before: String,
    pub after: String,
    pub delta_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecommendation {
    pub safety: SafetyRating,
    pub confidence: Confidence,
    pub evidence: Option<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DecisionLatch {
    pub duration_seconds: f64,
    pub sample_count: u64,
    pub sample_interval_seconds: u64,
}

/// The `decision.json` payload: created with status `pending`, rewritten
/// to a terminal status by `finalize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub workload: WorkloadReference,
    pub cluster_server: String,
    pub identity: Identity,
    pub recommendation: DecisionRecommendation,
    pub latch: DecisionLatch,
    pub guardrails_passed: bool,
    pub changes: Vec<DecisionChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Flatten a recommendation's containers into per-field change rows.
pub fn changes_from(rec: &AlignmentRecommendation) -> Vec<DecisionChange> {
    let mut changes = Vec::new();
    for c in &rec.containers {
        changes.push(DecisionChange {
            container: c.current.name.clone(),
            field: "cpu_request".to_string(),
            before: format_cpu(c.current.cpu_request),
            after: format_cpu(c.recommended.cpu_request),
            delta_percent: c.delta.cpu_request,
        });
        changes.push(DecisionChange {
            container: c.current.name.clone(),
            field: "cpu_limit".to_string(),
            before: format_cpu(c.current.cpu_limit),
            after: format_cpu(c.recommended.cpu_limit),
            delta_percent: c.delta.cpu_limit,
        });
        changes.push(DecisionChange {
            container: c.current.name.clone(),
            field: "memory_request".to_string(),
            before: format_memory(c.current.memory_request),
            after: format_memory(c.recommended.memory_request),
            delta_percent: c.delta.memory_request,
        });
        changes.push(DecisionChange {
            container: c.current.name.clone(),
            field: "memory_limit".to_string(),
            before: format_memory(c.current.memory_limit),
            after: format_memory(c.recommended.memory_limit),
            delta_percent: c.delta.memory_limit,
        });
    }
    changes
}

/* ============================= BUNDLE ============================= */

/// A per-apply audit directory:
/// `<UTC timestamp>__<namespace>__<lower-kind>__<name>` holding
/// `before.yaml`, `after.yaml`, `diff.patch`, and `decision.json`.
pub struct AuditBundle {
    dir: PathBuf,
}

impl AuditBundle {
    /// Create the bundle immediately before the apply attempt.
    ///
    /// Writes `before.yaml` (volatile fields stripped) and a pending
    /// `decision.json`. Any failure here must abort the apply.
    pub fn create(
        audit_path: &Path,
        workload: &WorkloadReference,
        before: &serde_json::Value,
        recommendation: &AlignmentRecommendation,
        identity: &Identity,
        cluster_server: &str,
        guardrails_passed: bool,
    ) -> anyhow::Result<Self> {
        let now = Utc::now();
        let dir = audit_path.join(format!(
            "{}__{}",
            now.format("%Y%m%dT%H%M%SZ"),
            workload.audit_dir_stem()
        ));

        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create audit bundle {}", dir.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        }

        // JSON round-trip deep copy, then strip volatile fields
        let mut stripped = before.clone();
        strip_volatile_fields(&mut stripped);

        let before_yaml = serde_yaml::to_string(&stripped).context("failed to render before.yaml")?;
        write_file(&dir.join("before.yaml"), &before_yaml)?;

        let record = DecisionRecord {
            version: DECISION_VERSION,
            timestamp: now,
            status: "pending".to_string(),
            workload: workload.clone(),
            cluster_server: cluster_server.to_string(),
            identity: identity.clone(),
            recommendation: DecisionRecommendation {
                safety: recommendation.safety,
                confidence: recommendation.confidence,
                evidence: recommendation.evidence.clone(),
            },
            latch: recommendation
                .evidence
                .as_ref()
                .map(|e| DecisionLatch {
                    duration_seconds: e.duration_seconds,
                    sample_count: e.sample_count,
                    sample_interval_seconds: e.interval_seconds,
                })
                .unwrap_or_default(),
            guardrails_passed,
            changes: changes_from(recommendation),
            applied_at: None,
            error: None,
        };

        let decision =
            serde_json::to_string_pretty(&record).context("failed to render decision.json")?;
        write_file(&dir.join("decision.json"), &decision)?;

        info!(bundle = %dir.display(), "audit_bundle_created");
        Ok(Self { dir })
    }

    /// Finalize after the apply returned, whatever the outcome.
    ///
    /// Writes `after.yaml`, generates `diff.patch` from the two files on
    /// disk, and rewrites `decision.json` with the terminal status.
    pub fn finalize(
        &self,
        after: &serde_json::Value,
        status: BundleStatus,
        applied_at: DateTime<Utc>,
        apply_err: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut stripped = after.clone();
        strip_volatile_fields(&mut stripped);

        let after_yaml = serde_yaml::to_string(&stripped).context("failed to render after.yaml")?;
        write_file(&self.dir.join("after.yaml"), &after_yaml)?;

        // The diff is generated from the files, never from in-memory state.
        let before_s = fs::read_to_string(self.dir.join("before.yaml"))
            .context("failed to read back before.yaml")?;
        let after_s = fs::read_to_string(self.dir.join("after.yaml"))
            .context("failed to read back after.yaml")?;
        write_file(&self.dir.join("diff.patch"), &unified_diff(&before_s, &after_s))?;

        let decision_path = self.dir.join("decision.json");
        let raw = fs::read_to_string(&decision_path).context("failed to read decision.json")?;
        let mut record: DecisionRecord =
            serde_json::from_str(&raw).context("failed to parse decision.json")?;

        record.status = status.to_string();
        record.applied_at = Some(applied_at);
        record.error = apply_err.map(str::to_string);

        let decision =
            serde_json::to_string_pretty(&record).context("failed to render decision.json")?;
        write_file(&decision_path, &decision)?;

        info!(bundle = %self.dir.display(), status = %status, "audit_bundle_finalized");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

/// Finalize a bundle, downgrading any failure to a warning. The apply
/// already happened; a broken bundle must not fail the operation.
pub fn finalize_best_effort(
    bundle: &AuditBundle,
    after: &serde_json::Value,
    status: BundleStatus,
    applied_at: DateTime<Utc>,
    apply_err: Option<&str>,
) -> Option<String> {
    match bundle.finalize(after, status, applied_at, apply_err) {
        Ok(()) => None,
        Err(e) => {
            warn!(bundle = %bundle.path().display(), error = %e, "audit_finalize_failed");
            Some(format!("audit bundle finalize failed: {e:#}"))
        }
    }
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    }

    Ok(())
}

/* ============================= TESTS ============================= */
