use anyhow::Context;
use std::fmt;
use std::str::FromStr;

use crate::apply::build_apply_patch;
use crate::audit::strip_volatile_fields;
use crate::recommend::AlignmentRecommendation;
use crate::workload::{format_cpu, format_memory};

/* ============================= FORMATS ============================= */

/// Artifact kinds the formatter can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Patch,
    Manifest,
    Diff,
    Json,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportFormat::Patch => "patch",
            ExportFormat::Manifest => "manifest",
            ExportFormat::Diff => "diff",
            ExportFormat::Json => "json",
        };
        f.write_str(s)
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "patch" => Ok(ExportFormat::Patch),
            "manifest" => Ok(ExportFormat::Manifest),
            "diff" => Ok(ExportFormat::Diff),
            "json" => Ok(ExportFormat::Json),
            other => anyhow::bail!("unknown export format '{other}' (patch, manifest, diff, json)"),
        }
    }
}

/* ============================= RENDERING ============================= */

/// Render a recommendation into the requested artifact. `manifest`
/// needs the current object as JSON bytes; the other formats ignore it.
pub fn render(
    format: ExportFormat,
    recommendation: &AlignmentRecommendation,
    current_object: Option<&[u8]>,
) -> anyhow::Result<String> {
    match format {
        ExportFormat::Patch => render_patch(recommendation),
        ExportFormat::Manifest => {
            let raw = current_object
                .context("manifest export needs the current object (fetch it first)")?;
            render_manifest(recommendation, raw)
        }
        ExportFormat::Diff => Ok(render_diff(recommendation)),
        ExportFormat::Json => {
            serde_json::to_string_pretty(recommendation).context("failed to serialize recommendation")
        }
    }
}

/// Evidence comment block prefixed to YAML artifacts.
fn evidence_comments(rec: &AlignmentRecommendation) -> String {
    let mut lines = vec![
        "# kubenow resource alignment".to_string(),
        format!("# generated: {}", rec.timestamp.to_rfc3339()),
        format!("# workload: {}", rec.workload),
        format!("# safety: {}  confidence: {}", rec.safety, rec.confidence),
    ];

    if let Some(e) = &rec.evidence {
        lines.push(format!(
            "# latch: {} samples over {:.0}s at {}s interval ({} OOM kills, {} restarts, {} evictions)",
            e.sample_count,
            e.duration_seconds,
            e.interval_seconds,
            e.oom_kills,
            e.restarts,
            e.evictions
        ));
    }

    if rec.policy.hpa_detected {
        lines.push(format!(
            "# warning: HorizontalPodAutoscaler '{}' targets this workload",
            rec.policy.hpa_name.as_deref().unwrap_or("unnamed")
        ));
    }

    lines.push(
        "# apply with: kubectl apply --server-side --field-manager=kubenow -f <file>".to_string(),
    );
    lines.join("\n")
}

fn render_patch(rec: &AlignmentRecommendation) -> anyhow::Result<String> {
    let patch = build_apply_patch(&rec.workload, &rec.containers);
    let yaml = serde_yaml::to_string(&patch).context("failed to render patch YAML")?;
    Ok(format!("{}\n{yaml}", evidence_comments(rec)))
}

fn render_manifest(rec: &AlignmentRecommendation, raw: &[u8]) -> anyhow::Result<String> {
    let mut object: serde_json::Value =
        serde_json::from_slice(raw).context("current object is not valid JSON")?;
    strip_volatile_fields(&mut object);

    let containers = if rec.workload.kind.is_templated() {
        &mut object["spec"]["template"]["spec"]["containers"]
    } else {
        &mut object["spec"]["containers"]
    };

    if let Some(containers) = containers.as_array_mut() {
        for alignment in &rec.containers {
            let Some(target) = containers
                .iter_mut()
                .find(|c| c["name"].as_str() == Some(alignment.recommended.name.as_str()))
            else {
                continue;
            };
            target["resources"] = serde_json::json!({
                "requests": {
                    "cpu": format_cpu(alignment.recommended.cpu_request),
                    "memory": format_memory(alignment.recommended.memory_request),
                },
                "limits": {
                    "cpu": format_cpu(alignment.recommended.cpu_limit),
                    "memory": format_memory(alignment.recommended.memory_limit),
                },
            });
        }
    }

    let yaml = serde_yaml::to_string(&object).context("failed to render manifest YAML")?;
    Ok(format!("{}\n{yaml}", evidence_comments(rec)))
}

/// Per-container field diff: changed values get `-`/`+` pairs.
fn render_diff(rec: &AlignmentRecommendation) -> String {
    let mut out = String::new();

    for c in &rec.containers {
        out.push_str(&format!("container '{}':\n", c.current.name));

        let fields = [
            (
                "cpu_request",
                format_cpu(c.current.cpu_request),
                format_cpu(c.recommended.cpu_request),
            ),
            (
                "cpu_limit",
                format_cpu(c.current.cpu_limit),
                format_cpu(c.recommended.cpu_limit),
            ),
            (
                "memory_request",
                format_memory(c.current.memory_request),
                format_memory(c.recommended.memory_request),
            ),
            (
                "memory_limit",
                format_memory(c.current.memory_limit),
                format_memory(c.recommended.memory_limit),
            ),
        ];

        for (name, before, after) in fields {
            if before == after {
                out.push_str(&format!("    {name}: {before}\n"));
            } else {
                out.push_str(&format!("  - {name}: {before}\n"));
                out.push_str(&format!("  + {name}: {after}\n"));
            }
        }
    }

    if rec.containers.is_empty() {
        out.push_str("no container changes\n");
    }

    out
}

/* ============================= TESTS ============================= */
