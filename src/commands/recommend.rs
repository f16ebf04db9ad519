use std::path::Path;

use anyhow::Context;
use tracing::warn;

use kubenow::adapter::WorkloadAdapter;
use kubenow::hpa::detect_hpa;
use kubenow::latch::LatchStore;
use kubenow::policy::PolicyBounds;
use kubenow::recommend::{recommend, AlignmentRecommendation};
use kubenow::workload::{format_cpu, format_memory, parse_workload_ref};

pub async fn run(
    kubeconfig: Option<&Path>,
    workload: &str,
    namespace: &str,
    policy_path: Option<&Path>,
    has_prometheus: bool,
) -> anyhow::Result<()> {
    let workload = parse_workload_ref(workload, namespace)?;

    let (client, _server) = super::make_client(kubeconfig).await?;
    let adapter = WorkloadAdapter::new(client.clone());

    let latch = LatchStore::open_default()?
        .load(&workload)
        .context("run `kubenow latch` against this workload first")?;

    let containers = adapter
        .container_resources(&workload)
        .await
        .with_context(|| format!("failed to read {}", workload.key()))?;

    // HPA detection is advisory; a lookup failure must not block the
    // recommendation.
    let hpa = match detect_hpa(&client, &workload).await {
        Ok(hpa) => hpa,
        Err(e) => {
            warn!(workload = %workload.key(), error = %e, "hpa_detection_failed");
            None
        }
    };

    let bounds = policy_path.map(PolicyBounds::load).transpose()?;

    let rec = recommend(
        &workload,
        Some(&latch),
        &containers,
        bounds.as_ref(),
        hpa.as_ref(),
        has_prometheus,
    );

    print_recommendation(&rec);
    Ok(())
}

/// Human-readable recommendation summary shared by `recommend` and `apply`.
pub(crate) fn print_recommendation(rec: &AlignmentRecommendation) {
    println!("Recommendation for {}\n", rec.workload);
    println!("  Safety ...................... {}", rec.safety);
    println!("  Confidence .................. {}", rec.confidence);

    if let Some(e) = &rec.evidence {
        println!(
            "  Evidence .................... {} samples over {:.0}s (OOM {}, restarts {}, evictions {})",
            e.sample_count, e.duration_seconds, e.oom_kills, e.restarts, e.evictions
        );
    }

    for c in &rec.containers {
        println!("\n  container '{}':", c.current.name);
        let row = |field: &str, before: String, after: String, delta: f64| {
            println!("    {field:<16} {before:>8} -> {after:<8} ({delta:+.1}%)");
        };
        row(
            "cpu_request",
            format_cpu(c.current.cpu_request),
            format_cpu(c.recommended.cpu_request),
            c.delta.cpu_request,
        );
        row(
            "cpu_limit",
            format_cpu(c.current.cpu_limit),
            format_cpu(c.recommended.cpu_limit),
            c.delta.cpu_limit,
        );
        row(
            "memory_request",
            format_memory(c.current.memory_request),
            format_memory(c.recommended.memory_request),
            c.delta.memory_request,
        );
        row(
            "memory_limit",
            format_memory(c.current.memory_limit),
            format_memory(c.recommended.memory_limit),
            c.delta.memory_limit,
        );
        if c.capped {
            println!("    capped fields: {}", c.capped_fields.join(", "));
        }
    }

    if rec.containers.is_empty() {
        println!("\n  No container changes produced.");
    }

    if !rec.warnings.is_empty() {
        println!();
        for warning in &rec.warnings {
            println!("  WARNING: {warning}");
        }
    }
}
