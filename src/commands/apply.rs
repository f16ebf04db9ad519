use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use kubenow::adapter::WorkloadAdapter;
use kubenow::apply;
use kubenow::audit::{finalize_best_effort, AuditBundle, BundleStatus};
use kubenow::gate::{check_actionable, ApplyInput, ExecutionMode};
use kubenow::hpa::detect_hpa;
use kubenow::identity;
use kubenow::latch::LatchStore;
use kubenow::policy::PolicyBounds;
use kubenow::ratelimit::{RateLimitConfig, RateLimiter};
use kubenow::recommend::recommend;
use kubenow::workload::parse_workload_ref;

pub struct ApplyArgs {
    pub kubeconfig: Option<PathBuf>,
    pub workload: String,
    pub namespace: String,
    pub policy: Option<PathBuf>,
    pub audit_path: Option<PathBuf>,
    pub ack_hpa: bool,
    pub prometheus: bool,
    pub max_applies: u32,
    pub max_workload_applies: u32,
    pub rate_window: u64,
}

pub async fn run(args: ApplyArgs) -> anyhow::Result<()> {
    let workload = parse_workload_ref(&args.workload, &args.namespace)?;
    let kubeconfig = args.kubeconfig.as_deref();

    println!("Preparing apply for {}...\n", workload);

    print!("  Cluster connection .......... ");
    let (client, server) = super::make_client(kubeconfig).await?;
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let adapter = WorkloadAdapter::new(client.clone());

    // ── Identity ──
    print!("  Identity .................... ");
    let identity = identity::resolve(Some(&client), kubeconfig).await;
    if identity.is_recorded() {
        println!("OK ({})", identity.user_label());
    } else {
        println!("UNKNOWN");
    }

    // ── Before-object and inputs ──
    let before = adapter
        .get_as_value(&workload)
        .await
        .with_context(|| format!("failed to read {}", workload.key()))?;
    let uid = before["metadata"]["uid"].as_str().map(str::to_string);

    let latch = LatchStore::open_default()?
        .load(&workload)
        .context("run `kubenow latch` against this workload first")?;

    let containers = kubenow::adapter::extract_container_resources(&before, workload.kind);

    let hpa = match detect_hpa(&client, &workload).await {
        Ok(hpa) => hpa,
        Err(e) => {
            warn!(workload = %workload.key(), error = %e, "hpa_detection_failed");
            None
        }
    };

    let bounds = match args.policy.as_deref() {
        Some(path) => PolicyBounds::load(path)?,
        None => PolicyBounds::default(),
    };

    let rec = recommend(
        &workload,
        Some(&latch),
        &containers,
        Some(&bounds),
        hpa.as_ref(),
        args.prometheus,
    );
    super::recommend::print_recommendation(&rec);
    println!();

    // ── Audit path and rate limiter ──
    let audit_path = match args.audit_path {
        Some(path) => path,
        None => default_audit_path()?,
    };
    let audit_writable = is_writable_dir(&audit_path);

    let limiter = RateLimiter::new(&audit_path);
    let rate_config = RateLimitConfig {
        max_global: args.max_applies,
        max_per_workload: args.max_workload_applies,
        window: Duration::from_secs(args.rate_window),
    };

    // Peek first so an exhausted counter never consumes an entry; only
    // a passing peek pays into the window.
    let verdict = {
        let peek = limiter.peek(&rate_config, uid.as_deref());
        if peek.allowed {
            limiter.check_and_increment(
                &rate_config,
                uid.as_deref(),
                &workload,
                identity.user_label(),
            )?
        } else {
            peek
        }
    };

    // ── Gate ──
    let input = ApplyInput {
        mode: ExecutionMode::ApplyReady,
        recommendation: Some(&rec),
        policy: Some(&bounds),
        hpa_acknowledged: args.ack_hpa,
        latch_timestamp: Some(latch.timestamp),
        latch_duration_seconds: Some(latch.duration_seconds),
        audit_path_writable: audit_writable,
        identity: &identity,
        rate_limit: &verdict,
        workload_kind: workload.kind,
        now: Utc::now(),
    };
    let denials = check_actionable(&input);

    // The bundle is created before anything touches the cluster; a
    // failure here aborts the apply.
    let bundle = AuditBundle::create(
        &audit_path,
        &workload,
        &before,
        &rec,
        &identity,
        &server,
        denials.is_empty(),
    )
    .context("audit bundle creation failed; aborting apply")?;
    println!("  Audit bundle ................ {}", bundle.path().display());

    if !denials.is_empty() {
        println!("\nApply denied:");
        for denial in &denials {
            println!("  - {denial}");
        }
        if let Some(note) = finalize_best_effort(
            &bundle,
            &before,
            BundleStatus::Denied,
            Utc::now(),
            Some(&denials.join("; ")),
        ) {
            println!("  note: {note}");
        }
        anyhow::bail!("apply denied: {}", denials[0]);
    }

    // ── Server-side apply + read-back ──
    let result = apply::execute(&adapter, &workload, &rec).await;

    let after = match adapter.get_as_value(&workload).await {
        Ok(after) => after,
        Err(e) => {
            warn!(workload = %workload.key(), error = %e, "after_object_fetch_failed");
            before.clone()
        }
    };

    let status = if result.applied {
        BundleStatus::Applied
    } else {
        BundleStatus::Failed
    };
    if let Some(note) = finalize_best_effort(
        &bundle,
        &after,
        status,
        Utc::now(),
        result.error.as_deref(),
    ) {
        println!("  note: {note}");
    }

    // ── Exit contract ──
    if !result.applied {
        if let Some(manager) = &result.conflict_manager {
            println!("\nConflict: field manager '{manager}' owns the patched fields.");
            if result.gitops_conflict {
                println!(
                    "This is a GitOps controller; change the resources in its source repository \
                     instead of patching the cluster directly."
                );
            }
        }
        anyhow::bail!(
            "apply failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    if result.drifts.is_empty() {
        println!("\nApply succeeded; admitted state matches the request.");
    } else {
        println!("\nApply succeeded with drift:");
        for drift in &result.drifts {
            println!(
                "  - {}/{}: requested {} admitted {}",
                drift.container, drift.field, drift.requested, drift.admitted
            );
        }
    }

    if let Some(error) = &result.error {
        println!("  note: {error}");
    }

    info!(workload = %workload.key(), drifts = result.drifts.len(), "apply_completed");
    Ok(())
}

fn default_audit_path() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".kubenow").join("audit"))
}

/// Probe writability the way the gate reports it: the directory must be
/// creatable and accept a file write.
fn is_writable_dir(path: &Path) -> bool {
    if std::fs::create_dir_all(path).is_err() {
        return false;
    }
    let probe = path.join(".writable-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
