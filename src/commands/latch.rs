use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::info;

use kubenow::latch::{LatchConfig, LatchMonitor, LatchStore};
use kubenow::metrics::KubeObserver;

pub async fn run(
    kubeconfig: Option<&Path>,
    namespaces: Vec<String>,
    workload: Option<String>,
    duration_secs: u64,
    interval_secs: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(interval_secs > 0, "interval must be at least 1 second");
    anyhow::ensure!(
        duration_secs >= interval_secs,
        "duration must be at least one interval"
    );

    println!("Starting latch session...\n");

    print!("  Cluster connection .......... ");
    let (client, _server) = super::make_client(kubeconfig).await?;
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let scope = if namespaces.is_empty() {
        "all namespaces".to_string()
    } else {
        namespaces.join(", ")
    };
    println!("  Scope ....................... {scope}");
    if let Some(w) = &workload {
        println!("  Workload filter ............. {w}");
    }
    println!("  Window ...................... {duration_secs}s at {interval_secs}s intervals");
    println!();
    println!("Latching. Press Ctrl+C to stop early.\n");

    let config = LatchConfig {
        namespaces,
        workload_filter: workload,
        duration: Duration::from_secs(duration_secs),
        interval: Duration::from_secs(interval_secs),
    };

    let monitor = Arc::new(
        LatchMonitor::new(KubeObserver::new(client), config)
            .with_progress(Box::new(|message| println!("  {message}"))),
    );

    let runner = monitor.clone();
    let mut session = tokio::spawn(async move { runner.run().await });

    let outcome = tokio::select! {
        finished = &mut session => finished.context("latch session panicked")??,
        _ = signal::ctrl_c() => {
            println!("\nStop requested; closing the window...");
            monitor.stop();
            session.await.context("latch session panicked")??
        }
    };

    let results = monitor.results(&outcome).await;
    if results.is_empty() {
        println!("\nNo workloads observed during the window.");
        return Ok(());
    }

    let store = LatchStore::open_default()?;

    println!("\n{}", "=".repeat(70));
    println!(
        "Latch closed after {:.0}s ({} workload(s), {} gap(s)){}",
        outcome.elapsed_seconds,
        results.len(),
        outcome.gaps,
        if outcome.stopped_early { " — stopped early" } else { "" }
    );
    println!("{}", "=".repeat(70));

    for result in &results {
        // Saving is best-effort per workload; a bad entry must not lose the rest.
        match store.save(result) {
            Ok(path) => {
                let spike = result.spike.as_ref();
                println!(
                    "  {} — {} samples, max {:.3} cores / {:.0} MiB{} -> {}",
                    result.workload.key(),
                    spike.map(|s| s.sample_count).unwrap_or_default(),
                    spike.map(|s| s.max_cpu).unwrap_or_default(),
                    spike.map(|s| s.max_memory).unwrap_or_default() / (1024.0 * 1024.0),
                    if result.valid { "" } else { " (INVALID)" },
                    path.display()
                );
                if let Some(reason) = &result.invalid_reason {
                    println!("      reason: {reason}");
                }
            }
            Err(e) => {
                info!(workload = %result.workload.key(), error = %e, "latch_save_failed");
                println!(
                    "  {} — save failed: {e:#}",
                    result.workload.key()
                );
            }
        }
    }

    Ok(())
}
