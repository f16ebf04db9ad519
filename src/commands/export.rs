use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use tracing::warn;

use kubenow::adapter::WorkloadAdapter;
use kubenow::export::{render, ExportFormat};
use kubenow::hpa::detect_hpa;
use kubenow::latch::LatchStore;
use kubenow::policy::PolicyBounds;
use kubenow::recommend::recommend;
use kubenow::workload::parse_workload_ref;

pub async fn run(
    kubeconfig: Option<&Path>,
    workload: &str,
    namespace: &str,
    format: &str,
    policy_path: Option<&Path>,
    has_prometheus: bool,
) -> anyhow::Result<()> {
    let format = ExportFormat::from_str(format)?;
    let workload = parse_workload_ref(workload, namespace)?;

    let (client, _server) = super::make_client(kubeconfig).await?;
    let adapter = WorkloadAdapter::new(client.clone());

    let latch = LatchStore::open_default()?
        .load(&workload)
        .context("run `kubenow latch` against this workload first")?;

    let current = adapter
        .get_as_value(&workload)
        .await
        .with_context(|| format!("failed to read {}", workload.key()))?;
    let containers = kubenow::adapter::extract_container_resources(&current, workload.kind);

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

    let raw = serde_json::to_vec(&current)?;
    let artifact = render(format, &rec, Some(&raw))?;
    println!("{artifact}");

    Ok(())
}
