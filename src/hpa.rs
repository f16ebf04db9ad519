use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::api::Api;
use kube::Client;

use crate::recommend::HpaInfo;
use crate::workload::WorkloadReference;

/* ============================= DETECTION ============================= */

/// True when the HPA's scale target matches the workload.
pub fn hpa_targets(hpa: &HorizontalPodAutoscaler, workload: &WorkloadReference) -> bool {
    let Some(spec) = &hpa.spec else {
        return false;
    };
    spec.scale_target_ref.kind == workload.kind.as_str()
        && spec.scale_target_ref.name == workload.name
}

fn info_from(hpa: &HorizontalPodAutoscaler) -> Option<HpaInfo> {
    let spec = hpa.spec.as_ref()?;
    Some(HpaInfo {
        name: hpa.metadata.name.clone().unwrap_or_default(),
        min_replicas: spec.min_replicas,
        max_replicas: spec.max_replicas,
    })
}

/// Find a HorizontalPodAutoscaler targeting the workload, if any.
///
/// Lists autoscaling/v2 HPAs in the workload's namespace and matches on
/// the scale target reference.
pub async fn detect_hpa(
    client: &Client,
    workload: &WorkloadReference,
) -> anyhow::Result<Option<HpaInfo>> {
    let api: Api<HorizontalPodAutoscaler> =
        Api::namespaced(client.clone(), &workload.namespace);
    let list = api.list(&Default::default()).await?;

    Ok(list
        .items
        .iter()
        .find(|hpa| hpa_targets(hpa, workload))
        .and_then(info_from))
}

/* ============================= TESTS ============================= */
