use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use kube::{Client, ResourceExt};

use crate::workload::{parse_cpu_quantity, parse_memory_quantity};

/* ============================= TYPES ============================= */

/// One pod's usage totals for a single sample pass, already summed
/// across containers.
#[derive(Debug, Clone, PartialEq)]
pub struct PodUsage {
    pub namespace: String,
    pub pod: String,
    /// Cores.
    pub cpu: f64,
    /// Bytes.
    pub memory: f64,
}

/* ============================= OBSERVER SEAM ============================= */

/// The cluster surface the latch monitor samples through. Production
/// uses [`KubeObserver`]; tests provide scripted implementations.
pub trait ClusterObserver: Send + Sync {
    /// List pods in one namespace, or cluster-wide when `None`.
    fn list_pods(
        &self,
        namespace: Option<&str>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<Pod>>> + Send;

    /// List events in one namespace, or cluster-wide when `None`.
    fn list_events(
        &self,
        namespace: Option<&str>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<Event>>> + Send;

    /// Current per-pod usage totals from the metrics subresource.
    fn pod_usage(
        &self,
        namespace: Option<&str>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<PodUsage>>> + Send;
}

/* ============================= PRODUCTION IMPL ============================= */

/// Observer backed by the live cluster API: typed Pod/Event lists plus
/// `metrics.k8s.io/v1beta1` PodMetrics through a dynamic object.
#[derive(Clone)]
pub struct KubeObserver {
    client: Client,
}

impl KubeObserver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn metrics_api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk(&gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

impl ClusterObserver for KubeObserver {
    async fn list_pods(&self, namespace: Option<&str>) -> anyhow::Result<Vec<Pod>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_events(&self, namespace: Option<&str>) -> anyhow::Result<Vec<Event>> {
        let api: Api<Event> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn pod_usage(&self, namespace: Option<&str>) -> anyhow::Result<Vec<PodUsage>> {
        let list = self
            .metrics_api(namespace)
            .list(&ListParams::default())
            .await?;

        Ok(list
            .items
            .iter()
            .map(|item| {
                let (cpu, memory) = sum_container_usage(&item.data);
                PodUsage {
                    namespace: item.namespace().unwrap_or_default(),
                    pod: item.name_any(),
                    cpu,
                    memory,
                }
            })
            .collect())
    }
}

/// Sum `containers[].usage.{cpu,memory}` from a PodMetrics payload.
pub fn sum_container_usage(data: &serde_json::Value) -> (f64, f64) {
    let Some(containers) = data["containers"].as_array() else {
        return (0.0, 0.0);
    };

    containers.iter().fold((0.0, 0.0), |(cpu, memory), c| {
        let usage = &c["usage"];
        (
            cpu + parse_cpu_quantity(usage["cpu"].as_str().unwrap_or_default()),
            memory + parse_memory_quantity(usage["memory"].as_str().unwrap_or_default()) as f64,
        )
    })
}

/* ============================= TESTS ============================= */
