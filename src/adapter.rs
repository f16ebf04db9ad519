use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

use crate::workload::{
    parse_cpu_quantity, parse_memory_quantity, ContainerResources, WorkloadKind, WorkloadReference,
};

/// Field manager kubenow owns in server-side apply.
pub const FIELD_MANAGER: &str = "kubenow";

/* ============================= ERRORS ============================= */

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Pod workloads are read-only; patch the owning controller instead")]
    PodNotPatchable,

    #[error("cluster API error: {0}")]
    Api(#[from] kube::Error),

    #[error("workload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/* ============================= ADAPTER ============================= */

/// Kind-dispatched accessors over the cluster API. Pod supports reads
/// only; the other kinds support server-side apply as well.
#[derive(Clone)]
pub struct WorkloadAdapter {
    client: Client,
}

impl WorkloadAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch the workload as a generic JSON object (for audit bundles
    /// and field extraction).
    pub async fn get_as_value(
        &self,
        workload: &WorkloadReference,
    ) -> Result<serde_json::Value, AdapterError> {
        let value = match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                serde_json::to_value(api.get(&workload.name).await?)?
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                serde_json::to_value(api.get(&workload.name).await?)?
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                serde_json::to_value(api.get(&workload.name).await?)?
            }
            WorkloadKind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);
                serde_json::to_value(api.get(&workload.name).await?)?
            }
        };
        Ok(value)
    }

    /// Current container resources, parsed into cores/bytes.
    pub async fn container_resources(
        &self,
        workload: &WorkloadReference,
    ) -> Result<Vec<ContainerResources>, AdapterError> {
        let value = self.get_as_value(workload).await?;
        Ok(extract_container_resources(&value, workload.kind))
    }

    /// Field manager names recorded in the workload's managedFields.
    pub async fn managed_field_owners(
        &self,
        workload: &WorkloadReference,
    ) -> Result<Vec<String>, AdapterError> {
        let value = self.get_as_value(workload).await?;
        Ok(extract_managed_field_owners(&value))
    }

    /// The workload's UID, used to key the per-workload rate counter.
    pub async fn workload_uid(
        &self,
        workload: &WorkloadReference,
    ) -> Result<Option<String>, AdapterError> {
        let value = self.get_as_value(workload).await?;
        Ok(value["metadata"]["uid"].as_str().map(str::to_string))
    }

    /// Submit a server-side apply with kubenow's field manager.
    /// Conflicts surface as errors rather than being forced over.
    pub async fn apply_ssa(
        &self,
        workload: &WorkloadReference,
        patch: &serde_json::Value,
    ) -> Result<(), AdapterError> {
        let params = PatchParams::apply(FIELD_MANAGER);

        match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &Patch::Apply(patch))
                    .await?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &Patch::Apply(patch))
                    .await?;
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &Patch::Apply(patch))
                    .await?;
            }
            WorkloadKind::Pod => return Err(AdapterError::PodNotPatchable),
        }

        Ok(())
    }
}

/* ============================= EXTRACTION ============================= */

/// Pull per-container resources out of a workload object. Templated
/// kinds carry containers under `spec.template.spec`; Pod directly
/// under `spec`.
pub fn extract_container_resources(
    value: &serde_json::Value,
    kind: WorkloadKind,
) -> Vec<ContainerResources> {
    let containers = if kind.is_templated() {
        &value["spec"]["template"]["spec"]["containers"]
    } else {
        &value["spec"]["containers"]
    };

    let Some(containers) = containers.as_array() else {
        return Vec::new();
    };

    containers
        .iter()
        .map(|c| {
            let quantity = |section: &str, resource: &str| -> String {
                c["resources"][section][resource]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            };

            ContainerResources {
                name: c["name"].as_str().unwrap_or_default().to_string(),
                cpu_request: parse_cpu_quantity(&quantity("requests", "cpu")),
                cpu_limit: parse_cpu_quantity(&quantity("limits", "cpu")),
                memory_request: parse_memory_quantity(&quantity("requests", "memory")),
                memory_limit: parse_memory_quantity(&quantity("limits", "memory")),
            }
        })
        .collect()
}

/// Field manager names from `metadata.managedFields`, in list order.
pub fn extract_managed_field_owners(value: &serde_json::Value) -> Vec<String> {
    value["metadata"]["managedFields"]
        .as_array()
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f["manager"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/* ============================= TESTS ============================= */
