pub mod apply;
pub mod check;
pub mod export;
pub mod latch;
pub mod recommend;

use std::path::Path;

/// Build a kube client plus the cluster server URL it points at.
pub(crate) async fn make_client(
    kubeconfig: Option<&Path>,
) -> anyhow::Result<(kube::Client, String)> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
                .await?
        }
        None => kube::Config::infer().await?,
    };

    let server = config.cluster_url.to_string();
    Ok((kube::Client::try_from(config)?, server))
}
