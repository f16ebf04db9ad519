use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use std::path::Path;

use kubenow::identity;

pub async fn run(kubeconfig: Option<&Path>) -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let (client, server) = match super::make_client(kubeconfig).await {
        Ok(pair) => {
            println!("OK");
            pair
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    // 3. List pods permission
    print!("  List pods permission ........ ");
    let pods: Api<Pod> = Api::all(client.clone());
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. Acting identity resolution
    print!("  Identity .................... ");
    let id = identity::resolve(Some(&client), kubeconfig).await;
    if id.is_recorded() {
        println!("OK ({} via {:?})", id.user_label(), id.source);
    } else {
        println!("FAIL (identity unknown; applies will be denied)");
    }

    println!("\n  Cluster: {server}");
    println!("\nAll checks completed.");
    Ok(())
}
