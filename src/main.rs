mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kubenow=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let kubeconfig = cli.kubeconfig.clone();

    match cli.command {
        Commands::Check => commands::check::run(kubeconfig.as_deref()).await?,
        Commands::Latch {
            namespaces,
            workload,
            duration,
            interval,
        } => {
            commands::latch::run(kubeconfig.as_deref(), namespaces, workload, duration, interval)
                .await?;
        }
        Commands::Recommend {
            workload,
            namespace,
            policy,
            prometheus,
        } => {
            commands::recommend::run(
                kubeconfig.as_deref(),
                &workload,
                &namespace,
                policy.as_deref(),
                prometheus,
            )
            .await?;
        }
        Commands::Apply {
            workload,
            namespace,
            policy,
            audit_path,
            ack_hpa,
            prometheus,
            max_applies,
            max_workload_applies,
            rate_window,
        } => {
            commands::apply::run(commands::apply::ApplyArgs {
                kubeconfig: kubeconfig.clone(),
                workload,
                namespace,
                policy,
                audit_path,
                ack_hpa,
                prometheus,
                max_applies,
                max_workload_applies,
                rate_window,
            })
            .await?;
        }
        Commands::Export {
            workload,
            namespace,
            format,
            policy,
            prometheus,
        } => {
            commands::export::run(
                kubeconfig.as_deref(),
                &workload,
                &namespace,
                &format,
                policy.as_deref(),
                prometheus,
            )
            .await?;
        }
    }

    Ok(())
}
