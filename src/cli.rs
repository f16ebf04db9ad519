use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kubenow")]
#[command(about = "Safety-gated resource recommendations for Kubernetes workloads")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Kubeconfig file (defaults to the standard lookup)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check cluster connectivity and permissions
    Check,

    /// Latch onto running workloads for a bounded window and persist the evidence
    Latch {
        /// Namespace to monitor (repeatable; omit for all namespaces)
        #[arg(long = "namespace", short = 'n')]
        namespaces: Vec<String>,

        /// Restrict sampling to one workload name
        #[arg(long)]
        workload: Option<String>,

        /// Window length in seconds
        #[arg(long, default_value_t = 900)]
        duration: u64,

        /// Sampling interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },

    /// Compute a recommendation from persisted latch evidence
    Recommend {
        /// Target workload as <kind>/<name>
        workload: String,

        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,

        /// Policy bounds file (YAML or JSON)
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Historical metrics backing is available
        #[arg(long)]
        prometheus: bool,
    },

    /// Apply a recommendation through the gated server-side-apply pipeline
    Apply {
        /// Target workload as <kind>/<name>
        workload: String,

        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,

        /// Policy bounds file (YAML or JSON); defaults apply when omitted
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Directory for audit bundles and rate-limit state
        /// (default: ~/.kubenow/audit)
        #[arg(long)]
        audit_path: Option<PathBuf>,

        /// Acknowledge a detected HorizontalPodAutoscaler
        #[arg(long)]
        ack_hpa: bool,

        /// Historical metrics backing is available
        #[arg(long)]
        prometheus: bool,

        /// Max applies per cluster per window (0 = unlimited)
        #[arg(long, default_value_t = 10)]
        max_applies: u32,

        /// Max applies per workload per window (0 = unlimited)
        #[arg(long, default_value_t = 3)]
        max_workload_applies: u32,

        /// Rate-limit window in seconds
        #[arg(long, default_value_t = 3600)]
        rate_window: u64,
    },

    /// Export a recommendation artifact
    Export {
        /// Target workload as <kind>/<name>
        workload: String,

        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,

        /// Artifact format: patch, manifest, diff, or json
        #[arg(long, default_value = "patch")]
        format: String,

        /// Policy bounds file (YAML or JSON)
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Historical metrics backing is available
        #[arg(long)]
        prometheus: bool,
    },
}
