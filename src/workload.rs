use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/* ============================= ERRORS ============================= */

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("unknown workload kind '{0}' (expected deployment, statefulset, daemonset, or pod)")]
    UnknownKind(String),

    #[error("malformed workload reference '{0}' (expected <kind>/<name>)")]
    MalformedReference(String),
}

/* ============================= KINDS ============================= */

/// The workload kinds kubenow can observe. Pod is observable but
/// structurally unpatchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Pod,
}

impl WorkloadKind {
    /// API group/version the kind lives under.
    pub fn api_version(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "v1",
            _ => "apps/v1",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Pod => "Pod",
        }
    }

    /// True for kinds whose containers live under `spec.template.spec`.
    pub fn is_templated(&self) -> bool {
        !matches!(self, WorkloadKind::Pod)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = WorkloadError;

    /// Canonicalize the kind aliases accepted on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deployment" | "deploy" | "deployments" => Ok(WorkloadKind::Deployment),
            "statefulset" | "sts" | "statefulsets" => Ok(WorkloadKind::StatefulSet),
            "daemonset" | "ds" | "daemonsets" => Ok(WorkloadKind::DaemonSet),
            "pod" | "pods" | "po" => Ok(WorkloadKind::Pod),
            other => Err(WorkloadError::UnknownKind(other.to_string())),
        }
    }
}

/* ============================= REFERENCES ============================= */

/// Identifies a mutation target in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadReference {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
}

impl WorkloadReference {
    pub fn new(kind: WorkloadKind, name: &str, namespace: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Canonical key: "kind/namespace/name".
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.kind.as_str().to_lowercase(),
            self.namespace,
            self.name
        )
    }

    /// File stem used for latch persistence: `<ns>__<Kind>__<name>`.
    pub fn latch_file_stem(&self) -> String {
        format!("{}__{}__{}", self.namespace, self.kind.as_str(), self.name)
    }

    /// Directory stem used for audit bundles: `<ns>__<lower-kind>__<name>`.
    pub fn audit_dir_stem(&self) -> String {
        format!(
            "{}__{}__{}",
            self.namespace,
            self.kind.as_str().to_lowercase(),
            self.name
        )
    }
}

impl fmt::Display for WorkloadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -n {}", self.kind, self.name, self.namespace)
    }
}

/// Parse a `<kind>/<name>` reference string into a WorkloadReference.
pub fn parse_workload_ref(s: &str, namespace: &str) -> Result<WorkloadReference, WorkloadError> {
    let (kind_str, name) = s
        .split_once('/')
        .ok_or_else(|| WorkloadError::MalformedReference(s.to_string()))?;

    if name.is_empty() || kind_str.is_empty() {
        return Err(WorkloadError::MalformedReference(s.to_string()));
    }

    let kind = WorkloadKind::from_str(kind_str)?;
    Ok(WorkloadReference::new(kind, name, namespace))
}

/* ============================= CONTAINER RESOURCES ============================= */

/// Current observed resource values for a single container.
/// Zero means unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainerResources {
    pub name: String,
    /// CPU request in cores.
    pub cpu_request: f64,
    /// CPU limit in cores.
    pub cpu_limit: f64,
    /// Memory request in bytes.
    pub memory_request: u64,
    /// Memory limit in bytes.
    pub memory_limit: u64,
}

/* ============================= QUANTITY PARSING ============================= */

/// Parse a Kubernetes CPU quantity string into cores.
///
/// Accepts plain core values ("1", "0.5") and the n/u/m suffixes the
/// metrics API and pod specs emit ("250m", "12345678n").
pub fn parse_cpu_quantity(q: &str) -> f64 {
    let q = q.trim();
    if q.is_empty() {
        return 0.0;
    }

    let (num, scale) = match q.as_bytes()[q.len() - 1] {
        b'n' => (&q[..q.len() - 1], 1e-9),
        b'u' => (&q[..q.len() - 1], 1e-6),
        b'm' => (&q[..q.len() - 1], 1e-3),
        b'k' => (&q[..q.len() - 1], 1e3),
        _ => (q, 1.0),
    };

    num.parse::<f64>().map(|v| v * scale).unwrap_or(0.0)
}

/// Parse a Kubernetes memory quantity string into bytes.
///
/// Handles the binary suffixes (Ki/Mi/Gi/Ti/Pi/Ei), the decimal ones
/// (k/K/M/G/T/P/E), and plain byte values. Unparseable input yields 0.
pub fn parse_memory_quantity(q: &str) -> u64 {
    let q = q.trim();
    if q.is_empty() {
        return 0;
    }

    const BINARY: &[(&str, u64)] = &[
        ("Ei", 1 << 60),
        ("Pi", 1 << 50),
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];
    const DECIMAL: &[(&str, u64)] = &[
        ("E", 1_000_000_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("K", 1_000),
        ("k", 1_000),
    ];

    for (suffix, mult) in BINARY.iter().chain(DECIMAL.iter()) {
        if let Some(num) = q.strip_suffix(suffix) {
            return num
                .parse::<f64>()
                .map(|v| (v * *mult as f64).round() as u64)
                .unwrap_or(0);
        }
    }

    q.parse::<f64>().map(|v| v.round() as u64).unwrap_or(0)
}

/* ============================= QUANTITY FORMATTING ============================= */

/// Format CPU cores for a patch document.
///
/// Whole cores are emitted as integers ("1"), anything else as millicores
/// ("150m"). Zero or negative values emit "0m".
pub fn format_cpu(cores: f64) -> String {
    let millis = (cores * 1000.0).round() as i64;
    if millis <= 0 {
        return "0m".to_string();
    }
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{millis}m")
    }
}

/// Format memory bytes for a patch document.
///
/// Exact Gi when divisible by 1024³, integer Mi when at least 1 Mi,
/// raw bytes otherwise.
pub fn format_memory(bytes: u64) -> String {
    const GI: u64 = 1 << 30;
    const MI: u64 = 1 << 20;

    if bytes >= GI && bytes % GI == 0 {
        format!("{}Gi", bytes / GI)
    } else if bytes >= MI {
        format!("{}Mi", bytes / MI)
    } else {
        format!("{bytes}")
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── kind parsing ──

    #[test]
    fn test_kind_deployment_aliases() {
        for alias in ["deployment", "deploy", "deployments", "Deployment", "DEPLOY"] {
            assert_eq!(WorkloadKind::from_str(alias).unwrap(), WorkloadKind::Deployment);
        }
    }

    #[test]
    fn test_kind_statefulset_aliases() {
        for alias in ["statefulset", "sts", "statefulsets"] {
            assert_eq!(WorkloadKind::from_str(alias).unwrap(), WorkloadKind::StatefulSet);
        }
    }

    #[test]
    fn test_kind_daemonset_aliases() {
        for alias in ["daemonset", "ds", "daemonsets"] {
            assert_eq!(WorkloadKind::from_str(alias).unwrap(), WorkloadKind::DaemonSet);
        }
    }

    #[test]
    fn test_kind_pod_aliases() {
        for alias in ["pod", "pods", "po"] {
            assert_eq!(WorkloadKind::from_str(alias).unwrap(), WorkloadKind::Pod);
        }
    }

    #[test]
    fn test_kind_unknown_rejected() {
        let err = WorkloadKind::from_str("cronjob").unwrap_err();
        assert!(matches!(err, WorkloadError::UnknownKind(_)));
        assert!(err.to_string().contains("cronjob"));
    }

    #[test]
    fn test_kind_api_version() {
        assert_eq!(WorkloadKind::Deployment.api_version(), "apps/v1");
        assert_eq!(WorkloadKind::Pod.api_version(), "v1");
    }

    #[test]
    fn test_kind_templated() {
        assert!(WorkloadKind::Deployment.is_templated());
        assert!(WorkloadKind::StatefulSet.is_templated());
        assert!(WorkloadKind::DaemonSet.is_templated());
        assert!(!WorkloadKind::Pod.is_templated());
    }

    // ── reference parsing ──

    #[test]
    fn test_parse_ref_basic() {
        let r = parse_workload_ref("deploy/web-app", "prod").unwrap();
        assert_eq!(r.kind, WorkloadKind::Deployment);
        assert_eq!(r.name, "web-app");
        assert_eq!(r.namespace, "prod");
    }

    #[test]
    fn test_parse_ref_missing_slash() {
        assert!(matches!(
            parse_workload_ref("web-app", "prod"),
            Err(WorkloadError::MalformedReference(_))
        ));
    }

    #[test]
    fn test_parse_ref_empty_name() {
        assert!(parse_workload_ref("deploy/", "prod").is_err());
    }

    #[test]
    fn test_parse_ref_unknown_kind() {
        assert!(matches!(
            parse_workload_ref("job/batch", "prod"),
            Err(WorkloadError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_ref_key() {
        let r = WorkloadReference::new(WorkloadKind::StatefulSet, "mysql", "db");
        assert_eq!(r.key(), "statefulset/db/mysql");
    }

    #[test]
    fn test_ref_latch_file_stem() {
        let r = WorkloadReference::new(WorkloadKind::Deployment, "web", "prod");
        assert_eq!(r.latch_file_stem(), "prod__Deployment__web");
    }

    #[test]
    fn test_ref_audit_dir_stem() {
        let r = WorkloadReference::new(WorkloadKind::DaemonSet, "fluent-bit", "logging");
        assert_eq!(r.audit_dir_stem(), "logging__daemonset__fluent-bit");
    }

    // ── cpu quantity parsing ──

    #[test]
    fn test_parse_cpu_plain_cores() {
        assert_eq!(parse_cpu_quantity("1"), 1.0);
        assert_eq!(parse_cpu_quantity("0.5"), 0.5);
    }

    #[test]
    fn test_parse_cpu_millicores() {
        assert_eq!(parse_cpu_quantity("250m"), 0.25);
    }

    #[test]
    fn test_parse_cpu_nanocores() {
        // metrics.k8s.io reports nanocores
        let v = parse_cpu_quantity("1500000000n");
        assert!((v - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_cpu_garbage() {
        assert_eq!(parse_cpu_quantity("abc"), 0.0);
        assert_eq!(parse_cpu_quantity(""), 0.0);
    }

    // ── memory quantity parsing ──

    #[test]
    fn test_parse_memory_binary_suffixes() {
        assert_eq!(parse_memory_quantity("128Mi"), 128 * 1024 * 1024);
        assert_eq!(parse_memory_quantity("2Gi"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_quantity("512Ki"), 512 * 1024);
    }

    #[test]
    fn test_parse_memory_decimal_suffixes() {
        assert_eq!(parse_memory_quantity("1M"), 1_000_000);
        assert_eq!(parse_memory_quantity("2G"), 2_000_000_000);
    }

    #[test]
    fn test_parse_memory_plain_bytes() {
        assert_eq!(parse_memory_quantity("1048576"), 1_048_576);
    }

    #[test]
    fn test_parse_memory_garbage() {
        assert_eq!(parse_memory_quantity("lots"), 0);
    }

    // ── cpu formatting ──

    #[test]
    fn test_format_cpu_whole_cores() {
        assert_eq!(format_cpu(1.0), "1");
        assert_eq!(format_cpu(2.0), "2");
    }

    #[test]
    fn test_format_cpu_millicores() {
        assert_eq!(format_cpu(0.15), "150m");
        assert_eq!(format_cpu(1.5), "1500m");
    }

    #[test]
    fn test_format_cpu_rounds_to_millicores() {
        assert_eq!(format_cpu(0.1004), "100m");
    }

    #[test]
    fn test_format_cpu_zero_and_negative() {
        assert_eq!(format_cpu(0.0), "0m");
        assert_eq!(format_cpu(-0.5), "0m");
    }

    // ── memory formatting ──

    #[test]
    fn test_format_memory_exact_gi() {
        assert_eq!(format_memory(2 * 1024 * 1024 * 1024), "2Gi");
    }

    #[test]
    fn test_format_memory_mi() {
        assert_eq!(format_memory(240 * 1024 * 1024), "240Mi");
    }

    #[test]
    fn test_format_memory_sub_mi_raw_bytes() {
        assert_eq!(format_memory(1023), "1023");
        assert_eq!(format_memory(0), "0");
    }

    #[test]
    fn test_format_roundtrip_consistency() {
        // Drift comparison formats both sides, so parse(format(x)) must be stable.
        let bytes = 170 * 1024 * 1024;
        assert_eq!(parse_memory_quantity(&format_memory(bytes)), bytes);
        let cores = 0.25;
        assert!((parse_cpu_quantity(&format_cpu(cores)) - cores).abs() < 1e-9);
    }
}
