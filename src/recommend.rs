use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::latch::LatchResult;
use crate::policy::PolicyBounds;
use crate::spike::SpikeData;
use crate::workload::{ContainerResources, WorkloadReference};

/* ============================= RATINGS ============================= */

/// Four-level ordinal workload-health classification. Ordering matters:
/// `Safe < Caution < Risky < Unsafe`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum SafetyRating {
    #[serde(rename = "SAFE")]
    Safe,
    #[serde(rename = "CAUTION")]
    #[default]
    Caution,
    #[serde(rename = "RISKY")]
    Risky,
    #[serde(rename = "UNSAFE")]
    Unsafe,
}

impl fmt::Display for SafetyRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyRating::Safe => "SAFE",
            SafetyRating::Caution => "CAUTION",
            SafetyRating::Risky => "RISKY",
            SafetyRating::Unsafe => "UNSAFE",
        };
        f.write_str(s)
    }
}

/// Confidence in a recommendation, driven by window length and evidence depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LOW")]
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
        };
        f.write_str(s)
    }
}

/* ============================= RESULT TYPES ============================= */

/// Percent change per resource field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceDelta {
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub memory_request: f64,
    pub memory_limit: f64,
}

/// Recommendation for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerAlignment {
    pub current: ContainerResources,
    pub recommended: ContainerResources,
    pub delta: ResourceDelta,
    pub capped: bool,
    pub capped_fields: Vec<String>,
}

/// Latch evidence summarized into the recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Evidence {
    pub namespace: String,
    pub workload_name: String,
    pub pod_name: String,
    pub operator_type: Option<String>,
    pub duration_seconds: f64,
    pub interval_seconds: u64,
    pub sample_count: u64,
    pub oom_kills: u32,
    pub restarts: u32,
    pub evictions: u32,
    pub throttling_detected: bool,
    pub spike_count: u64,
    pub max_cpu: f64,
    pub max_memory: f64,
    pub critical_events: Vec<String>,
}

/// Detected HorizontalPodAutoscaler targeting the workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpaInfo {
    pub name: String,
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
}

/// Policy outcome attached to a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub apply_allowed: bool,
    pub export_allowed: bool,
    pub hpa_detected: bool,
    pub hpa_name: Option<String>,
    pub denial_reasons: Vec<String>,
}

impl Default for PolicyResult {
    fn default() -> Self {
        Self {
            apply_allowed: true,
            export_allowed: true,
            hpa_detected: false,
            hpa_name: None,
            denial_reasons: Vec::new(),
        }
    }
}

/// The engine's output: per-container alignments plus classification,
/// evidence, warnings, and the policy verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentRecommendation {
    pub workload: WorkloadReference,
    pub timestamp: DateTime<Utc>,
    pub safety: SafetyRating,
    pub confidence: Confidence,
    pub containers: Vec<ContainerAlignment>,
    pub evidence: Option<Evidence>,
    pub warnings: Vec<String>,
    pub policy: PolicyResult,
}

/* ============================= NAMESPACE PROTECTION ============================= */

/// A protected namespace never receives a mutation: the control plane
/// (`kube-*`), anything following the `*-system` add-on convention, and
/// the usual homes of reconciliation and telemetry stacks. Returns the
/// denial reason to record on the policy result.
pub fn namespace_denial(namespace: &str) -> Option<String> {
    let protected = namespace.starts_with("kube-")
        || namespace.ends_with("-system")
        || matches!(
            namespace,
            "argocd" | "cert-manager" | "monitoring" | "observability"
        );

    protected.then(|| format!("namespace '{namespace}' is protected from mutation"))
}

/* ============================= CLASSIFICATION ============================= */

/// Classify workload health from harvested distress signals.
/// First matching rung wins; missing evidence defaults to CAUTION.
pub fn classify_safety(spike: Option<&SpikeData>) -> SafetyRating {
    let Some(s) = spike else {
        return SafetyRating::Caution;
    };

    if s.oom_kills >= 5 || s.restarts >= 20 {
        SafetyRating::Unsafe
    } else if s.oom_kills >= 3 || s.restarts > 5 || s.evictions > 0 {
        SafetyRating::Risky
    } else if s.oom_kills >= 1 || s.restarts >= 1 || s.throttling_detected {
        SafetyRating::Caution
    } else {
        SafetyRating::Safe
    }
}

/// Multiplier applied to p95/p99 when sizing requests and limits.
pub fn safety_margin(rating: SafetyRating) -> f64 {
    match rating {
        SafetyRating::Safe => 1.0,
        SafetyRating::Caution => 1.3,
        SafetyRating::Risky => 1.5,
        SafetyRating::Unsafe => 0.0,
    }
}

/// Confidence from window length, sample depth, and historical backing.
pub fn classify_confidence(
    duration_seconds: f64,
    sample_count: u64,
    safety: SafetyRating,
    has_prometheus: bool,
) -> Confidence {
    if duration_seconds >= 86_400.0
        && has_prometheus
        && safety == SafetyRating::Safe
        && sample_count >= 5_000
    {
        Confidence::High
    } else if duration_seconds >= 7_200.0 && (has_prometheus || sample_count >= 1_000) {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/* ============================= DELTA MATH ============================= */

/// Percent change from `current` to `recommended`.
/// An unset current (0) going to a set value reads as 100%.
pub fn delta_percent(current: f64, recommended: f64) -> f64 {
    if current == 0.0 {
        if recommended == 0.0 { 0.0 } else { 100.0 }
    } else {
        (recommended - current) / current * 100.0
    }
}

/// Engine constants: CPU limit fallback on p99 (p99.9 is never latched),
/// memory limit headroom, and the burst cap on current limits.
const CPU_LIMIT_FACTOR: f64 = 1.5;
const MEMORY_LIMIT_FACTOR: f64 = 1.2;
const BURST_CAP_FACTOR: f64 = 2.0;

/* ============================= ENGINE ============================= */

/// Compute a recommendation from latch evidence and current container
/// values. Pure apart from stamping `timestamp`: the same inputs always
/// produce the same output.
pub fn recommend(
    workload: &WorkloadReference,
    latch: Option<&LatchResult>,
    containers: &[ContainerResources],
    bounds: Option<&PolicyBounds>,
    hpa: Option<&HpaInfo>,
    has_prometheus: bool,
) -> AlignmentRecommendation {
    let mut rec = AlignmentRecommendation {
        workload: workload.clone(),
        timestamp: Utc::now(),
        safety: SafetyRating::Caution,
        confidence: Confidence::Low,
        containers: Vec::new(),
        evidence: None,
        warnings: Vec::new(),
        policy: PolicyResult::default(),
    };

    if let Some(denial) = namespace_denial(&workload.namespace) {
        rec.policy.apply_allowed = false;
        rec.policy.denial_reasons.push(denial);
    }

    if let Some(h) = hpa {
        rec.policy.hpa_detected = true;
        rec.policy.hpa_name = Some(h.name.clone());
        rec.warnings.push(format!(
            "HorizontalPodAutoscaler '{}' targets this workload (min {}, max {} replicas); \
             autoscaling may fight request changes",
            h.name,
            h.min_replicas.unwrap_or(1),
            h.max_replicas
        ));
    }

    // ── Latch evidence present and usable? ──

    if let Some(s) = latch.and_then(|l| l.spike.as_ref()) {
        rec.evidence = Some(evidence_from(s, latch));
    }

    let usable = latch.and_then(|l| {
        if !l.valid {
            return None;
        }
        match (l.spike.as_ref(), l.cpu, l.memory) {
            (Some(s), Some(c), Some(m)) => Some((l, s, c, m)),
            _ => None,
        }
    });

    let Some((latch, spike, cpu_pct, mem_pct)) = usable else {
        let reason = latch
            .and_then(|l| l.invalid_reason.clone())
            .unwrap_or_else(|| "no latch evidence".to_string());
        rec.warnings.push(format!(
            "latch evidence is missing or invalid ({reason}); no recommendation produced"
        ));
        return rec;
    };

    if latch.planned_duration_seconds.is_some() {
        rec.warnings.push(format!(
            "latch was stopped early after {:.0}s of a planned {:.0}s window",
            latch.duration_seconds,
            latch.planned_duration_seconds.unwrap_or_default()
        ));
    }

    // ── Classification ──

    rec.safety = classify_safety(Some(spike));
    rec.confidence = classify_confidence(
        latch.duration_seconds,
        spike.sample_count,
        rec.safety,
        has_prometheus,
    );

    if rec.safety == SafetyRating::Unsafe {
        rec.warnings.insert(
            0,
            format!(
                "UNSAFE: no recommendation produced ({} OOM kills, {} restarts, {} evictions)",
                spike.oom_kills, spike.restarts, spike.evictions
            ),
        );
        rec.policy.apply_allowed = false;
        return rec;
    }

    if let Some(b) = bounds {
        if rec.safety > b.min_safety_rating {
            rec.warnings.push(format!(
                "safety rating {} is below the policy floor {}; no recommendation produced",
                rec.safety, b.min_safety_rating
            ));
            rec.policy.apply_allowed = false;
            return rec;
        }
    }

    if containers.len() > 1 {
        rec.warnings.push(format!(
            "workload runs {} containers; recommendations use aggregate pod metrics \
             without per-container attribution",
            containers.len()
        ));
    }

    // ── Per-container computation ──

    let margin = safety_margin(rec.safety);
    for current in containers {
        rec.containers
            .push(align_container(current, margin, &cpu_pct, &mem_pct, spike, bounds));
    }

    rec
}

fn evidence_from(spike: &SpikeData, latch: Option<&LatchResult>) -> Evidence {
    Evidence {
        namespace: spike.namespace.clone(),
        workload_name: spike.workload_name.clone(),
        pod_name: spike.pod_name.clone(),
        operator_type: spike.operator_type.clone(),
        duration_seconds: latch.map(|l| l.duration_seconds).unwrap_or_default(),
        interval_seconds: latch.map(|l| l.interval_seconds).unwrap_or_default(),
        sample_count: spike.sample_count,
        oom_kills: spike.oom_kills,
        restarts: spike.restarts,
        evictions: spike.evictions,
        throttling_detected: spike.throttling_detected,
        spike_count: spike.spike_count,
        max_cpu: spike.max_cpu,
        max_memory: spike.max_memory,
        critical_events: spike.critical_events.clone(),
    }
}

/// Size one container from the pod-level percentiles.
fn align_container(
    current: &ContainerResources,
    margin: f64,
    cpu: &crate::spike::Percentiles,
    mem: &crate::spike::Percentiles,
    spike: &SpikeData,
    bounds: Option<&PolicyBounds>,
) -> ContainerAlignment {
    let mut capped_fields: Vec<String> = Vec::new();

    // Base sizing: p95 for requests, p99 for limits. Memory is
    // non-compressible so its limit floors at the observed max.
    let mut rec_cpu_request = cpu.p95 * margin;
    let mut rec_cpu_limit = cpu.p99 * margin * CPU_LIMIT_FACTOR;
    let mut rec_mem_request = mem.p95 * margin;
    let mut rec_mem_limit = (mem.p99 * margin * MEMORY_LIMIT_FACTOR).max(spike.max_memory);

    // Burst cap: never recommend a limit beyond 2× the current limit.
    if current.cpu_limit > 0.0 {
        rec_cpu_limit = rec_cpu_limit.min(BURST_CAP_FACTOR * current.cpu_limit);
    }
    if current.memory_limit > 0 {
        rec_mem_limit = rec_mem_limit.min(BURST_CAP_FACTOR * current.memory_limit as f64);
    }

    // A limit can never sit below its request.
    rec_cpu_limit = rec_cpu_limit.max(rec_cpu_request);
    rec_mem_limit = rec_mem_limit.max(rec_mem_request);

    let cur_mem_request = current.memory_request as f64;
    let cur_mem_limit = current.memory_limit as f64;

    let mut d_cpu_request = delta_percent(current.cpu_request, rec_cpu_request);
    let mut d_cpu_limit = delta_percent(current.cpu_limit, rec_cpu_limit);
    let mut d_mem_request = delta_percent(cur_mem_request, rec_mem_request);
    let mut d_mem_limit = delta_percent(cur_mem_limit, rec_mem_limit);

    if let Some(b) = bounds {
        clamp_field(
            &mut rec_cpu_request,
            &mut d_cpu_request,
            current.cpu_request,
            b.max_request_delta_percent,
            "cpu_request",
            &mut capped_fields,
        );
        clamp_field(
            &mut rec_mem_request,
            &mut d_mem_request,
            cur_mem_request,
            b.max_request_delta_percent,
            "memory_request",
            &mut capped_fields,
        );
        clamp_field(
            &mut rec_cpu_limit,
            &mut d_cpu_limit,
            current.cpu_limit,
            b.max_limit_delta_percent,
            "cpu_limit",
            &mut capped_fields,
        );
        clamp_field(
            &mut rec_mem_limit,
            &mut d_mem_limit,
            cur_mem_limit,
            b.max_limit_delta_percent,
            "memory_limit",
            &mut capped_fields,
        );

        if !b.allow_limit_decrease {
            if current.cpu_limit > 0.0 && rec_cpu_limit < current.cpu_limit {
                rec_cpu_limit = current.cpu_limit;
                d_cpu_limit = 0.0;
            }
            if cur_mem_limit > 0.0 && rec_mem_limit < cur_mem_limit {
                rec_mem_limit = cur_mem_limit;
                d_mem_limit = 0.0;
            }
        }

        // Clamping can push a limit back under its request.
        if rec_cpu_limit < rec_cpu_request {
            rec_cpu_limit = rec_cpu_request;
            d_cpu_limit = delta_percent(current.cpu_limit, rec_cpu_limit);
        }
        if rec_mem_limit < rec_mem_request {
            rec_mem_limit = rec_mem_request;
            d_mem_limit = delta_percent(cur_mem_limit, rec_mem_limit);
        }
    }

    let capped = !capped_fields.is_empty();

    ContainerAlignment {
        current: current.clone(),
        recommended: ContainerResources {
            name: current.name.clone(),
            cpu_request: rec_cpu_request,
            cpu_limit: rec_cpu_limit,
            memory_request: rec_mem_request.round() as u64,
            memory_limit: rec_mem_limit.round() as u64,
        },
        delta: ResourceDelta {
            cpu_request: d_cpu_request,
            cpu_limit: d_cpu_limit,
            memory_request: d_mem_request,
            memory_limit: d_mem_limit,
        },
        capped,
        capped_fields,
    }
}

/// Pin a recommended value inside the policy's delta envelope around the
/// current value, marking the field and recomputing its delta.
fn clamp_field(
    rec: &mut f64,
    delta: &mut f64,
    current: f64,
    max_delta: f64,
    field: &str,
    capped_fields: &mut Vec<String>,
) {
    if current <= 0.0 || delta.abs() <= max_delta {
        return;
    }
    let sign = if *delta > 0.0 { 1.0 } else { -1.0 };
    *rec = current * (1.0 + sign * max_delta / 100.0);
    *delta = delta_percent(current, *rec);
    capped_fields.push(field.to_string());
}

/* ============================= TESTS ============================= */
