#![allow(dead_code)]

use chrono::Utc;

use kubenow::latch::LatchResult;
use kubenow::spike::{Percentiles, SpikeData};
use kubenow::workload::{ContainerResources, WorkloadKind, WorkloadReference};

pub const MIB: u64 = 1024 * 1024;

pub fn web_deployment() -> WorkloadReference {
    WorkloadReference::new(WorkloadKind::Deployment, "web", "prod")
}

/// Spike fixture carrying the given distress signals and a plausible
/// sample history.
pub fn make_spike(oom_kills: u32, restarts: u32, evictions: u32) -> SpikeData {
    let mut spike = SpikeData::new("prod", "web");
    spike.pod_name = "web-7d4f8b9c7f-x2k4j".to_string();
    for i in 0..180 {
        spike.add_sample(Utc::now(), 0.05 + (i % 10) as f64 * 0.005, 1.5e8);
    }
    spike.oom_kills = oom_kills;
    spike.restarts = restarts;
    spike.evictions = evictions;
    spike
}

/// The percentile set from the SAFE scenario: CPU p95=0.08, p99=0.12,
/// max=0.15.
pub fn s1_cpu_percentiles() -> Percentiles {
    Percentiles {
        p50: 0.05,
        p95: 0.08,
        p99: 0.12,
        max: 0.15,
        avg: 0.05,
    }
}

/// Memory p95=170MiB, p99=200MiB, max=220MiB.
pub fn s1_memory_percentiles() -> Percentiles {
    Percentiles {
        p50: 150.0 * MIB as f64,
        p95: 170.0 * MIB as f64,
        p99: 200.0 * MIB as f64,
        max: 220.0 * MIB as f64,
        avg: 150.0 * MIB as f64,
    }
}

/// Current container values from the SAFE scenario.
pub fn s1_container() -> ContainerResources {
    ContainerResources {
        name: "main".to_string(),
        cpu_request: 0.1,
        cpu_limit: 0.5,
        memory_request: 128 * MIB,
        memory_limit: 512 * MIB,
    }
}

/// A valid 15-minute latch (180 samples at 5s) with explicit percentiles.
pub fn make_latch(spike: SpikeData, cpu: Percentiles, memory: Percentiles) -> LatchResult {
    LatchResult {
        workload: web_deployment(),
        timestamp: Utc::now(),
        duration_seconds: 900.0,
        interval_seconds: 5,
        planned_duration_seconds: None,
        spike: Some(spike),
        cpu: Some(cpu),
        memory: Some(memory),
        gaps: 0,
        valid: true,
        invalid_reason: None,
    }
}

pub fn s1_latch() -> LatchResult {
    make_latch(
        make_spike(0, 0, 0),
        s1_cpu_percentiles(),
        s1_memory_percentiles(),
    )
}
