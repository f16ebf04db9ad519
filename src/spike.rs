use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/* ============================= LIMITS ============================= */

/// Hard cap on retained samples per workload: 24h at a 5s interval.
/// Oldest samples are evicted FIFO once the cap is reached.
pub const SAMPLE_CAP: usize = 17_280;

/// Bound on the human-readable critical-event list.
pub const CRITICAL_EVENT_CAP: usize = 50;

/// A sample must exceed this multiple of the running average to count
/// as a spike.
const SPIKE_FACTOR: f64 = 2.0;

/// Spike detection only engages once this many samples are present.
const SPIKE_MIN_SAMPLES: u64 = 10;

/* ============================= PERCENTILES ============================= */

/// Percentile summary over one sample series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub avg: f64,
}

/// Compute percentiles over a sample series without mutating it.
///
/// Nearest-rank on a sorted copy. Returns `None` for an empty series.
pub fn compute_percentiles<I>(samples: I) -> Option<Percentiles>
where
    I: IntoIterator<Item = f64>,
{
    let mut sorted: Vec<f64> = samples.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let rank = |p: f64| -> f64 {
        let idx = ((p / 100.0) * n as f64).ceil() as usize;
        sorted[idx.clamp(1, n) - 1]
    };

    let sum: f64 = sorted.iter().sum();

    Some(Percentiles {
        p50: rank(50.0),
        p95: rank(95.0),
        p99: rank(99.0),
        max: sorted[n - 1],
        avg: sum / n as f64,
    })
}

/* ============================= SPIKE DATA ============================= */

/// The running product of a latch session for one workload: bounded
/// sample arrays, running aggregates, and the distress signals harvested
/// at window close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SpikeData {
    // Identity
    pub namespace: String,
    pub workload_name: String,
    /// Operator managing the workload (CNPG, Strimzi, ...), if any.
    pub operator_type: Option<String>,
    /// Representative pod observed for this workload.
    pub pod_name: String,

    // Samples (per-sample pod totals)
    /// CPU in cores.
    pub cpu_samples: VecDeque<f64>,
    /// Memory in bytes.
    pub memory_samples: VecDeque<f64>,

    // Running aggregates
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Total samples observed, including any evicted past the cap.
    pub sample_count: u64,
    pub max_cpu: f64,
    pub max_memory: f64,
    pub avg_cpu: f64,
    pub avg_memory: f64,
    pub spike_count: u64,
    pub(crate) sum_cpu: f64,
    pub(crate) sum_memory: f64,

    // End-of-window signals (populated in a single harvest pass)
    pub oom_kills: u32,
    pub restarts: u32,
    pub evictions: u32,
    pub throttling_detected: bool,
    pub critical_events: Vec<String>,
    pub termination_reasons: BTreeMap<String, u32>,
    pub exit_codes: BTreeMap<i32, u32>,
    pub last_termination_time: Option<DateTime<Utc>>,
}

impl SpikeData {
    pub fn new(namespace: &str, workload_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            workload_name: workload_name.to_string(),
            ..Default::default()
        }
    }

    /// Append one sample pass, updating aggregates and spike detection.
    ///
    /// Spike detection compares the incoming sample against the running
    /// average of the samples already retained, so it runs before the
    /// averages are updated.
    pub fn add_sample(&mut self, at: DateTime<Utc>, cpu: f64, memory: f64) {
        if self.first_seen.is_none() {
            self.first_seen = Some(at);
        }
        self.last_seen = Some(at);

        if self.sample_count >= SPIKE_MIN_SAMPLES
            && ((self.avg_cpu > 0.0 && cpu > SPIKE_FACTOR * self.avg_cpu)
                || (self.avg_memory > 0.0 && memory > SPIKE_FACTOR * self.avg_memory))
        {
            self.spike_count += 1;
        }

        self.cpu_samples.push_back(cpu);
        self.memory_samples.push_back(memory);
        self.sum_cpu += cpu;
        self.sum_memory += memory;

        if self.cpu_samples.len() > SAMPLE_CAP {
            if let Some(old) = self.cpu_samples.pop_front() {
                self.sum_cpu -= old;
            }
            if let Some(old) = self.memory_samples.pop_front() {
                self.sum_memory -= old;
            }
        }

        self.sample_count += 1;
        if cpu > self.max_cpu {
            self.max_cpu = cpu;
        }
        if memory > self.max_memory {
            self.max_memory = memory;
        }

        let retained = self.cpu_samples.len() as f64;
        self.avg_cpu = self.sum_cpu / retained;
        self.avg_memory = self.sum_memory / retained;
    }

    /// Record a harvested container termination.
    pub fn record_termination(&mut self, reason: &str, exit_code: i32, at: Option<DateTime<Utc>>) {
        *self
            .termination_reasons
            .entry(reason.to_string())
            .or_insert(0) += 1;
        *self.exit_codes.entry(exit_code).or_insert(0) += 1;

        if let Some(at) = at {
            if self.last_termination_time.is_none_or(|prev| at > prev) {
                self.last_termination_time = Some(at);
            }
        }
    }

    /// Append a critical event, deduplicated and bounded.
    pub fn push_critical_event(&mut self, event: String) {
        if self.critical_events.len() >= CRITICAL_EVENT_CAP {
            return;
        }
        if !self.critical_events.contains(&event) {
            self.critical_events.push(event);
        }
    }

    pub fn cpu_percentiles(&self) -> Option<Percentiles> {
        compute_percentiles(self.cpu_samples.iter().copied())
    }

    pub fn memory_percentiles(&self) -> Option<Percentiles> {
        compute_percentiles(self.memory_samples.iter().copied())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(sec: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + sec, 0).unwrap()
    }

    // ── compute_percentiles ──

    #[test]
    fn test_percentiles_empty() {
        assert!(compute_percentiles(std::iter::empty()).is_none());
    }

    #[test]
    fn test_percentiles_single_sample() {
        let p = compute_percentiles([7.0]).unwrap();
        assert_eq!(p.p50, 7.0);
        assert_eq!(p.p95, 7.0);
        assert_eq!(p.p99, 7.0);
        assert_eq!(p.max, 7.0);
        assert_eq!(p.avg, 7.0);
    }

    #[test]
    fn test_percentiles_hundred_samples() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let p = compute_percentiles(samples).unwrap();
        assert_eq!(p.p50, 50.0);
        assert_eq!(p.p95, 95.0);
        assert_eq!(p.p99, 99.0);
        assert_eq!(p.max, 100.0);
        assert_eq!(p.avg, 50.5);
    }

    #[test]
    fn test_percentiles_unsorted_input() {
        let p = compute_percentiles([5.0, 1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_eq!(p.p50, 3.0);
        assert_eq!(p.max, 5.0);
    }

    #[test]
    fn test_percentiles_does_not_mutate_source() {
        let data = SpikeData {
            cpu_samples: VecDeque::from(vec![3.0, 1.0, 2.0]),
            ..Default::default()
        };
        let _ = data.cpu_percentiles();
        assert_eq!(data.cpu_samples, VecDeque::from(vec![3.0, 1.0, 2.0]));
    }

    // ── add_sample ──

    #[test]
    fn test_add_sample_aggregates() {
        let mut s = SpikeData::new("prod", "web");
        s.add_sample(ts(0), 0.1, 100.0);
        s.add_sample(ts(5), 0.3, 300.0);

        assert_eq!(s.sample_count, 2);
        assert_eq!(s.cpu_samples.len(), 2);
        assert_eq!(s.memory_samples.len(), 2);
        assert_eq!(s.max_cpu, 0.3);
        assert_eq!(s.max_memory, 300.0);
        assert!((s.avg_cpu - 0.2).abs() < 1e-12);
        assert!((s.avg_memory - 200.0).abs() < 1e-12);
        assert_eq!(s.first_seen, Some(ts(0)));
        assert_eq!(s.last_seen, Some(ts(5)));
    }

    #[test]
    fn test_first_seen_not_after_last_seen() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..20 {
            s.add_sample(ts(i * 5), 0.1, 100.0);
        }
        assert!(s.first_seen.unwrap() <= s.last_seen.unwrap());
    }

    #[test]
    fn test_sample_arrays_equal_length() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..50 {
            s.add_sample(ts(i), 0.1, 100.0);
        }
        assert_eq!(s.cpu_samples.len(), s.memory_samples.len());
        assert_eq!(s.cpu_samples.len() as u64, s.sample_count);
    }

    #[test]
    fn test_fifo_eviction_at_cap() {
        let mut s = SpikeData::new("prod", "web");
        // First sample is distinct so we can observe its eviction.
        s.add_sample(ts(0), 99.0, 9900.0);
        for i in 1..=(SAMPLE_CAP as i64) {
            s.add_sample(ts(i), 1.0, 100.0);
        }

        assert_eq!(s.cpu_samples.len(), SAMPLE_CAP);
        assert_eq!(s.sample_count, SAMPLE_CAP as u64 + 1);
        // Oldest (the 99.0) was evicted
        assert_eq!(*s.cpu_samples.front().unwrap(), 1.0);
        // Running average reflects only retained samples
        assert!((s.avg_cpu - 1.0).abs() < 1e-9);
        // Max is a high-water mark, not windowed
        assert_eq!(s.max_cpu, 99.0);
    }

    #[test]
    fn test_avg_is_mean_of_retained_samples() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..100 {
            s.add_sample(ts(i), (i % 10) as f64, 100.0);
        }
        let expected: f64 = s.cpu_samples.iter().sum::<f64>() / s.cpu_samples.len() as f64;
        assert!((s.avg_cpu - expected).abs() < 1e-9);
    }

    // ── spike detection ──

    #[test]
    fn test_no_spike_before_min_samples() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..9 {
            s.add_sample(ts(i), 0.1, 100.0);
        }
        // 10th sample is huge but only 9 prior samples exist
        s.add_sample(ts(9), 10.0, 100.0);
        assert_eq!(s.spike_count, 0);
    }

    #[test]
    fn test_cpu_spike_counted_after_min_samples() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..10 {
            s.add_sample(ts(i), 0.1, 100.0);
        }
        s.add_sample(ts(10), 0.5, 100.0); // > 2 × 0.1
        assert_eq!(s.spike_count, 1);
    }

    #[test]
    fn test_memory_spike_counted() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..10 {
            s.add_sample(ts(i), 0.1, 100.0);
        }
        s.add_sample(ts(10), 0.1, 500.0);
        assert_eq!(s.spike_count, 1);
    }

    #[test]
    fn test_double_spike_counts_once_per_sample() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..10 {
            s.add_sample(ts(i), 0.1, 100.0);
        }
        // Both series spike in the same pass
        s.add_sample(ts(10), 1.0, 1000.0);
        assert_eq!(s.spike_count, 1);
    }

    #[test]
    fn test_sample_at_twice_average_is_not_spike() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..10 {
            s.add_sample(ts(i), 0.1, 100.0);
        }
        // Exactly 2× is not "exceeds"
        s.add_sample(ts(10), 0.2, 200.0);
        assert_eq!(s.spike_count, 0);
    }

    // ── harvest records ──

    #[test]
    fn test_record_termination_counts() {
        let mut s = SpikeData::new("prod", "web");
        s.record_termination("OOMKilled", 137, Some(ts(100)));
        s.record_termination("OOMKilled", 137, Some(ts(50)));
        s.record_termination("Error", 1, Some(ts(200)));

        assert_eq!(s.termination_reasons["OOMKilled"], 2);
        assert_eq!(s.termination_reasons["Error"], 1);
        assert_eq!(s.exit_codes[&137], 2);
        assert_eq!(s.exit_codes[&1], 1);
        // Keeps the newest termination time
        assert_eq!(s.last_termination_time, Some(ts(200)));
    }

    #[test]
    fn test_critical_events_deduped() {
        let mut s = SpikeData::new("prod", "web");
        s.push_critical_event("oom".to_string());
        s.push_critical_event("oom".to_string());
        assert_eq!(s.critical_events.len(), 1);
    }

    #[test]
    fn test_critical_events_bounded() {
        let mut s = SpikeData::new("prod", "web");
        for i in 0..(CRITICAL_EVENT_CAP + 20) {
            s.push_critical_event(format!("event-{i}"));
        }
        assert_eq!(s.critical_events.len(), CRITICAL_EVENT_CAP);
    }

    // ── serialization ──

    #[test]
    fn test_spike_data_roundtrip() {
        let mut s = SpikeData::new("prod", "web");
        s.pod_name = "web-abc-123".to_string();
        s.operator_type = Some("CNPG".to_string());
        for i in 0..20 {
            s.add_sample(ts(i), 0.1 * i as f64, 100.0 * i as f64);
        }
        s.record_termination("OOMKilled", 137, Some(ts(5)));
        s.oom_kills = 1;

        let json = serde_json::to_string(&s).expect("should serialize");
        let back: SpikeData = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(s, back);
    }
}
