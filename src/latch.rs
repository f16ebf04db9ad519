use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::metrics::{ClusterObserver, PodUsage};
use crate::spike::SpikeData;
use crate::workload::{WorkloadKind, WorkloadReference};

/* ============================= CONSTANTS ============================= */

/// Pod labels consulted for workload identity, in priority order.
pub const WORKLOAD_LABELS: &[&str] = &[
    "app.kubernetes.io/name",
    "app.kubernetes.io/instance",
    "app",
    "cnpg.io/cluster",
];

/// Container waiting reasons worth surfacing as critical events.
const WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Warning-event reasons harvested from the namespace event stream.
const HARVEST_EVENT_REASONS: &[&str] =
    &["OOMKilling", "FailedScheduling", "FailedMount", "BackOff"];

/// Only events from the last this-many minutes are harvested.
const EVENT_LOOKBACK_MINUTES: i64 = 30;

/// Event messages are truncated to this many characters.
const EVENT_MESSAGE_LIMIT: usize = 100;

/// Pod labels are re-listed no more often than this.
const LABEL_REFRESH: Duration = Duration::from_secs(60);

/// A restart delta above this yields a critical event.
const RESTART_EVENT_THRESHOLD: i32 = 5;

/* ============================= IDENTITY RESOLUTION ============================= */

/// Resolve a workload name from pod labels, falling back to stripping
/// the last two dash-separated segments of the pod name (the
/// ReplicaSet hash and the pod suffix).
pub fn resolve_workload_name(labels: &BTreeMap<String, String>, pod_name: &str) -> String {
    for key in WORKLOAD_LABELS {
        if let Some(value) = labels.get(*key) {
            return value.clone();
        }
    }
    strip_pod_suffix(pod_name)
}

/// `web-7d4f8b9c7f-x2k4j` → `web`. Names with fewer than three
/// segments are returned unchanged.
pub fn strip_pod_suffix(pod_name: &str) -> String {
    let segments: Vec<&str> = pod_name.split('-').collect();
    if segments.len() < 3 {
        return pod_name.to_string();
    }
    segments[..segments.len() - 2].join("-")
}

/// Derive the operator managing a workload from operator-specific
/// labels, falling back to `app.kubernetes.io/managed-by`.
pub fn resolve_operator_type(labels: &BTreeMap<String, String>) -> Option<String> {
    if labels.contains_key("cnpg.io/cluster") {
        return Some("CNPG".to_string());
    }
    if labels.contains_key("strimzi.io/cluster") {
        return Some("Strimzi".to_string());
    }
    if labels.contains_key("rabbitmq.com/cluster-operator") {
        return Some("RabbitMQ".to_string());
    }
    labels.get("app.kubernetes.io/managed-by").cloned()
}

/// Resolve the owning workload kind from a pod's owner references.
/// ReplicaSet owners imply a Deployment.
pub fn resolve_owner_kind(pod: &Pod) -> Option<WorkloadKind> {
    for owner in pod.metadata.owner_references.as_ref()? {
        match owner.kind.as_str() {
            "Deployment" | "ReplicaSet" => return Some(WorkloadKind::Deployment),
            "StatefulSet" => return Some(WorkloadKind::StatefulSet),
            "DaemonSet" => return Some(WorkloadKind::DaemonSet),
            _ => continue,
        }
    }
    None
}

fn truncate_chars(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        s.chars().take(limit).collect()
    }
}

/* ============================= LATCH RESULT ============================= */

/// The persisted closure of a latch session for one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatchResult {
    pub workload: WorkloadReference,
    /// When the session closed.
    pub timestamp: DateTime<Utc>,
    /// Actual elapsed window.
    pub duration_seconds: f64,
    pub interval_seconds: u64,
    /// Set only when the session was stopped before its planned end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_duration_seconds: Option<f64>,
    pub spike: Option<SpikeData>,
    pub cpu: Option<crate::spike::Percentiles>,
    pub memory: Option<crate::spike::Percentiles>,
    pub gaps: u32,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

impl LatchResult {
    /// Samples the window should have produced at its interval.
    pub fn expected_samples(&self) -> u64 {
        if self.interval_seconds == 0 {
            return 1;
        }
        ((self.duration_seconds / self.interval_seconds as f64).round() as u64).max(1)
    }
}

/// Close one workload's session into a LatchResult, computing
/// percentiles and the validity verdict.
pub fn finalize_latch(
    workload: WorkloadReference,
    spike: SpikeData,
    closed_at: DateTime<Utc>,
    duration_seconds: f64,
    planned_duration_seconds: Option<f64>,
    interval_seconds: u64,
    gaps: u32,
) -> LatchResult {
    let cpu = spike.cpu_percentiles();
    let memory = spike.memory_percentiles();

    let mut result = LatchResult {
        workload,
        timestamp: closed_at,
        duration_seconds,
        interval_seconds,
        planned_duration_seconds,
        spike: Some(spike),
        cpu,
        memory,
        gaps,
        valid: true,
        invalid_reason: None,
    };

    let sample_count = result
        .spike
        .as_ref()
        .map(|s| s.sample_count)
        .unwrap_or_default();

    if sample_count == 0 {
        result.valid = false;
        result.invalid_reason = Some("no samples collected".to_string());
        return result;
    }

    let expected = result.expected_samples();
    if gaps as f64 / expected as f64 > 0.10 {
        result.valid = false;
        result.invalid_reason = Some(format!(
            "{gaps} gaps over {expected} expected samples exceeds the 10% tolerance"
        ));
    }

    result
}

/* ============================= CONFIG ============================= */

/// Parameters for one latch session.
#[derive(Debug, Clone)]
pub struct LatchConfig {
    /// Namespaces to monitor; empty means all namespaces.
    pub namespaces: Vec<String>,
    /// Restrict to one resolved workload name.
    pub workload_filter: Option<String>,
    pub duration: Duration,
    pub interval: Duration,
}

impl LatchConfig {
    pub fn expected_samples(&self) -> u64 {
        let interval = self.interval.as_secs_f64();
        if interval <= 0.0 {
            return 1;
        }
        ((self.duration.as_secs_f64() / interval).round() as u64).max(1)
    }

    fn namespace_targets(&self) -> Vec<Option<String>> {
        if self.namespaces.is_empty() {
            vec![None]
        } else {
            self.namespaces.iter().cloned().map(Some).collect()
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LatchOutcome {
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub stopped_early: bool,
    pub gaps: u32,
}

/* ============================= MONITOR ============================= */

#[derive(Debug, Clone, Default)]
struct PodInfo {
    labels: BTreeMap<String, String>,
    owner_kind: Option<WorkloadKind>,
}

#[derive(Default)]
struct MonitorState {
    /// `<namespace>/<workload>` → running aggregates.
    workloads: HashMap<String, SpikeData>,
    /// `<namespace>/<workload>` → resolved owning kind.
    kinds: HashMap<String, WorkloadKind>,
    /// `<namespace>/<pod>` → cached labels and owner kind.
    pods: HashMap<String, PodInfo>,
    /// `<namespace>/<pod>/<container>` → restart count at session start.
    restart_baseline: HashMap<String, i32>,
    labels_refreshed: Option<tokio::time::Instant>,
    gaps: u32,
}

pub type ProgressCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Time-bounded sampler: collects pod usage at a fixed interval,
/// aggregates per-workload statistics, and harvests distress signals
/// once at window close. Getters hand out deep copies; the sampling
/// and harvest passes own the write side.
pub struct LatchMonitor<O: ClusterObserver> {
    observer: O,
    config: LatchConfig,
    state: Arc<RwLock<MonitorState>>,
    stop_tx: broadcast::Sender<()>,
    progress: Option<ProgressCallback>,
}

impl<O: ClusterObserver> LatchMonitor<O> {
    pub fn new(observer: O, config: LatchConfig) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            observer,
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
            stop_tx,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Cooperatively request early termination. `run` finishes its
    /// current pass, harvests, and returns.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    fn emit(&self, message: &str) {
        if let Some(cb) = &self.progress {
            cb(message);
        }
    }

    /// Deep copy of all per-workload aggregates observed so far.
    pub async fn spike_data(&self) -> HashMap<String, SpikeData> {
        self.state.read().await.workloads.clone()
    }

    /// Deep copy for a single workload, if observed.
    pub async fn workload_spike_data(&self, namespace: &str, name: &str) -> Option<SpikeData> {
        self.state
            .read()
            .await
            .workloads
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    /// Run the session: blocks until the window closes or `stop` is
    /// called. Sampling errors are counted as gaps and reported through
    /// the progress callback; they never terminate the session.
    pub async fn run(&self) -> anyhow::Result<LatchOutcome> {
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();

        self.snapshot_restart_baseline().await;

        let expected = self.config.expected_samples();
        info!(
            duration_secs = self.config.duration.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            expected_samples = expected,
            "latch_started"
        );

        let mut stop_rx = self.stop_tx.subscribe();
        let deadline = started + self.config.duration;
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut stopped_early = false;
        let mut ticks: u64 = 0;
        let progress_step = (expected / 10).max(1);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = stop_rx.recv() => {
                    info!("latch_stop_requested");
                    stopped_early = true;
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_pass().await {
                        self.state.write().await.gaps += 1;
                        warn!(error = %e, "sample_pass_failed");
                        self.emit(&format!("sample pass failed: {e:#}"));
                    }
                    ticks += 1;
                    if ticks % progress_step == 0 {
                        self.emit(&format!("collected {ticks}/{expected} samples"));
                    }
                }
            }
        }

        self.harvest().await;

        let state = self.state.read().await;
        let outcome = LatchOutcome {
            started_at,
            closed_at: Utc::now(),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            stopped_early,
            gaps: state.gaps,
        };
        info!(
            workloads = state.workloads.len(),
            gaps = state.gaps,
            stopped_early,
            "latch_closed"
        );
        Ok(outcome)
    }

    /// Close every observed workload into a LatchResult.
    pub async fn results(&self, outcome: &LatchOutcome) -> Vec<LatchResult> {
        let state = self.state.read().await;
        let planned = outcome
            .stopped_early
            .then(|| self.config.duration.as_secs_f64());

        let mut results: Vec<LatchResult> = state
            .workloads
            .iter()
            .map(|(key, spike)| {
                let kind = state
                    .kinds
                    .get(key)
                    .copied()
                    .unwrap_or(WorkloadKind::Deployment);
                let workload =
                    WorkloadReference::new(kind, &spike.workload_name, &spike.namespace);
                finalize_latch(
                    workload,
                    spike.clone(),
                    outcome.closed_at,
                    outcome.elapsed_seconds,
                    planned,
                    self.config.interval.as_secs(),
                    state.gaps,
                )
            })
            .collect();

        results.sort_by(|a, b| a.workload.key().cmp(&b.workload.key()));
        results
    }

    /* ── initialization ── */

    /// Snapshot restart counts so the harvest can report only restarts
    /// that happened inside the window. All-namespaces mode starts from
    /// an empty baseline.
    async fn snapshot_restart_baseline(&self) {
        if self.config.namespaces.is_empty() {
            return;
        }

        let mut baseline = HashMap::new();
        for ns in &self.config.namespaces {
            match self.observer.list_pods(Some(ns)).await {
                Ok(pods) => {
                    for pod in &pods {
                        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
                        for cs in container_statuses(pod) {
                            baseline.insert(
                                format!("{ns}/{pod_name}/{}", cs.name),
                                cs.restart_count,
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(namespace = %ns, error = %e, "restart_baseline_failed");
                }
            }
        }

        self.state.write().await.restart_baseline = baseline;
    }

    /* ── sampling ── */

    async fn sample_pass(&self) -> anyhow::Result<()> {
        self.refresh_labels_if_stale().await?;

        let targets = self.config.namespace_targets();
        let fetches = targets
            .iter()
            .map(|ns| self.observer.pod_usage(ns.as_deref()));
        let mut usage: Vec<PodUsage> = Vec::new();
        for outcome in join_all(fetches).await {
            usage.extend(outcome.context("pod metrics fetch failed")?);
        }

        let now = Utc::now();
        let mut state = self.state.write().await;

        for sample in usage {
            if sample.namespace == "kube-system" {
                continue;
            }

            let pod_key = format!("{}/{}", sample.namespace, sample.pod);
            let info = state.pods.get(&pod_key).cloned().unwrap_or_default();

            let workload = resolve_workload_name(&info.labels, &sample.pod);
            if let Some(filter) = &self.config.workload_filter {
                if &workload != filter {
                    continue;
                }
            }

            let key = format!("{}/{}", sample.namespace, workload);
            if let Some(kind) = info.owner_kind {
                state.kinds.entry(key.clone()).or_insert(kind);
            }

            let operator = resolve_operator_type(&info.labels);
            let entry = state
                .workloads
                .entry(key)
                .or_insert_with(|| SpikeData::new(&sample.namespace, &workload));
            entry.pod_name = sample.pod.clone();
            if entry.operator_type.is_none() {
                entry.operator_type = operator;
            }
            entry.add_sample(now, sample.cpu, sample.memory);
        }

        Ok(())
    }

    async fn refresh_labels_if_stale(&self) -> anyhow::Result<()> {
        {
            let state = self.state.read().await;
            if let Some(at) = state.labels_refreshed {
                if at.elapsed() < LABEL_REFRESH {
                    return Ok(());
                }
            }
        }

        let targets = self.config.namespace_targets();
        let fetches = targets
            .iter()
            .map(|ns| self.observer.list_pods(ns.as_deref()));
        let mut pods: Vec<Pod> = Vec::new();
        for outcome in join_all(fetches).await {
            pods.extend(outcome.context("pod label refresh failed")?);
        }

        let mut cache = HashMap::new();
        for pod in &pods {
            let ns = pod.metadata.namespace.as_deref().unwrap_or_default();
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            cache.insert(
                format!("{ns}/{name}"),
                PodInfo {
                    labels: pod.metadata.labels.clone().unwrap_or_default(),
                    owner_kind: resolve_owner_kind(pod),
                },
            );
        }

        debug!(pods = cache.len(), "pod_labels_refreshed");
        let mut state = self.state.write().await;
        state.pods = cache;
        state.labels_refreshed = Some(tokio::time::Instant::now());
        Ok(())
    }

    /* ── harvest ── */

    /// One enrichment pass at window close, under the write lock so no
    /// getter observes a half-harvested state.
    async fn harvest(&self) {
        let mut state = self.state.write().await;

        let namespaces: Vec<String> = {
            let mut set: Vec<String> = state
                .workloads
                .values()
                .map(|s| s.namespace.clone())
                .collect();
            set.sort();
            set.dedup();
            set
        };

        for ns in namespaces {
            let pods = match self.observer.list_pods(Some(&ns)).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(namespace = %ns, error = %e, "harvest_pod_list_failed");
                    continue;
                }
            };
            let events = match self.observer.list_events(Some(&ns)).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(namespace = %ns, error = %e, "harvest_event_list_failed");
                    Vec::new()
                }
            };

            // Pod name → monitored workload key, from this fresh list.
            let mut pod_to_workload: HashMap<String, String> = HashMap::new();
            for pod in &pods {
                let name = pod.metadata.name.as_deref().unwrap_or_default();
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                let workload = resolve_workload_name(&labels, name);
                let key = format!("{ns}/{workload}");
                if state.workloads.contains_key(&key) {
                    pod_to_workload.insert(name.to_string(), key);
                }
            }

            for pod in &pods {
                let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
                let Some(key) = pod_to_workload.get(pod_name).cloned() else {
                    continue;
                };

                let evicted = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.reason.as_deref())
                    == Some("Evicted");

                let statuses: Vec<ContainerStatus> = container_statuses(pod).to_vec();
                let baseline_keys: Vec<(String, i32)> = statuses
                    .iter()
                    .map(|cs| {
                        let baseline = state
                            .restart_baseline
                            .get(&format!("{ns}/{pod_name}/{}", cs.name))
                            .copied()
                            .unwrap_or(0);
                        (cs.name.clone(), baseline)
                    })
                    .collect();

                let Some(spike) = state.workloads.get_mut(&key) else {
                    continue;
                };

                for (cs, (_, baseline)) in statuses.iter().zip(baseline_keys.iter()) {
                    harvest_container_status(spike, pod_name, cs, *baseline);
                }

                if evicted {
                    spike.evictions += 1;
                    spike.push_critical_event(format!("pod '{pod_name}' was evicted"));
                }
            }

            harvest_events(&mut state, &ns, &pod_to_workload, &events);
        }
    }
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default()
}

/// Fold one container status into the workload's distress signals.
fn harvest_container_status(
    spike: &mut SpikeData,
    pod_name: &str,
    cs: &ContainerStatus,
    restart_baseline: i32,
) {
    if let Some(term) = cs.last_state.as_ref().and_then(|s| s.terminated.as_ref()) {
        let reason = term.reason.as_deref().unwrap_or_default();
        spike.record_termination(
            if reason.is_empty() { "Unknown" } else { reason },
            term.exit_code,
            term.finished_at.as_ref().map(|t| t.0),
        );

        if reason == "OOMKilled" {
            spike.oom_kills += 1;
        }
        if !reason.is_empty() && reason != "Completed" {
            spike.push_critical_event(format!(
                "container '{}' in pod '{pod_name}' terminated: {reason} (exit code {})",
                cs.name, term.exit_code
            ));
        }
    }

    // Restart delta against the session baseline; a recreated pod has a
    // lower count than its baseline, so the full count is used.
    let mut delta = cs.restart_count - restart_baseline;
    if delta < 0 {
        delta = cs.restart_count;
    }
    if delta > 0 {
        spike.restarts += delta as u32;
    }
    if delta > RESTART_EVENT_THRESHOLD {
        spike.push_critical_event(format!(
            "container '{}' in pod '{pod_name}' restarted {delta} times during the window",
            cs.name
        ));
    }

    if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
        if let Some(reason) = waiting.reason.as_deref() {
            if WAITING_REASONS.contains(&reason) {
                spike.push_critical_event(format!(
                    "container '{}' in pod '{pod_name}' is waiting: {reason}",
                    cs.name
                ));
            }
        }
    }
}

/// Fold recent namespace warning events into the matching workloads.
fn harvest_events(
    state: &mut MonitorState,
    namespace: &str,
    pod_to_workload: &HashMap<String, String>,
    events: &[k8s_openapi::api::core::v1::Event],
) {
    let cutoff = Utc::now() - chrono::Duration::minutes(EVENT_LOOKBACK_MINUTES);

    for event in events {
        let Some(reason) = event.reason.as_deref() else {
            continue;
        };
        if !HARVEST_EVENT_REASONS.contains(&reason) {
            continue;
        }
        let recent = event
            .last_timestamp
            .as_ref()
            .is_some_and(|t| t.0 >= cutoff);
        if !recent {
            continue;
        }

        let object_name = event.involved_object.name.as_deref().unwrap_or_default();
        let key = pod_to_workload
            .get(object_name)
            .cloned()
            .or_else(|| {
                let stripped = strip_pod_suffix(object_name);
                let candidate = format!("{namespace}/{stripped}");
                state.workloads.contains_key(&candidate).then_some(candidate)
            });
        let Some(key) = key else {
            continue;
        };
        let Some(spike) = state.workloads.get_mut(&key) else {
            continue;
        };

        let message = event.message.as_deref().unwrap_or_default();
        if message.to_lowercase().contains("throttl") {
            spike.throttling_detected = true;
        }
        spike.push_critical_event(truncate_chars(
            &format!("[{reason}] {message}"),
            EVENT_MESSAGE_LIMIT,
        ));
    }
}

/* ============================= PERSISTENCE ============================= */

/// Latch results live under `<home>/.kubenow/latch/`, one JSON file per
/// workload.
pub struct LatchStore {
    dir: PathBuf,
}

impl LatchStore {
    /// Store rooted at the invoking user's home directory.
    pub fn open_default() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self::at(&home.join(".kubenow")))
    }

    /// Store rooted at an explicit directory (used by tests).
    pub fn at(root: &Path) -> Self {
        Self {
            dir: root.join("latch"),
        }
    }

    fn file_for(&self, workload: &WorkloadReference) -> PathBuf {
        self.dir.join(format!("{}.json", workload.latch_file_stem()))
    }

    pub fn save(&self, result: &LatchResult) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create latch store {}", self.dir.display()))?;

        let path = self.file_for(&result.workload);
        let raw = serde_json::to_string_pretty(result).context("failed to render latch result")?;
        std::fs::write(&path, raw)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Load the persisted latch for a workload. A corrupt file is
    /// reported, not silently reset.
    pub fn load(&self, workload: &WorkloadReference) -> anyhow::Result<LatchResult> {
        let path = self.file_for(workload);
        let raw = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "no latch found for {} (expected {})",
                workload.key(),
                path.display()
            )
        })?;
        serde_json::from_str(&raw)
            .with_context(|| format!("latch file {} is corrupt", path.display()))
    }
}

/* ============================= TESTS ============================= */
