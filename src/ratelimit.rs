use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::workload::WorkloadReference;

/* ============================= ERRORS ============================= */

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("timed out acquiring rate-limit lock {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("rate-limit state I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/* ============================= FILE LOCK ============================= */

const LOCK_POLL: Duration = Duration::from_millis(100);
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Advisory lock on `<path>.lock`, linearizing counter updates across
/// processes. On Unix this is a polled non-blocking `flock`; on Windows
/// the exclusively-created lock file itself is the lock.
pub struct FileLock {
    #[cfg(unix)]
    file: fs::File,
    #[cfg(windows)]
    _file: fs::File,
    #[cfg(windows)]
    path: PathBuf,
}

#[cfg(unix)]
impl FileLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, RateLimitError> {
        use fs2::FileExt;

        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_POLL),
                Err(_) => return Err(RateLimitError::LockTimeout(lock_path.to_path_buf())),
            }
        }
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        use fs2::FileExt;
        let _ = self.file.unlock();
    }
}

#[cfg(windows)]
impl FileLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, RateLimitError> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(file) => {
                    return Ok(Self {
                        _file: file,
                        path: lock_path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(RateLimitError::LockTimeout(lock_path.to_path_buf()));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(windows)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/* ============================= STATE ============================= */

/// Configuration for the tumbling-window counters. A max of 0 means
/// unlimited: entries are still recorded but nothing is denied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub max_global: u32,
    pub max_per_workload: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_global: 10,
            max_per_workload: 3,
            window: Duration::from_secs(3600),
        }
    }
}

/// One recorded admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub timestamp: DateTime<Utc>,
    pub workload: String,
    pub user: String,
}

/// Persisted counter state. `window_start` is unix seconds; 0 means the
/// window has never been opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RateLimitState {
    pub window_start: i64,
    pub window_secs: u64,
    pub count: u32,
    pub entries: Vec<RateLimitEntry>,
}

/// Outcome of a rate-limit consultation.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitVerdict {
    pub allowed: bool,
    pub denial_reason: Option<String>,
}

impl RateLimitVerdict {
    fn allowed() -> Self {
        Self {
            allowed: true,
            denial_reason: None,
        }
    }

    fn denied(reason: String) -> Self {
        Self {
            allowed: false,
            denial_reason: Some(reason),
        }
    }
}

/* ============================= RATE LIMITER ============================= */

/// Tumbling-window rate limiter backed by JSON files under
/// `<audit_path>/.ratelimit/`: one cluster-wide counter plus one per
/// workload UID.
pub struct RateLimiter {
    dir: PathBuf,
}

impl RateLimiter {
    pub fn new(audit_path: &Path) -> Self {
        Self {
            dir: audit_path.join(".ratelimit"),
        }
    }

    fn cluster_file(&self) -> PathBuf {
        self.dir.join("cluster.json")
    }

    fn workload_file(&self, uid: &str) -> PathBuf {
        self.dir.join(format!("{uid}.json"))
    }

    /// Atomically check both counters and increment them on admission.
    ///
    /// The global counter is consumed first; a global denial leaves the
    /// per-workload counter untouched. A workload without a UID only
    /// consults the global counter.
    pub fn check_and_increment(
        &self,
        config: &RateLimitConfig,
        workload_uid: Option<&str>,
        workload: &WorkloadReference,
        user: &str,
    ) -> Result<RateLimitVerdict, RateLimitError> {
        fs::create_dir_all(&self.dir)?;

        let entry = RateLimitEntry {
            timestamp: Utc::now(),
            workload: workload.key(),
            user: user.to_string(),
        };

        if let Some(reason) = consume(
            &self.cluster_file(),
            "global",
            config.max_global,
            config.window,
            &entry,
        )? {
            return Ok(RateLimitVerdict::denied(reason));
        }

        if let Some(uid) = workload_uid {
            if let Some(reason) = consume(
                &self.workload_file(uid),
                "per-workload",
                config.max_per_workload,
                config.window,
                &entry,
            )? {
                return Ok(RateLimitVerdict::denied(reason));
            }
        }

        Ok(RateLimitVerdict::allowed())
    }

    /// Inspect the counters without consuming them. Fails open on any
    /// read problem.
    pub fn peek(&self, config: &RateLimitConfig, workload_uid: Option<&str>) -> RateLimitVerdict {
        if let Some(reason) = peek_file(&self.cluster_file(), "global", config.max_global) {
            return RateLimitVerdict::denied(reason);
        }
        if let Some(uid) = workload_uid {
            if let Some(reason) = peek_file(
                &self.workload_file(uid),
                "per-workload",
                config.max_per_workload,
            ) {
                return RateLimitVerdict::denied(reason);
            }
        }
        RateLimitVerdict::allowed()
    }
}

/* ============================= COUNTER PROTOCOL ============================= */

/// Run one check-and-increment pass against a single counter file.
/// Returns `Some(reason)` on denial, `None` on admission.
fn consume(
    path: &Path,
    scope: &str,
    max: u32,
    window: Duration,
    entry: &RateLimitEntry,
) -> Result<Option<String>, RateLimitError> {
    let lock_path = path.with_extension("json.lock");
    let _lock = FileLock::acquire(&lock_path)?;

    let mut state = read_state(path);
    let now = Utc::now().timestamp();

    if state.window_start == 0 || now > state.window_start + state.window_secs as i64 {
        state = RateLimitState {
            window_start: now,
            window_secs: window.as_secs(),
            count: 0,
            entries: Vec::new(),
        };
    }

    if max > 0 && state.count >= max {
        return Ok(Some(format!(
            "{scope} rate limit exceeded ({}/{} applies in the current {}s window)",
            state.count,
            max,
            state.window_secs
        )));
    }

    state.count += 1;
    state.entries.push(entry.clone());
    write_state(path, &state)?;

    Ok(None)
}

fn peek_file(path: &Path, scope: &str, max: u32) -> Option<String> {
    if max == 0 {
        return None;
    }
    let raw = fs::read_to_string(path).ok()?;
    let state: RateLimitState = serde_json::from_str(&raw).ok()?;

    let now = Utc::now().timestamp();
    let window_active =
        state.window_start != 0 && now <= state.window_start + state.window_secs as i64;

    if window_active && state.count >= max {
        Some(format!(
            "{scope} rate limit exceeded ({}/{} applies in the current {}s window)",
            state.count, max, state.window_secs
        ))
    } else {
        None
    }
}

/// Missing file yields an empty state; corrupt state is silently reset
/// (one warning log).
fn read_state(path: &Path) -> RateLimitState {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ratelimit_state_corrupt_resetting");
                RateLimitState::default()
            }
        },
        Err(_) => RateLimitState::default(),
    }
}

fn write_state(path: &Path, state: &RateLimitState) -> Result<(), RateLimitError> {
    let raw = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;
    fs::write(path, raw)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/* ============================= TESTS ============================= */
