use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::recommend::SafetyRating;

/* ============================= DEFAULTS ============================= */

const DEFAULT_MAX_REQUEST_DELTA: f64 = 50.0;
const DEFAULT_MAX_LIMIT_DELTA: f64 = 100.0;
const DEFAULT_MAX_LATCH_AGE_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_MIN_LATCH_DURATION_SECS: u64 = 3600;

fn default_max_request_delta() -> f64 {
    DEFAULT_MAX_REQUEST_DELTA
}
fn default_max_limit_delta() -> f64 {
    DEFAULT_MAX_LIMIT_DELTA
}
fn default_min_safety_rating() -> SafetyRating {
    SafetyRating::Caution
}
fn default_max_latch_age_secs() -> u64 {
    DEFAULT_MAX_LATCH_AGE_SECS
}
fn default_min_latch_duration_secs() -> u64 {
    DEFAULT_MIN_LATCH_DURATION_SECS
}

/* ============================= POLICY BOUNDS ============================= */

/// Admin guardrails for recommendations and applies.
///
/// Loaded from a YAML or JSON file; omitted fields take the defaults.
/// Passed to the engine as plain immutable data so the engine stays pure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyBounds {
    /// Largest allowed percent change on a request field.
    pub max_request_delta_percent: f64,

    /// Largest allowed percent change on a limit field.
    pub max_limit_delta_percent: f64,

    /// When false, a recommended limit below the current limit is
    /// pinned back to the current limit.
    pub allow_limit_decrease: bool,

    /// Worst safety rating that may still produce containers / be applied.
    pub min_safety_rating: SafetyRating,

    /// Oldest latch evidence an apply will accept, in seconds.
    pub max_latch_age_secs: u64,

    /// Shortest latch window an apply will accept, in seconds.
    pub min_latch_duration_secs: u64,
}

impl Default for PolicyBounds {
    fn default() -> Self {
        Self {
            max_request_delta_percent: default_max_request_delta(),
            max_limit_delta_percent: default_max_limit_delta(),
            allow_limit_decrease: false,
            min_safety_rating: default_min_safety_rating(),
            max_latch_age_secs: default_max_latch_age_secs(),
            min_latch_duration_secs: default_min_latch_duration_secs(),
        }
    }
}

impl PolicyBounds {
    /// Load bounds from a YAML (or JSON) policy file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        let bounds: PolicyBounds = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse policy file {}", path.display()))?;
        Ok(bounds)
    }
}

/* ============================= TESTS ============================= */
