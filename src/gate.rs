use chrono::{DateTime, Utc};
use std::fmt;

use crate::identity::Identity;
use crate::policy::PolicyBounds;
use crate::ratelimit::RateLimitVerdict;
use crate::recommend::AlignmentRecommendation;
use crate::workload::WorkloadKind;

/* ============================= MODE ============================= */

/// What the current invocation is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    ObserveOnly,
    ApplyReady,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::ObserveOnly => "observe",
            ExecutionMode::ApplyReady => "apply-ready",
        };
        f.write_str(s)
    }
}

/* ============================= INPUT ============================= */

/// Everything the gate needs, assembled by the apply command. The gate
/// itself is a pure function of this value.
pub struct ApplyInput<'a> {
    pub mode: ExecutionMode,
    pub recommendation: Option<&'a AlignmentRecommendation>,
    pub policy: Option<&'a PolicyBounds>,
    pub hpa_acknowledged: bool,
    pub latch_timestamp: Option<DateTime<Utc>>,
    pub latch_duration_seconds: Option<f64>,
    pub audit_path_writable: bool,
    pub identity: &'a Identity,
    pub rate_limit: &'a RateLimitVerdict,
    pub workload_kind: WorkloadKind,
    pub now: DateTime<Utc>,
}

/* ============================= CHECK ============================= */

/// Evaluate every apply precondition and return the full ordered list
/// of denial reasons. Checks are not short-circuited so the caller can
/// present everything that is wrong at once. Empty means actionable.
pub fn check_actionable(input: &ApplyInput) -> Vec<String> {
    let mut denials = Vec::new();

    if input.mode != ExecutionMode::ApplyReady {
        denials.push(format!(
            "mode is '{}'; mutation requires apply-ready mode",
            input.mode
        ));
    }

    if input.recommendation.is_none() {
        denials.push("no recommendation available".to_string());
    }

    if input.policy.is_none() {
        denials.push("no policy loaded".to_string());
    }

    if let (Some(rec), Some(policy)) = (input.recommendation, input.policy) {
        if rec.safety > policy.min_safety_rating {
            denials.push(format!(
                "safety rating {} is below the policy floor {}",
                rec.safety, policy.min_safety_rating
            ));
        }
    }

    if let Some(rec) = input.recommendation {
        denials.extend(rec.policy.denial_reasons.iter().cloned());

        if rec.containers.is_empty() {
            denials.push("recommendation contains no container changes".to_string());
        }

        if rec.policy.hpa_detected && !input.hpa_acknowledged {
            let name = rec.policy.hpa_name.as_deref().unwrap_or("unnamed");
            denials.push(format!(
                "HorizontalPodAutoscaler '{name}' targets this workload and was not acknowledged \
                 (pass --ack-hpa to proceed)"
            ));
        }
    }

    if let (Some(policy), Some(ts)) = (input.policy, input.latch_timestamp) {
        let age = (input.now - ts).num_seconds().max(0) as u64;
        if age > policy.max_latch_age_secs {
            denials.push(format!(
                "latch evidence is {age}s old, older than the allowed {}s",
                policy.max_latch_age_secs
            ));
        }
    }

    if let (Some(policy), Some(duration)) = (input.policy, input.latch_duration_seconds) {
        if duration < policy.min_latch_duration_secs as f64 {
            denials.push(format!(
                "latch window was {duration:.0}s, shorter than the required {}s",
                policy.min_latch_duration_secs
            ));
        }
    }

    if !input.audit_path_writable {
        denials.push("audit path is not writable".to_string());
    }

    if !input.identity.is_recorded() {
        denials.push("acting identity could not be resolved".to_string());
    }

    if !input.rate_limit.allowed {
        denials.push(
            input
                .rate_limit
                .denial_reason
                .clone()
                .unwrap_or_else(|| "rate limit exceeded".to_string()),
        );
    }

    if input.workload_kind == WorkloadKind::Pod {
        denials.push(
            "Pod is structurally unpatchable; target the owning controller instead".to_string(),
        );
    }

    denials
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityConfidence, IdentitySource};
    use crate::recommend::{Confidence, ContainerAlignment, PolicyResult, ResourceDelta, SafetyRating};
    use crate::workload::{ContainerResources, WorkloadReference};

    fn make_recommendation(safety: SafetyRating) -> AlignmentRecommendation {
        AlignmentRecommendation {
            workload: WorkloadReference::new(WorkloadKind::Deployment, "web", "prod"),
            timestamp: Utc::now(),
            safety,
            confidence: Confidence::Low,
            containers: vec![ContainerAlignment {
                current: ContainerResources {
                    name: "main".to_string(),
                    ..Default::default()
                },
                recommended: ContainerResources {
                    name: "main".to_string(),
                    cpu_request: 0.1,
                    ..Default::default()
                },
                delta: ResourceDelta::default(),
                capped: false,
                capped_fields: vec![],
            }],
            evidence: None,
            warnings: vec![],
            policy: PolicyResult::default(),
        }
    }

    fn recorded_identity() -> Identity {
        Identity {
            cluster_context: "prod".to_string(),
            cluster_user: "admin".to_string(),
            os_user: "alice".to_string(),
            machine: "laptop".to_string(),
            source: IdentitySource::Kubeconfig,
            confidence: IdentityConfidence::Parsed,
        }
    }

    fn allowed_verdict() -> RateLimitVerdict {
        RateLimitVerdict {
            allowed: true,
            denial_reason: None,
        }
    }

    fn passing_input<'a>(
        rec: &'a AlignmentRecommendation,
        policy: &'a PolicyBounds,
        identity: &'a Identity,
        verdict: &'a RateLimitVerdict,
    ) -> ApplyInput<'a> {
        ApplyInput {
            mode: ExecutionMode::ApplyReady,
            recommendation: Some(rec),
            policy: Some(policy),
            hpa_acknowledged: false,
            latch_timestamp: Some(Utc::now() - chrono::Duration::hours(1)),
            latch_duration_seconds: Some(7200.0),
            audit_path_writable: true,
            identity,
            rate_limit: verdict,
            workload_kind: WorkloadKind::Deployment,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_all_preconditions_met() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let input = passing_input(&rec, &policy, &identity, &verdict);

        assert!(check_actionable(&input).is_empty());
    }

    #[test]
    fn test_observe_mode_denied() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let mut input = passing_input(&rec, &policy, &identity, &verdict);
        input.mode = ExecutionMode::ObserveOnly;

        let denials = check_actionable(&input);
        assert_eq!(denials.len(), 1);
        assert!(denials[0].contains("apply-ready"));
    }

    #[test]
    fn test_missing_recommendation_and_policy() {
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let input = ApplyInput {
            mode: ExecutionMode::ApplyReady,
            recommendation: None,
            policy: None,
            hpa_acknowledged: false,
            latch_timestamp: None,
            latch_duration_seconds: None,
            audit_path_writable: true,
            identity: &identity,
            rate_limit: &verdict,
            workload_kind: WorkloadKind::Deployment,
            now: Utc::now(),
        };

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("no recommendation")));
        assert!(denials.iter().any(|d| d.contains("no policy")));
    }

    #[test]
    fn test_safety_below_floor_denied() {
        let rec = make_recommendation(SafetyRating::Risky);
        let policy = PolicyBounds::default(); // floor = CAUTION
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let input = passing_input(&rec, &policy, &identity, &verdict);

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("policy floor")));
    }

    #[test]
    fn test_inherited_namespace_denials() {
        let mut rec = make_recommendation(SafetyRating::Safe);
        rec.policy
            .denial_reasons
            .push("namespace 'kube-system' is protected from mutation".to_string());
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let input = passing_input(&rec, &policy, &identity, &verdict);

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("kube-system")));
    }

    #[test]
    fn test_empty_containers_denied() {
        let mut rec = make_recommendation(SafetyRating::Safe);
        rec.containers.clear();
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let input = passing_input(&rec, &policy, &identity, &verdict);

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("no container changes")));
    }

    #[test]
    fn test_hpa_unacknowledged_denied() {
        let mut rec = make_recommendation(SafetyRating::Safe);
        rec.policy.hpa_detected = true;
        rec.policy.hpa_name = Some("web-hpa".to_string());
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let input = passing_input(&rec, &policy, &identity, &verdict);

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("web-hpa")));
    }

    #[test]
    fn test_hpa_acknowledged_passes() {
        let mut rec = make_recommendation(SafetyRating::Safe);
        rec.policy.hpa_detected = true;
        rec.policy.hpa_name = Some("web-hpa".to_string());
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let mut input = passing_input(&rec, &policy, &identity, &verdict);
        input.hpa_acknowledged = true;

        assert!(check_actionable(&input).is_empty());
    }

    #[test]
    fn test_stale_latch_denied() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default(); // 7d max age
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let mut input = passing_input(&rec, &policy, &identity, &verdict);
        input.latch_timestamp = Some(Utc::now() - chrono::Duration::days(8));

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("old")));
    }

    #[test]
    fn test_short_latch_denied() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default(); // 1h minimum
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let mut input = passing_input(&rec, &policy, &identity, &verdict);
        input.latch_duration_seconds = Some(900.0);

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("shorter")));
    }

    #[test]
    fn test_unwritable_audit_path_denied() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let mut input = passing_input(&rec, &policy, &identity, &verdict);
        input.audit_path_writable = false;

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("audit path")));
    }

    #[test]
    fn test_unknown_identity_denied() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default();
        let identity = Identity::default();
        let verdict = allowed_verdict();
        let input = passing_input(&rec, &policy, &identity, &verdict);

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("identity")));
    }

    #[test]
    fn test_rate_limit_denial_propagated() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = RateLimitVerdict {
            allowed: false,
            denial_reason: Some("global rate limit exceeded (2/2 applies)".to_string()),
        };
        let input = passing_input(&rec, &policy, &identity, &verdict);

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("global rate limit exceeded")));
    }

    #[test]
    fn test_pod_kind_structurally_blocked() {
        let rec = make_recommendation(SafetyRating::Safe);
        let policy = PolicyBounds::default();
        let identity = recorded_identity();
        let verdict = allowed_verdict();
        let mut input = passing_input(&rec, &policy, &identity, &verdict);
        input.workload_kind = WorkloadKind::Pod;

        let denials = check_actionable(&input);
        assert!(denials.iter().any(|d| d.contains("structurally unpatchable")));
    }

    #[test]
    fn test_all_failures_reported_together() {
        let identity = Identity::default();
        let verdict = RateLimitVerdict {
            allowed: false,
            denial_reason: Some("global rate limit exceeded (1/1)".to_string()),
        };
        let input = ApplyInput {
            mode: ExecutionMode::ObserveOnly,
            recommendation: None,
            policy: None,
            hpa_acknowledged: false,
            latch_timestamp: None,
            latch_duration_seconds: None,
            audit_path_writable: false,
            identity: &identity,
            rate_limit: &verdict,
            workload_kind: WorkloadKind::Pod,
            now: Utc::now(),
        };

        // mode, rec, policy, audit path, identity, rate limit, pod
        let denials = check_actionable(&input);
        assert_eq!(denials.len(), 7);
    }

    #[test]
    fn test_denial_order_starts_with_mode() {
        let identity = Identity::default();
        let verdict = allowed_verdict();
        let input = ApplyInput {
            mode: ExecutionMode::ObserveOnly,
            recommendation: None,
            policy: None,
            hpa_acknowledged: false,
            latch_timestamp: None,
            latch_duration_seconds: None,
            audit_path_writable: true,
            identity: &identity,
            rate_limit: &verdict,
            workload_kind: WorkloadKind::Deployment,
            now: Utc::now(),
        };

        let denials = check_actionable(&input);
        assert!(denials[0].contains("mode"));
    }
}
