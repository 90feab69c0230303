//! Run specification and identity.

use crate::plan::StagePlan;
use crate::trigger::{TriggerEvent, TriggerKind};
use cinder_state::ContentDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a pipeline run.
///
/// Two runs of the same commit with the same plan share a digest, which is
/// how the ledger groups repeated runs of one revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    /// Pipeline name.
    pub pipeline: String,

    /// Repository the run checks out ("local" when running in place).
    pub repository: String,

    /// Commit SHA, if the trigger named one.
    pub revision: Option<String>,

    /// Branch the trigger targeted.
    pub branch: String,

    /// Trigger kind.
    pub trigger: TriggerKind,

    /// SHA-256 digest of ordered stage names and actions (deterministic).
    pub stages_digest: String,
}

impl RunSpec {
    /// Create a run specification for `trigger` executing `plan`.
    pub fn new(pipeline: &str, trigger: &TriggerEvent, plan: &StagePlan) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            repository: plan.repository().unwrap_or("local").to_string(),
            revision: trigger.commit.clone(),
            branch: trigger.branch.clone(),
            trigger: trigger.kind,
            stages_digest: compute_stages_digest(plan),
        }
    }

    /// Content digest of the whole specification.
    pub fn digest(&self) -> ContentDigest {
        // Field order is fixed by the struct definition, so this is stable.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        ContentDigest::from_bytes(&canonical)
    }
}

/// Compute deterministic digest of ordered stage names and invocations.
fn compute_stages_digest(plan: &StagePlan) -> String {
    let mut hasher = Sha256::new();
    for stage in plan.stages() {
        hasher.update(stage.name.as_bytes());
        hasher.update(b"\0");
        if let Ok(action) = serde_json::to_vec(&stage.action) {
            hasher.update(&action);
        }
        hasher.update(if stage.enabled { b"1" } else { b"0" });
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{FailureKind, StageConfig};

    fn plan(names: &[&str]) -> StagePlan {
        StagePlan::new(
            names
                .iter()
                .map(|n| StageConfig::custom(*n, vec!["true".to_string()], FailureKind::Build))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_run_spec_new() {
        let trigger = TriggerEvent::new("main", TriggerKind::Push).with_commit("abc123");
        let spec = RunSpec::new("ci", &trigger, &StagePlan::builtin("https://example.com/r.git"));

        assert_eq!(spec.repository, "https://example.com/r.git");
        assert_eq!(spec.revision.as_deref(), Some("abc123"));
        assert_eq!(spec.branch, "main");
        assert!(!spec.stages_digest.is_empty());
    }

    #[test]
    fn test_digest_deterministic() {
        let trigger = TriggerEvent::new("main", TriggerKind::Push).with_commit("abc123");
        let a = RunSpec::new("ci", &trigger, &plan(&["fmt", "check"]));
        let b = RunSpec::new("ci", &trigger, &plan(&["fmt", "check"]));
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_stages_digest_order_sensitive() {
        let d1 = compute_stages_digest(&plan(&["fmt", "check"]));
        let d2 = compute_stages_digest(&plan(&["check", "fmt"]));
        assert_ne!(d1, d2);
    }

    #[test]
    fn test_digest_changes_with_commit() {
        let p = plan(&["fmt"]);
        let a = RunSpec::new("ci", &TriggerEvent::new("main", TriggerKind::Push).with_commit("a"), &p);
        let b = RunSpec::new("ci", &TriggerEvent::new("main", TriggerKind::Push).with_commit("b"), &p);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_plan_without_checkout_is_local() {
        let spec = RunSpec::new("ci", &TriggerEvent::new("main", TriggerKind::Push), &plan(&["fmt"]));
        assert_eq!(spec.repository, "local");
    }
}
