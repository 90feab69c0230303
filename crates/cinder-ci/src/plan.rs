//! Validated, ordered stage sequence.

use crate::error::{CiError, Result};
use crate::stage::{BuiltinStage, StageAction, StageConfig};
use std::collections::HashSet;

/// Ordered list of stages that has passed validation.
///
/// Invariants:
/// - stage names are non-empty and unique
/// - every `requires` entry names a stage that appears earlier
/// - command stages have a non-empty argv
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<StageConfig>,
}

impl StagePlan {
    /// Validate `stages` and freeze their order.
    pub fn new(stages: Vec<StageConfig>) -> Result<Self> {
        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(CiError::InvalidPlan("stage with empty name".to_string()));
            }
            if let StageAction::Command { argv } = &stage.action {
                if argv.is_empty() {
                    return Err(CiError::InvalidPlan(format!(
                        "stage {} has empty command",
                        stage.name
                    )));
                }
            }
            for required in &stage.requires {
                if !seen.contains(required.as_str()) {
                    return Err(CiError::InvalidPlan(format!(
                        "stage {} requires {}, which does not run before it",
                        stage.name, required
                    )));
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(CiError::InvalidPlan(format!(
                    "duplicate stage name {}",
                    stage.name
                )));
            }
        }
        Ok(Self { stages })
    }

    /// The full builtin sequence, checking out `repository`.
    pub fn builtin(repository: &str) -> Self {
        let stages = BuiltinStage::ALL
            .iter()
            .map(|s| StageConfig::from_builtin(*s, repository))
            .collect();
        // Builtin requirements always point backwards.
        Self { stages }
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Ordered stage names.
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Repository the checkout stage clones, if the plan has one.
    pub fn repository(&self) -> Option<&str> {
        self.stages.iter().find_map(|s| match &s.action {
            StageAction::Checkout { repository } => Some(repository.as_str()),
            _ => None,
        })
    }

    /// Apply `f` to the named stage, then re-validate.
    pub fn modify(self, name: &str, f: impl FnOnce(StageConfig) -> StageConfig) -> Result<Self> {
        let mut stages = self.stages;
        let index = stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| CiError::InvalidPlan(format!("unknown stage {}", name)))?;
        let stage = stages.remove(index);
        stages.insert(index, f(stage));
        Self::new(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::FailureKind;

    fn cmd(name: &str) -> StageConfig {
        StageConfig::custom(name, vec!["true".to_string()], FailureKind::Build)
    }

    #[test]
    fn test_builtin_plan_validates() {
        let plan = StagePlan::builtin(".");
        let revalidated = StagePlan::new(plan.stages().to_vec()).expect("builtin plan is valid");
        assert_eq!(revalidated.len(), 9);
        assert_eq!(revalidated.names()[0], "checkout");
        assert_eq!(revalidated.names()[8], "upload_coverage");
        assert_eq!(revalidated.repository(), Some("."));
    }

    #[test]
    fn test_requirement_must_run_earlier() {
        let stages = vec![cmd("build").after("toolchain"), cmd("toolchain")];
        let err = StagePlan::new(stages).unwrap_err();
        assert!(matches!(err, CiError::InvalidPlan(msg) if msg.contains("toolchain")));
    }

    #[test]
    fn test_self_requirement_rejected() {
        let err = StagePlan::new(vec![cmd("loop").after("loop")]).unwrap_err();
        assert!(matches!(err, CiError::InvalidPlan(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = StagePlan::new(vec![cmd("a"), cmd("a")]).unwrap_err();
        assert!(matches!(err, CiError::InvalidPlan(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_empty_command_rejected() {
        let stage = StageConfig::custom("empty", vec![], FailureKind::Build);
        assert!(StagePlan::new(vec![stage]).is_err());
    }

    #[test]
    fn test_modify_keeps_position() {
        let plan = StagePlan::builtin(".")
            .modify("run_tests", |s| s.with_timeout(600))
            .unwrap();
        assert_eq!(plan.names()[6], "run_tests");
        assert_eq!(plan.get("run_tests").unwrap().timeout_secs, 600);
        assert!(StagePlan::builtin(".").modify("nope", |s| s).is_err());
    }
}
