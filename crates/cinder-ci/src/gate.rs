//! CI gate evaluation for pass/fail criteria.

use crate::events::{SkipReason, StageEvent};
use cinder_state::RunEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Audit of a recorded run.
pub struct CiGate;

impl CiGate {
    /// Evaluate the event stream of one run.
    ///
    /// Gate rules:
    /// - sequence numbers strictly increase
    /// - every `stage_started` is followed by that stage's `stage_passed` or
    ///   `stage_failed`
    /// - a fatal `stage_failed` fails the gate; an advisory one does not
    /// - no stage starts after a fatal failure
    /// - a stage skipped for an unmet requirement fails the gate
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();

        let mut last_seq: Option<u64> = None;
        let mut open: HashSet<String> = HashSet::new();
        let mut halted_by: Option<String> = None;

        for event in events {
            if let Some(prev) = last_seq {
                if event.seq <= prev {
                    violations.push(format!(
                        "Event seq {} does not follow seq {}",
                        event.seq, prev
                    ));
                }
            }
            last_seq = Some(event.seq);

            let stage_event = match StageEvent::from_run_event(event) {
                Ok(e) => e,
                Err(e) => {
                    violations.push(format!(
                        "Event seq {} ({}) is unreadable: {}",
                        event.seq, event.kind, e
                    ));
                    continue;
                }
            };

            match stage_event {
                StageEvent::StageStarted { stage, .. } => {
                    if let Some(failed) = &halted_by {
                        violations.push(format!(
                            "Stage '{}' started after fatal failure of '{}'",
                            stage, failed
                        ));
                    }
                    open.insert(stage);
                }
                StageEvent::StagePassed { stage, .. } => {
                    if !open.remove(&stage) {
                        violations.push(format!("Stage '{}' passed without starting", stage));
                    }
                }
                StageEvent::StageFailed {
                    stage,
                    failure,
                    fatal,
                    exit_code,
                    ..
                } => {
                    if !open.remove(&stage) {
                        violations.push(format!("Stage '{}' failed without starting", stage));
                    }
                    if fatal {
                        violations.push(format!(
                            "Stage '{}' failed ({}), exit code {}",
                            stage, failure, exit_code
                        ));
                        halted_by.get_or_insert(stage);
                    }
                }
                StageEvent::StageSkipped {
                    stage,
                    reason: SkipReason::RequirementNotMet,
                } => {
                    violations.push(format!(
                        "Stage '{}' could not run: a required stage did not pass",
                        stage
                    ));
                    halted_by.get_or_insert(stage);
                }
                StageEvent::StageSkipped { .. } => {}
            }
        }

        // Stages that were started but never finished
        let mut unfinished: Vec<_> = open.into_iter().collect();
        unfinished.sort();
        for stage in unfinished {
            violations.push(format!("Stage '{}' was started but never completed", stage));
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All stages passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}
