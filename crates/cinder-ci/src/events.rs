//! Stage lifecycle events recorded in the run ledger.
//!
//! Events are the ground truth for a run: the gate audit and `cinder runs
//! show` read nothing else. Payloads never carry credentials.

use crate::runner::Artifact;
use crate::stage::FailureKind;
use chrono::Utc;
use cinder_state::RunEvent;
use serde::{Deserialize, Serialize};

/// Bytes of stdout/stderr kept in failure events.
pub const OUTPUT_TAIL_BYTES: usize = 4096;

/// Why a stage did not run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The stage is disabled in the plan.
    Disabled,
    /// An earlier stage failed fatally.
    EarlierFailure,
    /// A stage named in `requires` did not pass. Fails the run.
    RequirementNotMet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageEvent {
    StageStarted {
        stage: String,
        /// argv for command stages
        command: Option<Vec<String>>,
        timeout_secs: u64,
    },

    StagePassed {
        stage: String,
        exit_code: i32,
        duration_ms: u64,
        artifact: Option<Artifact>,
    },

    StageFailed {
        stage: String,
        failure: FailureKind,
        /// Whether the failure halted the pipeline.
        fatal: bool,
        exit_code: i32,
        duration_ms: u64,
        stdout_tail: String,
        stderr_tail: String,
    },

    StageSkipped {
        stage: String,
        reason: SkipReason,
    },
}

impl StageEvent {
    /// Ledger event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StageEvent::StageStarted { .. } => "stage_started",
            StageEvent::StagePassed { .. } => "stage_passed",
            StageEvent::StageFailed { .. } => "stage_failed",
            StageEvent::StageSkipped { .. } => "stage_skipped",
        }
    }

    pub fn stage(&self) -> &str {
        match self {
            StageEvent::StageStarted { stage, .. }
            | StageEvent::StagePassed { stage, .. }
            | StageEvent::StageFailed { stage, .. }
            | StageEvent::StageSkipped { stage, .. } => stage,
        }
    }

    /// Encode as a ledger event with sequence number `seq`.
    pub fn to_run_event(&self, seq: u64) -> serde_json::Result<RunEvent> {
        Ok(RunEvent {
            seq,
            kind: self.kind().to_string(),
            payload: serde_json::to_value(self)?,
            timestamp: Utc::now(),
        })
    }

    /// Decode a ledger event written by [`StageEvent::to_run_event`].
    pub fn from_run_event(event: &RunEvent) -> serde_json::Result<Self> {
        serde_json::from_value(event.payload.clone())
    }
}

/// Last `max` bytes of `s`, cut on a char boundary.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
