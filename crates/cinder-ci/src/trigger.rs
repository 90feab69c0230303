//! Trigger events and branch gating.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of event that can start a pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(TriggerKind::PullRequest),
            other => Err(format!(
                "unknown trigger kind '{}' (expected push or pull_request)",
                other
            )),
        }
    }
}

/// The external signal that asks for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Branch the event targets (base branch for pull requests).
    pub branch: String,

    /// Event kind.
    pub kind: TriggerKind,

    /// Commit to check out; `None` means the repository's HEAD.
    pub commit: Option<String>,
}

impl TriggerEvent {
    pub fn new(branch: impl Into<String>, kind: TriggerKind) -> Self {
        Self {
            branch: branch.into(),
            kind,
            commit: None,
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    /// Build an event from a hosted runner's environment (`GITHUB_*` variables).
    ///
    /// Returns `None` when the variables are not present.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let kind: TriggerKind = lookup("GITHUB_EVENT_NAME")?.parse().ok()?;
        let branch = match kind {
            TriggerKind::PullRequest => lookup("GITHUB_BASE_REF"),
            TriggerKind::Push => lookup("GITHUB_REF_NAME"),
        }
        .filter(|b| !b.is_empty())?;

        Some(Self {
            branch,
            kind,
            commit: lookup("GITHUB_SHA").filter(|s| !s.is_empty()),
        })
    }
}

/// Which events activate the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerFilter {
    /// The single branch name that activates a run.
    pub branch: String,

    /// Event kinds that activate a run.
    pub kinds: Vec<TriggerKind>,
}

impl Default for TriggerFilter {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            kinds: vec![TriggerKind::Push, TriggerKind::PullRequest],
        }
    }
}

impl TriggerFilter {
    /// Whether `event` should start a pipeline run.
    pub fn admits(&self, event: &TriggerEvent) -> bool {
        event.branch == self.branch && self.kinds.contains(&event.kind)
    }

    /// Human-readable reason an event was not admitted.
    pub fn rejection_reason(&self, event: &TriggerEvent) -> Option<String> {
        if event.branch != self.branch {
            Some(format!(
                "branch '{}' does not match '{}'",
                event.branch, self.branch
            ))
        } else if !self.kinds.contains(&event.kind) {
            Some(format!("event '{}' is not enabled", event.kind))
        } else {
            None
        }
    }
}
