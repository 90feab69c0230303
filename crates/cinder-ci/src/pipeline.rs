//! CI pipeline orchestration and run recording.

use crate::environment::{Environment, EnvironmentSpec};
use crate::error::{CiError, Result};
use crate::events::{tail, SkipReason, StageEvent, OUTPUT_TAIL_BYTES};
use crate::plan::StagePlan;
use crate::runner::{CiRunner, StageResult};
use crate::secret::Secret;
use crate::spec::RunSpec;
use crate::stage::{FailureKind, FailurePolicy, StageAction, StageConfig};
use crate::trigger::{TriggerEvent, TriggerFilter};
use crate::upload::{CoverageUploader, UploadError, UploadRequest};
use cinder_state::{ContentDigest, RunId, RunLedger, RunMetadata, RunSummary, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pipeline name recorded in run metadata.
pub const DEFAULT_PIPELINE_NAME: &str = "cinder";

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// The trigger did not match the filter; nothing ran.
    Skipped { reason: String },

    /// Every executed stage passed (advisory failures aside).
    Passed,

    /// A fatal stage failure halted the pipeline.
    Failed { stage: String, kind: FailureKind },
}

impl PipelineOutcome {
    /// Process exit code reported to the triggering platform.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Skipped { .. } | PipelineOutcome::Passed => 0,
            PipelineOutcome::Failed { .. } => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
            PipelineOutcome::Passed => f.write_str("passed"),
            PipelineOutcome::Failed { stage, kind } => write!(f, "{} in stage {}", kind, stage),
        }
    }
}

/// Result of a complete CI pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Ledger run, absent when the trigger was skipped.
    pub run_id: Option<RunId>,

    pub outcome: PipelineOutcome,

    /// Results of the stages that executed, in order.
    pub stages: Vec<StageResult>,

    /// Stages that did not execute.
    pub skipped: Vec<String>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// Digest of the run specification.
    pub spec_digest: ContentDigest,
}

impl PipelineResult {
    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of stages that failed.
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }

    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Appends stage events to one ledger run and collects stage results.
struct RunProgress {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    seq: u64,
    stages: Vec<StageResult>,
    skipped: Vec<String>,
    /// Stages whose requirements are met for later stages.
    satisfied: HashSet<String>,
    /// Last stage that started.
    current: Option<String>,
    failure: Option<(String, FailureKind)>,
}

impl RunProgress {
    fn new(ledger: Arc<dyn RunLedger>, run_id: RunId) -> Self {
        Self {
            ledger,
            run_id,
            seq: 0,
            stages: Vec::new(),
            skipped: Vec::new(),
            satisfied: HashSet::new(),
            current: None,
            failure: None,
        }
    }

    async fn record(&mut self, event: StageEvent) -> Result<()> {
        let seq = self.seq + 1;
        let run_event = event.to_run_event(seq).map_err(StorageError::from)?;
        self.ledger.append_event(&self.run_id, run_event).await?;
        self.seq = seq;
        Ok(())
    }

    async fn skip(&mut self, stage: &str, reason: SkipReason) -> Result<()> {
        info!(stage = %stage, reason = ?reason, "Skipping stage");
        self.skipped.push(stage.to_string());
        self.record(StageEvent::StageSkipped {
            stage: stage.to_string(),
            reason,
        })
        .await
    }

    /// Refuse to run `config` because `missing` did not pass. Halts the run.
    async fn unmet(&mut self, config: &StageConfig, missing: &str) -> Result<()> {
        error!(stage = %config.name, requires = %missing, "Required stage did not pass");
        self.failure = Some((config.name.clone(), FailureKind::Infrastructure));
        self.skip(&config.name, SkipReason::RequirementNotMet).await
    }

    async fn started(&mut self, config: &StageConfig) -> Result<()> {
        info!(stage = %config.name, "Executing stage");
        self.current = Some(config.name.clone());
        self.record(StageEvent::StageStarted {
            stage: config.name.clone(),
            command: config.argv().map(<[String]>::to_vec),
            timeout_secs: config.timeout_secs,
        })
        .await
    }

    /// Record the terminal event for `result`. A fatal failure halts the run.
    async fn finished(
        &mut self,
        result: StageResult,
        kind: FailureKind,
        policy: FailurePolicy,
    ) -> Result<()> {
        if result.passed() {
            info!(stage = %result.stage_name, duration_ms = result.duration_ms, "Stage passed");
            self.record(StageEvent::StagePassed {
                stage: result.stage_name.clone(),
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
                artifact: result.artifact.clone(),
            })
            .await?;
            self.satisfied.insert(result.stage_name.clone());
        } else {
            let fatal = policy == FailurePolicy::Fatal;
            if fatal {
                error!(stage = %result.stage_name, exit_code = result.exit_code, kind = %kind, "Stage failed");
                self.failure = Some((result.stage_name.clone(), kind));
            } else {
                warn!(stage = %result.stage_name, exit_code = result.exit_code, kind = %kind, "Advisory stage failed; continuing");
            }
            self.record(StageEvent::StageFailed {
                stage: result.stage_name.clone(),
                failure: kind,
                fatal,
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
                stdout_tail: tail(&result.stdout, OUTPUT_TAIL_BYTES),
                stderr_tail: tail(&result.stderr, OUTPUT_TAIL_BYTES),
            })
            .await?;
        }
        self.stages.push(result);
        Ok(())
    }

    fn halted(&self) -> bool {
        self.failure.is_some()
    }

    /// Stage to blame in the summary of a run that did not pass.
    fn failed_stage(&self) -> Option<String> {
        self.failure
            .as_ref()
            .map(|(stage, _)| stage.clone())
            .or_else(|| self.current.clone())
    }
}

/// CI pipeline orchestrator.
pub struct CiPipeline {
    ledger: Arc<dyn RunLedger>,
    uploader: Arc<dyn CoverageUploader>,
    name: String,
}

impl CiPipeline {
    pub fn new(ledger: Arc<dyn RunLedger>, uploader: Arc<dyn CoverageUploader>) -> Self {
        Self {
            ledger,
            uploader,
            name: DEFAULT_PIPELINE_NAME.to_string(),
        }
    }

    /// Set the pipeline name recorded with each run.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Execute `plan` for `trigger` and record every stage transition.
    ///
    /// Each enabled stage produces one `stage_started` event followed by
    /// `stage_passed` or `stage_failed`. After a fatal failure, and for
    /// disabled stages, a `stage_skipped` event is recorded instead. A stage
    /// whose `requires` names a stage that did not pass is skipped with
    /// `requirement_not_met` and fails the run. The run is closed as
    /// Completed when the outcome is `Passed`, Failed otherwise.
    ///
    /// `Err` is reserved for ledger failures; stage failures are reported
    /// through the outcome. A run that hits a ledger failure is still closed
    /// as Failed when the ledger allows it.
    pub async fn run(
        &self,
        trigger: &TriggerEvent,
        filter: &TriggerFilter,
        plan: &StagePlan,
        env_spec: &EnvironmentSpec,
    ) -> Result<PipelineResult> {
        let start = Instant::now();
        let run_spec = RunSpec::new(&self.name, trigger, plan);
        let spec_digest = run_spec.digest();

        if let Some(reason) = filter.rejection_reason(trigger) {
            info!(branch = %trigger.branch, event = %trigger.kind, reason = %reason, "Trigger not admitted; no stages run");
            return Ok(PipelineResult {
                run_id: None,
                outcome: PipelineOutcome::Skipped { reason },
                stages: Vec::new(),
                skipped: plan.names(),
                duration_ms: start.elapsed().as_millis() as u64,
                spec_digest,
            });
        }

        let metadata = RunMetadata {
            revision: trigger.commit.clone(),
            pipeline: self.name.clone(),
            tags: json!({
                "trigger": trigger.kind.as_str(),
                "branch": &trigger.branch,
                "repository": &run_spec.repository,
                "stages": plan.names(),
            }),
        };
        let run_id = self.ledger.create_run(&spec_digest, metadata).await?;
        info!(run_id = %run_id, digest = %spec_digest.short(), "Starting CI pipeline");

        let mut progress = RunProgress::new(self.ledger.clone(), run_id.clone());
        if let Err(err) = self
            .execute_plan(&mut progress, trigger, plan, env_spec)
            .await
        {
            error!(run_id = %run_id, error = %err, "Recording failed; closing run as failed");
            let summary = RunSummary {
                total_events: progress.seq,
                duration_ms: start.elapsed().as_millis() as u64,
                success: false,
                failed_stage: progress.failed_stage(),
            };
            if let Err(close_err) = self.ledger.fail_run(&run_id, summary).await {
                warn!(run_id = %run_id, error = %close_err, "Could not close run");
            }
            return Err(err);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match progress.failure.take() {
            Some((stage, kind)) => PipelineOutcome::Failed { stage, kind },
            None => PipelineOutcome::Passed,
        };

        let failed_stage = match &outcome {
            PipelineOutcome::Failed { stage, .. } => Some(stage.clone()),
            _ => None,
        };
        let summary = RunSummary {
            total_events: progress.seq,
            duration_ms,
            success: outcome.is_success(),
            failed_stage,
        };

        if outcome.is_success() {
            self.ledger.complete_run(&run_id, summary).await?;
            info!(run_id = %run_id, duration_ms, "CI pipeline completed successfully");
        } else {
            self.ledger.fail_run(&run_id, summary).await?;
            info!(run_id = %run_id, duration_ms, outcome = %outcome, "CI pipeline failed");
        }

        Ok(PipelineResult {
            run_id: Some(run_id),
            outcome,
            stages: progress.stages,
            skipped: progress.skipped,
            duration_ms,
            spec_digest,
        })
    }

    /// Provision the environment and walk the plan, recording each stage.
    async fn execute_plan(
        &self,
        progress: &mut RunProgress,
        trigger: &TriggerEvent,
        plan: &StagePlan,
        env_spec: &EnvironmentSpec,
    ) -> Result<()> {
        let env = match Environment::provision(env_spec) {
            Ok(env) => env,
            Err(err) => {
                error!(error = %err, "Environment provisioning failed");
                // Reported as an infrastructure failure of the first stage.
                let mut stages = plan.stages().iter();
                for config in stages.by_ref() {
                    if !config.enabled {
                        progress.skip(&config.name, SkipReason::Disabled).await?;
                        continue;
                    }
                    progress.started(config).await?;
                    let result = StageResult::errored(&config.name, &err, 0);
                    progress
                        .finished(result, FailureKind::Infrastructure, FailurePolicy::Fatal)
                        .await?;
                    break;
                }
                for config in stages {
                    progress.skip(&config.name, SkipReason::EarlierFailure).await?;
                }
                return Ok(());
            }
        };

        for config in plan.stages() {
            if progress.halted() {
                progress.skip(&config.name, SkipReason::EarlierFailure).await?;
                continue;
            }
            if !config.enabled {
                progress.skip(&config.name, SkipReason::Disabled).await?;
                // An in-place workspace is already checked out.
                if matches!(config.action, StageAction::Checkout { .. }) && !env.is_ephemeral() {
                    progress.satisfied.insert(config.name.clone());
                }
                continue;
            }
            if let Some(missing) = config
                .requires
                .iter()
                .find(|r| !progress.satisfied.contains(r.as_str()))
            {
                progress.unmet(config, missing).await?;
                continue;
            }

            progress.started(config).await?;
            let result = self.execute_stage(config, trigger, &env).await;
            progress.finished(result, config.kind, config.policy).await?;
        }

        // Ephemeral environments take their artifacts with them on drop;
        // in-place runs remove them explicitly.
        if !env.is_ephemeral() {
            for path in plan.stages().iter().filter_map(|c| c.produces.as_deref()) {
                env.discard(path);
            }
        }
        Ok(())
    }

    /// Run one stage. Execution errors become a failed result.
    async fn execute_stage(
        &self,
        config: &StageConfig,
        trigger: &TriggerEvent,
        env: &Environment,
    ) -> StageResult {
        let start = Instant::now();
        let outcome = match &config.action {
            StageAction::Command { argv } => CiRunner::execute_command(config, argv, env).await,
            StageAction::Checkout { repository } => {
                CiRunner::checkout(config, repository, trigger.commit.as_deref(), env).await
            }
            StageAction::UploadCoverage { report, token_env } => {
                self.upload(config, report, token_env.as_deref(), trigger, env)
                    .await
            }
        };

        outcome.unwrap_or_else(|err| {
            warn!(stage = %config.name, error = %err, "Stage could not run to completion");
            StageResult::errored(&config.name, &err, start.elapsed().as_millis() as u64)
        })
    }

    async fn upload(
        &self,
        config: &StageConfig,
        report: &Path,
        token_env: Option<&str>,
        trigger: &TriggerEvent,
        env: &Environment,
    ) -> Result<StageResult> {
        let start = Instant::now();

        let path = env.resolve(report);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| UploadError::ReportMissing {
                path: path.display().to_string(),
            })?;

        // Acquired here and dropped with the request.
        let token = match token_env {
            Some(var) => Some(Secret::from_env(var).ok_or_else(|| UploadError::MissingToken {
                var: var.to_string(),
            })?),
            None => None,
        };

        let request = UploadRequest {
            report_name: report
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| report.display().to_string()),
            report: bytes,
            commit: trigger.commit.clone(),
            branch: trigger.branch.clone(),
            token,
        };

        info!(stage = %config.name, service = %self.uploader.name(), bytes = request.report.len(), "Uploading coverage report");
        let receipt = if config.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(config.timeout_secs),
                self.uploader.upload(&request),
            )
            .await
            .map_err(|_| CiError::Timeout {
                stage: config.name.clone(),
                timeout_secs: config.timeout_secs,
            })??
        } else {
            self.uploader.upload(&request).await?
        };

        Ok(StageResult {
            stage_name: config.name.clone(),
            exit_code: 0,
            stdout: format!(
                "Uploaded {} bytes to {}\n",
                receipt.bytes, receipt.report_url
            ),
            stderr: String::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: true,
            artifact: None,
        })
    }
}
