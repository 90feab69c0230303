//! CI stage execution.

use crate::environment::Environment;
use crate::error::{CiError, Result};
use crate::stage::StageConfig;
use cinder_state::ContentDigest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tracing::debug;

/// File a stage left behind for later stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Absolute path inside the environment.
    pub path: PathBuf,

    /// SHA-256 of the file contents.
    pub digest: ContentDigest,

    /// Size in bytes.
    pub size_bytes: u64,
}

impl Artifact {
    /// Hash the file at `path`. Fails if it does not exist.
    pub async fn capture(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            digest: ContentDigest::from_bytes(&bytes),
            size_bytes: bytes.len() as u64,
        })
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code (0 = success, -1 = never ran to completion).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,

    /// Artifact the stage produced, if it declares one.
    pub artifact: Option<Artifact>,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// A failed result for a stage that could not run to completion.
    pub fn errored(stage_name: &str, error: &CiError, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: error.to_string(),
            duration_ms,
            success: false,
            artifact: None,
        }
    }
}

/// Output of one child process.
#[derive(Debug)]
struct ProcessOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
    success: bool,
}

/// CI stage runner that executes external processes inside an environment.
pub struct CiRunner;

impl CiRunner {
    /// Execute a command stage and return the result.
    ///
    /// A non-zero exit is a failed `StageResult`; spawn errors and timeouts
    /// are returned as `Err`.
    pub async fn execute_command(
        config: &StageConfig,
        argv: &[String],
        env: &Environment,
    ) -> Result<StageResult> {
        let start = Instant::now();

        let output = Self::run_process(config, argv, env).await?;
        let mut result = StageResult {
            stage_name: config.name.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: 0,
            success: output.success,
            artifact: None,
        };

        if result.passed() {
            if let Some(produces) = &config.produces {
                Self::attach_artifact(config, produces, env, &mut result).await;
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Clone `repository` into the environment and detach at `revision`.
    pub async fn checkout(
        config: &StageConfig,
        repository: &str,
        revision: Option<&str>,
        env: &Environment,
    ) -> Result<StageResult> {
        let start = Instant::now();

        let clone: Vec<String> = ["git", "clone", "--quiet", repository, "."]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cloned = Self::run_process(config, &clone, env).await?;

        let mut stdout = cloned.stdout;
        let mut stderr = cloned.stderr;
        let mut exit_code = cloned.exit_code;
        let mut success = cloned.success;

        if success {
            let revision = revision.unwrap_or("HEAD");
            let detach: Vec<String> = ["git", "checkout", "--quiet", "--detach", revision]
                .iter()
                .map(|s| s.to_string())
                .collect();
            let checked_out = Self::run_process(config, &detach, env).await?;
            stdout.push_str(&checked_out.stdout);
            stderr.push_str(&checked_out.stderr);
            exit_code = checked_out.exit_code;
            success = checked_out.success;
        }

        Ok(StageResult {
            stage_name: config.name.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
            success,
            artifact: None,
        })
    }

    async fn attach_artifact(
        config: &StageConfig,
        produces: &Path,
        env: &Environment,
        result: &mut StageResult,
    ) {
        let path = env.resolve(produces);
        match Artifact::capture(&path).await {
            Ok(artifact) => {
                debug!(stage = %config.name, digest = %artifact.digest.short(), "Captured artifact");
                result.artifact = Some(artifact);
            }
            Err(_) => {
                let err = CiError::MissingArtifact {
                    stage: config.name.clone(),
                    path: path.display().to_string(),
                };
                result.success = false;
                if !result.stderr.is_empty() && !result.stderr.ends_with('\n') {
                    result.stderr.push('\n');
                }
                result.stderr.push_str(&err.to_string());
            }
        }
    }

    async fn run_process(
        config: &StageConfig,
        argv: &[String],
        env: &Environment,
    ) -> Result<ProcessOutput> {
        // Validate command
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| CiError::InvalidPlan(format!("Stage {} has empty command", config.name)))?;

        debug!(stage = %config.name, command = ?argv, "Spawning stage process");

        let child = env
            .command(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CiError::Spawn {
                stage: config.name.clone(),
                program: exe.clone(),
                source,
            })?;

        let output = if config.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| CiError::Timeout {
                stage: config.name.clone(),
                timeout_secs: config.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }
}
