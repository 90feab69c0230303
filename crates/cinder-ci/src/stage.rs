//! CI stage definitions and configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default location of the coverage report, relative to the environment root.
pub const DEFAULT_COVERAGE_REPORT: &str = "lcov.info";

/// Builtin pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// git clone + detached checkout of the triggering commit
    Checkout,

    /// rustup update stable
    ToolchainInstall,

    /// ./scripts/build_tests.sh
    BuildTestProjects,

    /// ./scripts/download_pocket_ic.sh
    InstallPocketIc,

    /// ./scripts/install_wasi2ic.sh
    InstallWasi2ic,

    /// cargo install cargo-llvm-cov
    InstallCoverageTool,

    /// cargo test --verbose
    RunTests,

    /// cargo llvm-cov --all-features --workspace --lcov --output-path lcov.info
    GenerateCoverage,

    /// Upload lcov.info to the coverage service
    UploadCoverage,
}

impl BuiltinStage {
    /// Every builtin stage in execution order.
    pub const ALL: [BuiltinStage; 9] = [
        BuiltinStage::Checkout,
        BuiltinStage::ToolchainInstall,
        BuiltinStage::BuildTestProjects,
        BuiltinStage::InstallPocketIc,
        BuiltinStage::InstallWasi2ic,
        BuiltinStage::InstallCoverageTool,
        BuiltinStage::RunTests,
        BuiltinStage::GenerateCoverage,
        BuiltinStage::UploadCoverage,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::Checkout => "checkout",
            BuiltinStage::ToolchainInstall => "toolchain_install",
            BuiltinStage::BuildTestProjects => "build_test_projects",
            BuiltinStage::InstallPocketIc => "install_pocket_ic",
            BuiltinStage::InstallWasi2ic => "install_wasi2ic",
            BuiltinStage::InstallCoverageTool => "install_coverage_tool",
            BuiltinStage::RunTests => "run_tests",
            BuiltinStage::GenerateCoverage => "generate_coverage",
            BuiltinStage::UploadCoverage => "upload_coverage",
        }
    }

    /// Look up a builtin stage by its name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Error class a failure of this stage is reported as.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BuiltinStage::Checkout
            | BuiltinStage::ToolchainInstall
            | BuiltinStage::InstallPocketIc
            | BuiltinStage::InstallWasi2ic
            | BuiltinStage::InstallCoverageTool => FailureKind::Infrastructure,
            BuiltinStage::BuildTestProjects => FailureKind::Build,
            BuiltinStage::RunTests => FailureKind::Test,
            BuiltinStage::GenerateCoverage => FailureKind::Coverage,
            BuiltinStage::UploadCoverage => FailureKind::Upload,
        }
    }

    /// Get the stage's command, for stages that run an external process.
    pub fn command(&self) -> Option<Vec<String>> {
        let argv: &[&str] = match self {
            BuiltinStage::Checkout | BuiltinStage::UploadCoverage => return None,
            BuiltinStage::ToolchainInstall => &["rustup", "update", "stable"],
            BuiltinStage::BuildTestProjects => &["./scripts/build_tests.sh"],
            BuiltinStage::InstallPocketIc => &["./scripts/download_pocket_ic.sh"],
            BuiltinStage::InstallWasi2ic => &["./scripts/install_wasi2ic.sh"],
            BuiltinStage::InstallCoverageTool => {
                &["cargo", "install", "cargo-llvm-cov", "--locked"]
            }
            BuiltinStage::RunTests => &["cargo", "test", "--verbose"],
            BuiltinStage::GenerateCoverage => &[
                "cargo",
                "llvm-cov",
                "--all-features",
                "--workspace",
                "--lcov",
                "--output-path",
                DEFAULT_COVERAGE_REPORT,
            ],
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }

    /// Stages that must have finished before this one may start.
    pub fn requires(&self) -> &'static [BuiltinStage] {
        match self {
            BuiltinStage::Checkout => &[],
            BuiltinStage::ToolchainInstall
            | BuiltinStage::InstallPocketIc
            | BuiltinStage::InstallWasi2ic => &[BuiltinStage::Checkout],
            BuiltinStage::BuildTestProjects | BuiltinStage::InstallCoverageTool => {
                &[BuiltinStage::ToolchainInstall]
            }
            BuiltinStage::RunTests => &[
                BuiltinStage::ToolchainInstall,
                BuiltinStage::BuildTestProjects,
                BuiltinStage::InstallPocketIc,
                BuiltinStage::InstallWasi2ic,
            ],
            BuiltinStage::GenerateCoverage => {
                &[BuiltinStage::RunTests, BuiltinStage::InstallCoverageTool]
            }
            BuiltinStage::UploadCoverage => &[BuiltinStage::GenerateCoverage],
        }
    }

    /// Artifact path the stage must leave behind on success.
    pub fn produces(&self) -> Option<PathBuf> {
        match self {
            BuiltinStage::GenerateCoverage => Some(PathBuf::from(DEFAULT_COVERAGE_REPORT)),
            _ => None,
        }
    }
}

/// Failure taxonomy surfaced to the triggering platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Checkout, toolchain, or tool downloads
    Infrastructure,
    /// Fixture build script
    Build,
    /// One or more test cases failed
    Test,
    /// Instrumented coverage run failed after tests passed
    Coverage,
    /// Coverage report transmission failed
    Upload,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Infrastructure => "infrastructure failure",
            FailureKind::Build => "build failure",
            FailureKind::Test => "test failure",
            FailureKind::Coverage => "coverage failure",
            FailureKind::Upload => "upload failure",
        };
        f.write_str(s)
    }
}

/// What a failure of a stage does to the rest of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the pipeline and fail the run.
    #[default]
    Fatal,
    /// Log and continue; the run can still pass.
    Advisory,
}

/// How a stage does its work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageAction {
    /// Run an external process (first element is the executable).
    Command { argv: Vec<String> },

    /// Clone `repository` into the environment and check out the trigger commit.
    Checkout { repository: String },

    /// Send the report at `report` to the coverage service.
    ///
    /// `token_env` names the variable the credential is read from at upload
    /// time; `None` uploads without a token.
    UploadCoverage {
        report: PathBuf,
        token_env: Option<String>,
    },
}

/// Configuration for a CI stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage identifier.
    pub name: String,

    /// Work performed by the stage.
    pub action: StageAction,

    /// Failure class reported when the stage fails.
    pub kind: FailureKind,

    /// Whether a failure halts the pipeline.
    pub policy: FailurePolicy,

    /// Names of stages that must precede this one.
    pub requires: Vec<String>,

    /// Artifact path (relative to the environment root) expected on success.
    pub produces: Option<PathBuf>,

    /// Timeout in seconds (0 = wait indefinitely).
    pub timeout_secs: u64,

    /// Whether this stage is enabled.
    pub enabled: bool,
}

impl StageConfig {
    /// Create a stage configuration from a builtin stage.
    ///
    /// `repository` feeds the checkout stage; the upload stage reads the
    /// default report with the token from `CODECOV_TOKEN`.
    pub fn from_builtin(stage: BuiltinStage, repository: &str) -> Self {
        let action = match stage {
            BuiltinStage::Checkout => StageAction::Checkout {
                repository: repository.to_string(),
            },
            BuiltinStage::UploadCoverage => StageAction::UploadCoverage {
                report: PathBuf::from(DEFAULT_COVERAGE_REPORT),
                token_env: Some("CODECOV_TOKEN".to_string()),
            },
            other => StageAction::Command {
                argv: other.command().unwrap_or_default(),
            },
        };
        Self {
            name: stage.name().to_string(),
            action,
            kind: stage.failure_kind(),
            policy: FailurePolicy::Fatal,
            requires: stage.requires().iter().map(|s| s.name().to_string()).collect(),
            produces: stage.produces(),
            timeout_secs: 0,
            enabled: true,
        }
    }

    /// Create a custom command stage.
    pub fn custom(name: impl Into<String>, command: Vec<String>, kind: FailureKind) -> Self {
        Self {
            name: name.into(),
            action: StageAction::Command { argv: command },
            kind,
            policy: FailurePolicy::Fatal,
            requires: Vec::new(),
            produces: None,
            timeout_secs: 0,
            enabled: true,
        }
    }

    /// Create a coverage upload stage.
    pub fn upload(
        name: impl Into<String>,
        report: impl Into<PathBuf>,
        token_env: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            action: StageAction::UploadCoverage {
                report: report.into(),
                token_env: token_env.map(str::to_string),
            },
            kind: FailureKind::Upload,
            policy: FailurePolicy::Fatal,
            requires: Vec::new(),
            produces: None,
            timeout_secs: 0,
            enabled: true,
        }
    }

    /// Require `stage` to have run before this one.
    pub fn after(mut self, stage: &str) -> Self {
        self.requires.push(stage.to_string());
        self
    }

    /// Expect `path` to exist once the stage exits successfully.
    pub fn producing(mut self, path: impl Into<PathBuf>) -> Self {
        self.produces = Some(path.into());
        self
    }

    /// Set the failure policy.
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the timeout (0 = none).
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Command line for command stages.
    pub fn argv(&self) -> Option<&[String]> {
        match &self.action {
            StageAction::Command { argv } => Some(argv),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_stage_names_roundtrip() {
        for stage in BuiltinStage::ALL {
            assert_eq!(BuiltinStage::from_name(stage.name()), Some(stage));
        }
        assert_eq!(BuiltinStage::from_name("cargo_fmt"), None);
    }

    #[test]
    fn test_builtin_stage_commands() {
        let test_cmd = BuiltinStage::RunTests.command().unwrap();
        assert_eq!(test_cmd, vec!["cargo", "test", "--verbose"]);

        let cov_cmd = BuiltinStage::GenerateCoverage.command().unwrap();
        assert_eq!(cov_cmd[0], "cargo");
        assert!(cov_cmd.contains(&"--all-features".to_string()));
        assert!(cov_cmd.contains(&"--workspace".to_string()));
        assert!(cov_cmd.contains(&"--lcov".to_string()));
        assert_eq!(cov_cmd.last().unwrap(), DEFAULT_COVERAGE_REPORT);

        assert!(BuiltinStage::Checkout.command().is_none());
        assert!(BuiltinStage::UploadCoverage.command().is_none());
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(BuiltinStage::Checkout.failure_kind(), FailureKind::Infrastructure);
        assert_eq!(BuiltinStage::InstallWasi2ic.failure_kind(), FailureKind::Infrastructure);
        assert_eq!(BuiltinStage::BuildTestProjects.failure_kind(), FailureKind::Build);
        assert_eq!(BuiltinStage::RunTests.failure_kind(), FailureKind::Test);
        assert_eq!(BuiltinStage::GenerateCoverage.failure_kind(), FailureKind::Coverage);
        assert_eq!(BuiltinStage::UploadCoverage.failure_kind(), FailureKind::Upload);
    }

    #[test]
    fn test_toolchain_precedes_dependent_stages() {
        for stage in [
            BuiltinStage::BuildTestProjects,
            BuiltinStage::InstallCoverageTool,
            BuiltinStage::RunTests,
        ] {
            assert!(stage.requires().contains(&BuiltinStage::ToolchainInstall));
        }
        assert!(BuiltinStage::GenerateCoverage
            .requires()
            .contains(&BuiltinStage::RunTests));
    }

    #[test]
    fn test_stage_config_from_builtin() {
        let config = StageConfig::from_builtin(BuiltinStage::GenerateCoverage, ".");
        assert_eq!(config.name, "generate_coverage");
        assert_eq!(config.kind, FailureKind::Coverage);
        assert_eq!(config.policy, FailurePolicy::Fatal);
        assert_eq!(config.produces, Some(PathBuf::from("lcov.info")));
        assert_eq!(config.timeout_secs, 0);
        assert!(config.enabled);

        let checkout =
            StageConfig::from_builtin(BuiltinStage::Checkout, "https://example.com/repo.git");
        assert_eq!(
            checkout.action,
            StageAction::Checkout {
                repository: "https://example.com/repo.git".to_string()
            }
        );
    }

    #[test]
    fn test_stage_config_custom() {
        let config = StageConfig::custom(
            "my_stage",
            vec!["echo".to_string(), "hello".to_string()],
            FailureKind::Build,
        )
        .with_timeout(60);
        assert_eq!(config.name, "my_stage");
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.argv().unwrap()[0], "echo");
        assert!(config.requires.is_empty());
    }

    #[test]
    fn test_stage_config_upload() {
        let config = StageConfig::upload("publish", "target/cov.info", Some("COV_TOKEN"))
            .after("coverage")
            .with_policy(FailurePolicy::Advisory);
        assert_eq!(config.kind, FailureKind::Upload);
        assert_eq!(config.requires, vec!["coverage".to_string()]);
        assert!(config.argv().is_none());
        assert_eq!(
            config.action,
            StageAction::UploadCoverage {
                report: PathBuf::from("target/cov.info"),
                token_env: Some("COV_TOKEN".to_string()),
            }
        );
    }

    #[test]
    fn test_stage_config_disabled() {
        let config = StageConfig::from_builtin(BuiltinStage::RunTests, ".").disabled();
        assert!(!config.enabled);
    }
}
