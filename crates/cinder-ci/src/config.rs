//! Pipeline configuration.
//!
//! Layers, lowest precedence first: built-in defaults, `cinder.toml`, then
//! `CINDER_*` environment variables. The CLI applies its flags on top.

use crate::environment::{EnvironmentSpec, Workspace};
use crate::error::{CiError, Result};
use crate::plan::StagePlan;
use crate::stage::{BuiltinStage, FailurePolicy, StageAction, DEFAULT_COVERAGE_REPORT};
use crate::trigger::{TriggerFilter, TriggerKind};
use crate::upload::{CodecovUploader, DEFAULT_CODECOV_ENDPOINT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cinder.toml";

/// Default ledger directory.
pub const DEFAULT_LEDGER_DIR: &str = ".cinder/runs";

/// Which events start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerSection {
    pub branch: String,
    pub events: Vec<TriggerKind>,
}

impl Default for TriggerSection {
    fn default() -> Self {
        let filter = TriggerFilter::default();
        Self {
            branch: filter.branch,
            events: filter.kinds,
        }
    }
}

/// Per-stage overrides. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageOverride {
    /// Replacement argv (command stages only).
    pub command: Option<Vec<String>>,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: Option<u64>,

    pub enabled: Option<bool>,
}

/// Coverage upload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadSection {
    pub endpoint: String,

    /// Variable holding the upload token. Empty uploads without a token.
    pub token_env: String,

    /// Report path relative to the environment root.
    pub report: PathBuf,

    /// Whether an upload failure fails the run.
    pub fail_ci_if_error: bool,

    /// `owner/repo`, for tokenless uploads.
    pub slug: Option<String>,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CODECOV_ENDPOINT.to_string(),
            token_env: "CODECOV_TOKEN".to_string(),
            report: PathBuf::from(DEFAULT_COVERAGE_REPORT),
            fail_ci_if_error: true,
            slug: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSection {
    pub dir: PathBuf,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_LEDGER_DIR),
        }
    }
}

/// Complete pipeline configuration (`cinder.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CinderConfig {
    pub trigger: TriggerSection,

    /// Variables injected into every command stage.
    pub env: BTreeMap<String, String>,

    /// Overrides keyed by stage id.
    pub stages: BTreeMap<String, StageOverride>,

    pub upload: UploadSection,

    pub ledger: LedgerSection,
}

fn default_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CARGO_TERM_COLOR".to_string(), "always".to_string());
    env
}

impl Default for CinderConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerSection::default(),
            env: default_env(),
            stages: BTreeMap::new(),
            upload: UploadSection::default(),
            ledger: LedgerSection::default(),
        }
    }
}

impl CinderConfig {
    /// Parse a TOML document.
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| CiError::Config(e.to_string()))
    }

    /// Load the configuration file at `path`.
    ///
    /// A missing file yields the defaults unless `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(source) => {
                debug!(path = %path.display(), "Loaded configuration file");
                Self::from_toml(&source)
                    .map_err(|e| CiError::Config(format!("{}: {}", path.display(), e)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(CiError::Config(format!("{}: {}", path.display(), e))),
        }
    }

    /// Apply `CINDER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|k| std::env::var(k).ok())
    }

    pub(crate) fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(branch) = lookup("CINDER_BRANCH").filter(|b| !b.trim().is_empty()) {
            self.trigger.branch = branch.trim().to_string();
        }
        if let Some(flag) = lookup("CINDER_FAIL_ON_UPLOAD_ERROR") {
            self.upload.fail_ci_if_error = parse_bool(&flag).ok_or_else(|| {
                CiError::Config(format!(
                    "CINDER_FAIL_ON_UPLOAD_ERROR must be true or false, got '{}'",
                    flag
                ))
            })?;
        }
        if let Some(dir) = lookup("CINDER_LEDGER_DIR").filter(|d| !d.trim().is_empty()) {
            self.ledger.dir = PathBuf::from(dir.trim());
        }
        Ok(())
    }

    pub fn trigger_filter(&self) -> TriggerFilter {
        TriggerFilter {
            branch: self.trigger.branch.clone(),
            kinds: self.trigger.events.clone(),
        }
    }

    /// Token variable, or `None` for tokenless uploads.
    pub fn token_env(&self) -> Option<&str> {
        Some(self.upload.token_env.trim()).filter(|v| !v.is_empty())
    }

    /// Build the stage plan: the builtin sequence with overrides applied.
    ///
    /// Overrides can change invocations and timeouts, never the order or
    /// number of stages. Only stages no other stage requires can be
    /// disabled; checkout is the exception, for runs in an existing checkout.
    pub fn build_plan(&self, repository: &str) -> Result<StagePlan> {
        let mut plan = StagePlan::builtin(repository);

        for (id, overrides) in &self.stages {
            let stage = BuiltinStage::from_name(id)
                .ok_or_else(|| CiError::Config(format!("unknown stage id '{}'", id)))?;
            if let Some(command) = &overrides.command {
                if stage.command().is_none() {
                    return Err(CiError::Config(format!(
                        "stage '{}' does not run a command",
                        id
                    )));
                }
                if command.is_empty() {
                    return Err(CiError::Config(format!("stage '{}' has an empty command", id)));
                }
            }

            let overrides = overrides.clone();
            plan = plan.modify(id, move |mut config| {
                if let Some(argv) = overrides.command {
                    config.action = StageAction::Command { argv };
                }
                if let Some(timeout_secs) = overrides.timeout_secs {
                    config.timeout_secs = timeout_secs;
                }
                if let Some(enabled) = overrides.enabled {
                    config.enabled = enabled;
                }
                config
            })?;
        }

        for stage in plan.stages().iter().filter(|s| !s.enabled) {
            if matches!(stage.action, StageAction::Checkout { .. }) {
                continue;
            }
            if let Some(dependent) = plan
                .stages()
                .iter()
                .find(|s| s.enabled && s.requires.contains(&stage.name))
            {
                return Err(CiError::Config(format!(
                    "stage '{}' cannot be disabled: '{}' requires it",
                    stage.name, dependent.name
                )));
            }
        }

        let report = self.upload.report.clone();
        if report != Path::new(DEFAULT_COVERAGE_REPORT) {
            let command_overridden = self
                .stages
                .get(BuiltinStage::GenerateCoverage.name())
                .map(|o| o.command.is_some())
                .unwrap_or(false);
            let report = report.clone();
            plan = plan.modify(BuiltinStage::GenerateCoverage.name(), move |mut config| {
                if !command_overridden {
                    if let StageAction::Command { argv } = &mut config.action {
                        if let Some(last) = argv.last_mut() {
                            *last = report.display().to_string();
                        }
                    }
                }
                config.produces = Some(report);
                config
            })?;
        }

        let policy = if self.upload.fail_ci_if_error {
            FailurePolicy::Fatal
        } else {
            FailurePolicy::Advisory
        };
        let token_env = self.token_env().map(str::to_string);
        plan.modify(BuiltinStage::UploadCoverage.name(), move |mut config| {
            config.action = StageAction::UploadCoverage { report, token_env };
            config.policy = policy;
            config
        })
    }

    /// Environment recipe for `workspace`, with the upload token scrubbed
    /// from command stages.
    pub fn environment_spec(&self, workspace: Workspace) -> EnvironmentSpec {
        let mut spec = EnvironmentSpec {
            workspace,
            vars: default_env(),
            scrub: Vec::new(),
        };
        spec.vars
            .extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(var) = self.token_env() {
            spec = spec.scrubbing(var);
        }
        spec
    }

    /// Codecov uploader for the configured endpoint.
    pub fn uploader(&self) -> Result<CodecovUploader> {
        let uploader = CodecovUploader::new(&self.upload.endpoint)?;
        Ok(match &self.upload.slug {
            Some(slug) => uploader.with_slug(slug.clone()),
            None => uploader,
        })
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CiError::Config(e.to_string()))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CinderConfig::default();
        assert_eq!(config.trigger.branch, "main");
        assert_eq!(
            config.trigger.events,
            vec![TriggerKind::Push, TriggerKind::PullRequest]
        );
        assert_eq!(config.env.get("CARGO_TERM_COLOR").map(String::as_str), Some("always"));
        assert!(config.upload.fail_ci_if_error);
        assert_eq!(config.ledger.dir, PathBuf::from(".cinder/runs"));
    }

    #[test]
    fn test_parse_full_document() {
        let config = CinderConfig::from_toml(
            r#"
            [trigger]
            branch = "release"
            events = ["push"]

            [env]
            RUST_BACKTRACE = "1"

            [stages.run_tests]
            command = ["cargo", "nextest", "run"]
            timeout_secs = 900

            [stages.upload_coverage]
            enabled = false

            [upload]
            token_env = "MY_TOKEN"
            fail_ci_if_error = false
            "#,
        )
        .unwrap();

        assert_eq!(config.trigger.branch, "release");
        assert_eq!(config.trigger.events, vec![TriggerKind::Push]);
        assert_eq!(config.stages["run_tests"].timeout_secs, Some(900));
        assert_eq!(config.upload.token_env, "MY_TOKEN");
        assert_eq!(config.upload.endpoint, DEFAULT_CODECOV_ENDPOINT);

        let plan = config.build_plan("https://example.com/r.git").unwrap();
        let tests = plan.get("run_tests").unwrap();
        assert_eq!(tests.argv().unwrap(), ["cargo", "nextest", "run"]);
        assert_eq!(tests.timeout_secs, 900);
        assert!(!plan.get("upload_coverage").unwrap().enabled);

        let upload = plan.get("upload_coverage").unwrap();
        assert_eq!(upload.policy, FailurePolicy::Advisory);
        assert_eq!(
            upload.action,
            StageAction::UploadCoverage {
                report: PathBuf::from("lcov.info"),
                token_env: Some("MY_TOKEN".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(CinderConfig::from_toml("[trigger]\nbranches = [\"main\"]\n").is_err());
        assert!(CinderConfig::from_toml("[stages.run_tests]\nretries = 3\n").is_err());
    }

    #[test]
    fn test_unknown_stage_id_is_config_error() {
        let config = CinderConfig::from_toml("[stages.cargo_fmt]\nenabled = true\n").unwrap();
        let err = config.build_plan(".").unwrap_err();
        assert!(matches!(err, CiError::Config(msg) if msg.contains("cargo_fmt")));
    }

    #[test]
    fn test_disabling_required_stage_rejected() {
        let config =
            CinderConfig::from_toml("[stages.toolchain_install]\nenabled = false\n").unwrap();
        let err = config.build_plan(".").unwrap_err();
        assert!(
            matches!(&err, CiError::Config(msg) if msg.contains("'toolchain_install' cannot be disabled")),
            "{}",
            err
        );

        let config = CinderConfig::from_toml("[stages.run_tests]\nenabled = false\n").unwrap();
        assert!(config.build_plan(".").is_err());
    }

    #[test]
    fn test_disabling_coverage_tail_together_allowed() {
        let config = CinderConfig::from_toml(
            "[stages.generate_coverage]\nenabled = false\n[stages.upload_coverage]\nenabled = false\n",
        )
        .unwrap();
        let plan = config.build_plan(".").unwrap();
        assert!(!plan.get("generate_coverage").unwrap().enabled);
    }

    #[test]
    fn test_checkout_and_upload_can_be_disabled() {
        let config = CinderConfig::from_toml(
            "[stages.checkout]\nenabled = false\n[stages.upload_coverage]\nenabled = false\n",
        )
        .unwrap();
        let plan = config.build_plan(".").unwrap();
        assert!(!plan.get("checkout").unwrap().enabled);
        assert!(!plan.get("upload_coverage").unwrap().enabled);
    }

    #[test]
    fn test_command_override_on_upload_rejected() {
        let config =
            CinderConfig::from_toml("[stages.upload_coverage]\ncommand = [\"curl\"]\n").unwrap();
        assert!(matches!(
            config.build_plan(".").unwrap_err(),
            CiError::Config(_)
        ));
    }

    #[test]
    fn test_plan_order_is_fixed() {
        let config = CinderConfig::from_toml(
            "[stages.upload_coverage]\ntimeout_secs = 30\n[stages.checkout]\ntimeout_secs = 60\n",
        )
        .unwrap();
        let plan = config.build_plan(".").unwrap();
        let expected: Vec<String> = BuiltinStage::ALL.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(plan.names(), expected);
    }

    #[test]
    fn test_custom_report_path_flows_to_coverage_stage() {
        let config = CinderConfig::from_toml("[upload]\nreport = \"target/cov.info\"\n").unwrap();
        let plan = config.build_plan(".").unwrap();

        let coverage = plan.get("generate_coverage").unwrap();
        assert_eq!(coverage.produces, Some(PathBuf::from("target/cov.info")));
        assert_eq!(coverage.argv().unwrap().last().unwrap(), "target/cov.info");
    }

    #[test]
    fn test_tokenless_upload() {
        let config = CinderConfig::from_toml("[upload]\ntoken_env = \"\"\n").unwrap();
        assert_eq!(config.token_env(), None);
        let plan = config.build_plan(".").unwrap();
        assert!(matches!(
            &plan.get("upload_coverage").unwrap().action,
            StageAction::UploadCoverage { token_env: None, .. }
        ));
        assert!(config.environment_spec(Workspace::Ephemeral).scrub.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CINDER_BRANCH", "develop"),
            ("CINDER_FAIL_ON_UPLOAD_ERROR", "false"),
            ("CINDER_LEDGER_DIR", "/var/lib/cinder"),
        ]
        .into_iter()
        .collect();
        let mut config = CinderConfig::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.trigger.branch, "develop");
        assert!(!config.upload.fail_ci_if_error);
        assert_eq!(config.ledger.dir, PathBuf::from("/var/lib/cinder"));
    }

    #[test]
    fn test_bad_bool_override_rejected() {
        let mut config = CinderConfig::default();
        let err = config
            .apply_overrides_from(|k| (k == "CINDER_FAIL_ON_UPLOAD_ERROR").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, CiError::Config(_)));
    }

    #[test]
    fn test_environment_spec_merges_defaults_and_scrubs_token() {
        let config = CinderConfig::from_toml("[env]\nRUST_LOG = \"debug\"\n").unwrap();
        let spec = config.environment_spec(Workspace::Ephemeral);
        assert_eq!(spec.vars.get("CARGO_TERM_COLOR").map(String::as_str), Some("always"));
        assert_eq!(spec.vars.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(spec.scrub, vec!["CODECOV_TOKEN".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        assert_eq!(CinderConfig::load(&path, false).unwrap(), CinderConfig::default());
        assert!(CinderConfig::load(&path, true).is_err());
    }

    #[test]
    fn test_load_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        std::fs::write(&path, "[trigger]\nbranch = \"trunk\"\n").unwrap();

        let config = CinderConfig::load(&path, true).unwrap();
        assert_eq!(config.trigger.branch, "trunk");

        let rendered = config.to_toml().unwrap();
        assert_eq!(CinderConfig::from_toml(&rendered).unwrap(), config);
    }
}
