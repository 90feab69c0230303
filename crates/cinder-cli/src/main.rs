//! cinder - fail-fast build/test/coverage pipeline runner
//!
//! ## Commands
//!
//! - `run`: execute the pipeline for a trigger event and record it
//! - `plan`: show the stage sequence the configuration produces
//! - `runs list` / `runs show`: inspect recorded runs and audit them
//! - `config`: print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cinder_ci::config::DEFAULT_CONFIG_FILE;
use cinder_ci::{
    BuiltinStage, CiGate, CiPipeline, CinderConfig, PipelineOutcome, PipelineResult, StageAction,
    StageEvent, StagePlan, TriggerEvent, TriggerKind, Workspace,
};
use cinder_state::{ContentDigest, FsRunLedger, RunId, RunLedger};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "cinder")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fail-fast build/test/coverage pipeline runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (default: ./cinder.toml, optional)
    #[arg(short, long, global = true, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a trigger event
    ///
    /// Without flags the event is read from GITHUB_* variables, falling back
    /// to the current git branch and HEAD as a push.
    Run {
        /// Branch the event targets
        #[arg(short, long)]
        branch: Option<String>,

        /// Event kind (push or pull_request)
        #[arg(short, long)]
        event: Option<TriggerKind>,

        /// Commit to check out
        #[arg(long)]
        commit: Option<String>,

        /// Repository to clone (path or URL, default: current directory)
        #[arg(short, long, default_value = ".")]
        repository: String,

        /// Run in an existing checkout instead of a fresh clone
        #[arg(long, value_name = "PATH")]
        in_place: Option<PathBuf>,

        /// Ledger directory (default: from configuration)
        #[arg(long)]
        ledger_dir: Option<PathBuf>,
    },

    /// Show the stage sequence
    Plan {
        /// Repository the checkout stage would clone
        #[arg(short, long, default_value = ".")]
        repository: String,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Inspect recorded runs
    Runs {
        /// Ledger directory (default: from configuration)
        #[arg(long, global = true)]
        ledger_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: RunsAction,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, newest first
    List {
        /// Only runs with this spec digest
        #[arg(long)]
        digest: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one run's events and gate verdict
    Show {
        /// Run ID
        run_id: String,

        /// Emit JSON output instead of terminal text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cinder_ci::init_tracing(cli.log_json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            branch,
            event,
            commit,
            repository,
            in_place,
            ledger_dir,
        } => {
            let trigger = resolve_trigger(branch, event, commit)?;
            let ledger_dir = ledger_dir.unwrap_or_else(|| config.ledger.dir.clone());
            let code = cmd_run(&config, &trigger, &repository, in_place, &ledger_dir).await?;
            Ok(ExitCode::from(code))
        }
        Commands::Plan { repository, json } => {
            cmd_plan(&config, &repository, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Runs { ledger_dir, action } => {
            let ledger_dir = ledger_dir.unwrap_or_else(|| config.ledger.dir.clone());
            let ledger = FsRunLedger::open(&ledger_dir)
                .with_context(|| format!("Failed to open ledger at {}", ledger_dir.display()))?;
            match action {
                RunsAction::List { digest, limit } => {
                    cmd_runs_list(&ledger, digest, limit).await?;
                    Ok(ExitCode::SUCCESS)
                }
                RunsAction::Show { run_id, json } => {
                    let passed = cmd_runs_show(&ledger, &run_id, json).await?;
                    Ok(if passed {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    })
                }
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the configuration file and apply `CINDER_*` overrides.
fn load_config(path: Option<&Path>) -> Result<CinderConfig> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut config = CinderConfig::load(&path, required)?;
    config
        .apply_env_overrides()
        .context("Invalid CINDER_* environment override")?;
    Ok(config)
}

/// Run `git` in the current directory and return trimmed stdout on success.
fn git_output(args: &[&str]) -> Option<String> {
    let output = std::process::Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let out = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!out.is_empty()).then_some(out)
}

/// Build the trigger event: flags override the hosted-runner environment,
/// which overrides the local git checkout.
fn resolve_trigger(
    branch: Option<String>,
    event: Option<TriggerKind>,
    commit: Option<String>,
) -> Result<TriggerEvent> {
    resolve_trigger_from(branch, event, commit, TriggerEvent::from_env(), git_output)
}

fn resolve_trigger_from(
    branch: Option<String>,
    event: Option<TriggerKind>,
    commit: Option<String>,
    hosted: Option<TriggerEvent>,
    git: impl Fn(&[&str]) -> Option<String>,
) -> Result<TriggerEvent> {
    let (hosted_branch, hosted_kind, hosted_commit) = match hosted {
        Some(e) => (Some(e.branch), Some(e.kind), e.commit),
        None => (None, None, None),
    };

    let branch = branch
        .or(hosted_branch)
        .or_else(|| git(&["rev-parse", "--abbrev-ref", "HEAD"]).filter(|b| b != "HEAD"))
        .context("Cannot determine the branch; pass --branch")?;
    let kind = event.or(hosted_kind).unwrap_or(TriggerKind::Push);
    let commit = commit
        .or(hosted_commit)
        .or_else(|| git(&["rev-parse", "HEAD"]));

    let trigger = TriggerEvent {
        branch,
        kind,
        commit,
    };
    debug!(?trigger, "Resolved trigger event");
    Ok(trigger)
}

/// Local paths are made absolute so the clone works from inside the environment.
fn absolute_repository(repository: &str) -> String {
    match std::fs::canonicalize(repository) {
        Ok(path) => path.display().to_string(),
        Err(_) => repository.to_string(),
    }
}

fn build_plan(config: &CinderConfig, repository: &str, in_place: bool) -> Result<StagePlan> {
    let plan = config.build_plan(&absolute_repository(repository))?;
    if in_place {
        return Ok(plan.modify(BuiltinStage::Checkout.name(), |s| s.disabled())?);
    }
    Ok(plan)
}

/// Run the pipeline and print per-stage results. Returns the process exit code.
async fn cmd_run(
    config: &CinderConfig,
    trigger: &TriggerEvent,
    repository: &str,
    in_place: Option<PathBuf>,
    ledger_dir: &Path,
) -> Result<u8> {
    let plan = build_plan(config, repository, in_place.is_some())?;
    let workspace = match in_place {
        Some(path) => Workspace::InPlace(path),
        None => Workspace::Ephemeral,
    };
    let env_spec = config.environment_spec(workspace);

    let ledger = Arc::new(
        FsRunLedger::open(ledger_dir)
            .with_context(|| format!("Failed to open ledger at {}", ledger_dir.display()))?,
    );
    let uploader = Arc::new(config.uploader()?);

    println!(
        "Running pipeline for {} on {} ({})",
        trigger.kind,
        trigger.branch,
        trigger.commit.as_deref().unwrap_or("HEAD")
    );
    println!();

    let result = CiPipeline::new(ledger.clone(), uploader)
        .run(trigger, &config.trigger_filter(), &plan, &env_spec)
        .await
        .context("CI pipeline failed to run")?;

    print_result(&result);

    if let Some(run_id) = &result.run_id {
        let events = ledger.get_events(run_id).await?;
        let verdict = CiGate::evaluate(&events);
        println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }

    info!(outcome = %result.outcome, "Pipeline finished");
    Ok(result.exit_code() as u8)
}

fn print_result(result: &PipelineResult) {
    if let PipelineOutcome::Skipped { reason } = &result.outcome {
        println!("Skipped: {}", reason);
        return;
    }

    if let Some(run_id) = &result.run_id {
        println!("Run ID: {}", run_id);
    }
    println!("Spec digest: {}", result.spec_digest.short());
    println!(
        "Status: {}",
        if result.success() { "✓ PASSED" } else { "✗ FAILED" }
    );
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for stage in &result.stages {
        let status = if stage.passed() { "✓" } else { "✗" };
        println!(
            "  {} {} ({}ms, exit code: {})",
            status, stage.stage_name, stage.duration_ms, stage.exit_code
        );
        if !stage.passed() {
            for line in stage.stderr.lines().rev().take(5).collect::<Vec<_>>().iter().rev() {
                println!("      {}", line);
            }
        }
    }
    for name in &result.skipped {
        println!("  - {} (skipped)", name);
    }

    println!();
    println!(
        "Summary: {}/{} stages passed",
        result.passed_count(),
        result.stages.len()
    );
    if let PipelineOutcome::Failed { stage, kind } = &result.outcome {
        println!("Failure: {} in stage {}", kind, stage);
    }
}

fn describe_action(action: &StageAction) -> String {
    match action {
        StageAction::Command { argv } => argv.join(" "),
        StageAction::Checkout { repository } => format!("git clone {}", repository),
        StageAction::UploadCoverage { report, token_env } => match token_env {
            Some(var) => format!("upload {} (token from ${})", report.display(), var),
            None => format!("upload {} (tokenless)", report.display()),
        },
    }
}

/// Print the stage plan
fn cmd_plan(config: &CinderConfig, repository: &str, json: bool) -> Result<()> {
    let plan = build_plan(config, repository, false)?;

    if json {
        println!("{}", serde_json::to_string_pretty(plan.stages())?);
        return Ok(());
    }

    let filter = config.trigger_filter();
    let events: Vec<&str> = filter.kinds.iter().map(TriggerKind::as_str).collect();
    println!("Trigger: {} on {}", events.join(", "), filter.branch);
    println!();
    for (i, stage) in plan.stages().iter().enumerate() {
        let mut notes = vec![stage.kind.to_string()];
        if stage.policy == cinder_ci::FailurePolicy::Advisory {
            notes.push("advisory".to_string());
        }
        if stage.timeout_secs > 0 {
            notes.push(format!("timeout {}s", stage.timeout_secs));
        }
        if !stage.enabled {
            notes.push("disabled".to_string());
        }
        println!(
            "  {}. {:<22} {}  [{}]",
            i + 1,
            stage.name,
            describe_action(&stage.action),
            notes.join(", ")
        );
    }
    Ok(())
}

/// List recorded runs
async fn cmd_runs_list(ledger: &dyn RunLedger, digest: Option<String>, limit: usize) -> Result<()> {
    let digest = digest
        .map(ContentDigest::try_from)
        .transpose()
        .context("Invalid --digest")?;
    let runs = ledger.list_runs(digest.as_ref()).await?;

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }

    for run in runs.iter().take(limit) {
        let revision = run
            .metadata
            .revision
            .as_deref()
            .map(|r| &r[..r.len().min(12)])
            .unwrap_or("-");
        let failed = run
            .summary
            .as_ref()
            .and_then(|s| s.failed_stage.as_deref())
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        println!(
            "{}  {}  {:<9}  {}{}",
            run.run_id,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", run.status),
            revision,
            failed
        );
    }
    Ok(())
}

/// Show a run and evaluate the gate. Returns whether the gate passed.
async fn cmd_runs_show(ledger: &dyn RunLedger, run_id: &str, json: bool) -> Result<bool> {
    let run_id = RunId(run_id.to_string());
    let run = ledger
        .get_run(&run_id)
        .await
        .with_context(|| format!("Run {} not found", run_id))?;
    let events = ledger.get_events(&run_id).await?;
    let verdict = CiGate::evaluate(&events);

    if json {
        let doc = json!({
            "run": run,
            "events": events,
            "gate": verdict,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(verdict.passed);
    }

    println!("Run ID: {}", run.run_id);
    println!("Spec digest: {}", run.spec_digest);
    println!("Status: {:?}", run.status);
    if let Some(revision) = &run.metadata.revision {
        println!("Revision: {}", revision);
    }
    println!();

    for event in &events {
        match StageEvent::from_run_event(event) {
            Ok(StageEvent::StageStarted { stage, .. }) => {
                println!("  [{}] ▶ {}", event.seq, stage)
            }
            Ok(StageEvent::StagePassed {
                stage, duration_ms, ..
            }) => println!("  [{}] ✓ {} ({}ms)", event.seq, stage, duration_ms),
            Ok(StageEvent::StageFailed {
                stage,
                failure,
                fatal,
                exit_code,
                ..
            }) => println!(
                "  [{}] ✗ {} ({}, exit code {}{})",
                event.seq,
                stage,
                failure,
                exit_code,
                if fatal { "" } else { ", advisory" }
            ),
            Ok(StageEvent::StageSkipped { stage, reason }) => {
                println!("  [{}] - {} (skipped: {:?})", event.seq, stage, reason)
            }
            Err(_) => println!("  [{}] ? {}", event.seq, event.kind),
        }
    }

    println!();
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
    Ok(verdict.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn no_git(_: &[&str]) -> Option<String> {
        None
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "cinder",
            "run",
            "--branch",
            "main",
            "--event",
            "pull_request",
            "--in-place",
            "/tmp/checkout",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                branch,
                event,
                in_place,
                repository,
                ..
            } => {
                assert_eq!(branch.as_deref(), Some("main"));
                assert_eq!(event, Some(TriggerKind::PullRequest));
                assert_eq!(in_place, Some(PathBuf::from("/tmp/checkout")));
                assert_eq!(repository, ".");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_flags_override_hosted_event() {
        let hosted = TriggerEvent::new("main", TriggerKind::PullRequest).with_commit("hosted");
        let trigger = resolve_trigger_from(
            Some("release".to_string()),
            None,
            None,
            Some(hosted),
            no_git,
        )
        .unwrap();
        assert_eq!(trigger.branch, "release");
        assert_eq!(trigger.kind, TriggerKind::PullRequest);
        assert_eq!(trigger.commit.as_deref(), Some("hosted"));
    }

    #[test]
    fn test_trigger_falls_back_to_git() {
        let git = |args: &[&str]| match args {
            ["rev-parse", "--abbrev-ref", "HEAD"] => Some("main".to_string()),
            ["rev-parse", "HEAD"] => Some("0123abcd".to_string()),
            _ => None,
        };
        let trigger = resolve_trigger_from(None, None, None, None, git).unwrap();
        assert_eq!(trigger.branch, "main");
        assert_eq!(trigger.kind, TriggerKind::Push);
        assert_eq!(trigger.commit.as_deref(), Some("0123abcd"));
    }

    #[test]
    fn test_detached_head_needs_branch_flag() {
        let git = |args: &[&str]| match args {
            ["rev-parse", "--abbrev-ref", "HEAD"] => Some("HEAD".to_string()),
            _ => None,
        };
        assert!(resolve_trigger_from(None, None, None, None, git).is_err());
    }

    #[test]
    fn test_in_place_plan_disables_checkout() {
        let plan = build_plan(&CinderConfig::default(), ".", true).unwrap();
        assert!(!plan.get("checkout").unwrap().enabled);
        assert!(plan.get("run_tests").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_run_in_place_and_show() {
        let work = tempfile::tempdir().unwrap();
        let ledger_dir = tempfile::tempdir().unwrap();
        let config = CinderConfig::from_toml(
            r#"
            [stages.toolchain_install]
            command = ["true"]
            [stages.build_test_projects]
            command = ["true"]
            [stages.install_pocket_ic]
            command = ["true"]
            [stages.install_wasi2ic]
            command = ["true"]
            [stages.install_coverage_tool]
            command = ["true"]
            [stages.run_tests]
            command = ["true"]
            [stages.generate_coverage]
            command = ["sh", "-c", "printf 'TN:\\n' > lcov.info"]

            [upload]
            endpoint = "http://127.0.0.1:9"
            token_env = ""
            fail_ci_if_error = false
            "#,
        )
        .unwrap();
        let trigger = TriggerEvent::new("main", TriggerKind::Push).with_commit("abc123");

        let code = cmd_run(
            &config,
            &trigger,
            ".",
            Some(work.path().to_path_buf()),
            ledger_dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0, "advisory upload failure keeps the run green");

        let ledger = FsRunLedger::open(ledger_dir.path()).unwrap();
        let runs = ledger.list_runs(None).await.unwrap();
        assert_eq!(runs.len(), 1);

        let passed = cmd_runs_show(&ledger, &runs[0].run_id.0, false).await.unwrap();
        assert!(passed);
        cmd_runs_list(&ledger, None, 10).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_wrong_branch_records_nothing() {
        let ledger_dir = tempfile::tempdir().unwrap();
        let trigger = TriggerEvent::new("feature", TriggerKind::Push);

        let code = cmd_run(
            &CinderConfig::default(),
            &trigger,
            ".",
            None,
            ledger_dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let ledger = FsRunLedger::open(ledger_dir.path()).unwrap();
        assert!(ledger.list_runs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_show_unknown_run_fails() {
        let ledger_dir = tempfile::tempdir().unwrap();
        let ledger = FsRunLedger::open(ledger_dir.path()).unwrap();
        assert!(cmd_runs_show(&ledger, "missing", true).await.is_err());
    }
}
