//! Single-use execution environment for one pipeline run.

use crate::error::{CiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

/// Where a run's working tree lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workspace {
    /// Fresh temporary directory, removed when the run ends.
    Ephemeral,
    /// An existing checkout, used as-is and left in place.
    InPlace(PathBuf),
}

/// Recipe for provisioning an [`Environment`].
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub workspace: Workspace,

    /// Variables set for every command stage.
    pub vars: BTreeMap<String, String>,

    /// Variables removed from command stages (credentials).
    pub scrub: Vec<String>,
}

impl EnvironmentSpec {
    pub fn ephemeral() -> Self {
        Self {
            workspace: Workspace::Ephemeral,
            vars: BTreeMap::new(),
            scrub: Vec::new(),
        }
    }

    pub fn in_place(path: impl Into<PathBuf>) -> Self {
        Self {
            workspace: Workspace::InPlace(path.into()),
            vars: BTreeMap::new(),
            scrub: Vec::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn scrubbing(mut self, var: impl Into<String>) -> Self {
        self.scrub.push(var.into());
        self
    }
}

/// Working directory plus process environment owned by exactly one run.
///
/// An ephemeral environment deletes its directory (and everything stages
/// left in it, including the coverage report) when dropped.
#[derive(Debug)]
pub struct Environment {
    root: PathBuf,
    temp: Option<TempDir>,
    vars: BTreeMap<String, String>,
    scrub: Vec<String>,
}

impl Environment {
    /// Create the environment described by `spec`.
    pub fn provision(spec: &EnvironmentSpec) -> Result<Self> {
        let (root, temp) = match &spec.workspace {
            Workspace::Ephemeral => {
                let dir = tempfile::Builder::new()
                    .prefix("cinder-run-")
                    .tempdir()
                    .map_err(CiError::Provision)?;
                (dir.path().to_path_buf(), Some(dir))
            }
            Workspace::InPlace(path) => {
                let root = path.canonicalize().map_err(CiError::Provision)?;
                if !root.is_dir() {
                    return Err(CiError::Provision(std::io::Error::new(
                        std::io::ErrorKind::NotADirectory,
                        format!("{} is not a directory", root.display()),
                    )));
                }
                (root, None)
            }
        };
        debug!(root = %root.display(), ephemeral = temp.is_some(), "Provisioned environment");
        Ok(Self {
            root,
            temp,
            vars: spec.vars.clone(),
            scrub: spec.scrub.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_ephemeral(&self) -> bool {
        self.temp.is_some()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Resolve a stage-relative path against the environment root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Remove a stage artifact from the environment. Missing files are fine.
    pub fn discard(&self, path: &Path) {
        let path = self.resolve(path);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Discarded artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not discard artifact"),
        }
    }

    /// Build a command that runs inside this environment.
    ///
    /// Scrubbed variables stay unset even when `vars` names them.
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(&self.root);
        cmd.envs(&self.vars);
        for var in &self.scrub {
            cmd.env_remove(var);
        }
        cmd
    }
}
