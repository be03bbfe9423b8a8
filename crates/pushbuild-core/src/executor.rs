//! Builder and command-runner traits.
//!
//! A [`Builder`] materializes a source tree and builds it, recording every
//! command it runs in a [`BuildLog`]. Commands go through a [`CommandRunner`]
//! so the process boundary can be replaced in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::buildlog::BuildLog;

/// An external command to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Build from a non-empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Everything a build needs to know about one push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub branch: String,
    pub changeset: String,
    /// Build configuration text. The builder appends its own objdir override.
    pub mozconfig: String,
    /// Patch applied on top of the checkout.
    pub patch: Option<String>,
    /// Tooltool manifest, relative to the source tree.
    pub tooltool_manifest: Option<String>,
    /// Remove the object directory before building.
    pub clobber: bool,
}

/// What a successful build reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    /// The build system forced a clean build on its own.
    pub clobbered: bool,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("`{command}` failed with exit status {exit_code:?}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        /// Whether the build system had decided to clobber before failing.
        clobbered: bool,
    },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Clobber state known at the time of failure.
    pub fn clobbered(&self) -> bool {
        matches!(self, BuildError::CommandFailed { clobbered: true, .. })
    }
}

/// Trait for build procedures.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Prepare the tree and build it, appending every command to `log`.
    async fn build(
        &self,
        request: &BuildRequest,
        log: &mut BuildLog,
    ) -> Result<BuildOutcome, BuildError>;
}
