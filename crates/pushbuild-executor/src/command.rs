//! Running external commands and recording them in the build log.

use async_trait::async_trait;
use pushbuild_core::buildlog::{BuildLog, BuildLogEntry};
use pushbuild_core::executor::{BuildError, CommandOutput, CommandRunner, CommandSpec};
use std::io;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs commands as local child processes. Stdout and stderr are merged
/// line by line in the order the lines arrive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);

        // Partial lines stay in their buffer until the newline arrives.
        let mut combined = Vec::new();
        let mut out_line = Vec::new();
        let mut err_line = Vec::new();
        let mut out_open = true;
        let mut err_open = true;
        while out_open || err_open {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut out_line), if out_open => {
                    out_open = read? > 0;
                    combined.append(&mut out_line);
                }
                read = stderr.read_until(b'\n', &mut err_line), if err_open => {
                    err_open = read? > 0;
                    combined.append(&mut err_line);
                }
            }
        }
        let status = child.wait().await?;

        Ok(CommandOutput {
            exit_code: status.code(),
            output: String::from_utf8_lossy(&combined).into_owned(),
        })
    }
}

/// Runs the steps of one build, appending each to the build log.
pub struct StepRunner<'a> {
    runner: &'a dyn CommandRunner,
    log: &'a mut BuildLog,
    /// Reported with any failure from here on.
    pub clobbered: bool,
}

impl<'a> StepRunner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, log: &'a mut BuildLog) -> Self {
        Self {
            runner,
            log,
            clobbered: false,
        }
    }

    /// Run a step that must succeed.
    pub async fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput, BuildError> {
        let output = self.record(spec).await?;
        if !output.success() {
            warn!(command = %spec, exit_code = ?output.exit_code, "Build step failed");
            return Err(BuildError::CommandFailed {
                command: spec.to_string(),
                exit_code: output.exit_code,
                clobbered: self.clobbered,
            });
        }
        Ok(output)
    }

    /// Run a step whose failure only means there was nothing to do.
    pub async fn run_tolerant(&mut self, spec: &CommandSpec) -> Result<CommandOutput, BuildError> {
        let output = self.record(spec).await?;
        if !output.success() {
            debug!(command = %spec, exit_code = ?output.exit_code, "Ignoring step failure");
        }
        Ok(output)
    }

    async fn record(&mut self, spec: &CommandSpec) -> Result<CommandOutput, BuildError> {
        info!(command = %spec, "Running build step");
        let started = Instant::now();
        let result = self.runner.run(spec).await;
        let duration = started.elapsed();

        match result {
            Ok(output) => {
                self.log.push(BuildLogEntry {
                    command: spec.argv(),
                    output: output.output.clone(),
                    duration,
                    exit_status: output.exit_code,
                });
                Ok(output)
            }
            Err(source) => {
                self.log.push(BuildLogEntry {
                    command: spec.argv(),
                    output: source.to_string(),
                    duration,
                    exit_status: None,
                });
                Err(BuildError::Spawn {
                    command: spec.to_string(),
                    source,
                })
            }
        }
    }
}
