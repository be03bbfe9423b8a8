//! Build execution for pushbuild.
//!
//! Provides the pieces a worker needs to turn a push into a build:
//! - [`ProcessRunner`] runs external commands with tokio
//! - [`MercurialSource`] materializes a source tree at a changeset
//! - [`TreeBuilder`] configures and builds that tree

pub mod builder;
pub mod command;
pub mod source;

pub use builder::TreeBuilder;
pub use command::{ProcessRunner, StepRunner};
pub use source::MercurialSource;

pub use pushbuild_core::executor::{
    BuildError, BuildOutcome, BuildRequest, Builder, CommandOutput, CommandRunner, CommandSpec,
};

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use pushbuild_core::executor::{CommandOutput, CommandRunner, CommandSpec};
    use std::sync::Mutex;

    /// Records every command and fails the ones matching a pattern.
    #[derive(Default)]
    pub struct ScriptedRunner {
        failures: Vec<(String, i32)>,
        pub calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(mut self, pattern: &str, exit_code: i32) -> Self {
            self.failures.push((pattern.to_string(), exit_code));
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(ToString::to_string)
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let line = spec.to_string();
            let exit_code = self
                .failures
                .iter()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map_or(0, |(_, code)| *code);
            Ok(CommandOutput {
                exit_code: Some(exit_code),
                output: format!("ran {}\n", line),
            })
        }
    }
}
