//! Tree builder: checkout, configure, build.

use async_trait::async_trait;
use pushbuild_config::BuildConfig;
use pushbuild_core::buildlog::BuildLog;
use pushbuild_core::executor::{
    BuildError, BuildOutcome, BuildRequest, Builder, CommandRunner, CommandSpec,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::command::StepRunner;
use crate::source::MercurialSource;

/// Marker the build system touches when the tree needs a clean build.
const CLOBBER_MARKER: &str = "CLOBBER";

/// Builds a Mercurial checkout with a generated mozconfig.
pub struct TreeBuilder {
    runner: Arc<dyn CommandRunner>,
    source: MercurialSource,
    work_dir: PathBuf,
    command: Vec<String>,
}

impl TreeBuilder {
    pub fn new(config: &BuildConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            source: MercurialSource::new(config),
            work_dir: config.work_dir.clone(),
            command: config.command.clone(),
        }
    }

    pub fn source(&self) -> &MercurialSource {
        &self.source
    }

    pub fn objdir(&self) -> PathBuf {
        self.work_dir.join("obj")
    }

    pub fn mozconfig_path(&self) -> PathBuf {
        self.work_dir.join("mozconfig")
    }
}

/// The supplied mozconfig with our object directory appended.
pub fn mozconfig_contents(mozconfig: &str, objdir: &Path) -> String {
    let mut contents = mozconfig.to_string();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&format!("mk_add_options MOZ_OBJDIR={}\n", objdir.display()));
    contents
}

/// Whether the build system will clobber on its own: the source marker is
/// newer than the one left in the object directory by the last clean build.
pub fn needs_clobber(srcdir: &Path, objdir: &Path) -> bool {
    let modified = |dir: &Path| {
        std::fs::metadata(dir.join(CLOBBER_MARKER))
            .and_then(|m| m.modified())
            .ok()
    };
    match (modified(srcdir), modified(objdir)) {
        (Some(source), Some(object)) => source > object,
        _ => false,
    }
}

async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl Builder for TreeBuilder {
    async fn build(
        &self,
        request: &BuildRequest,
        log: &mut BuildLog,
    ) -> Result<BuildOutcome, BuildError> {
        let mut steps = StepRunner::new(self.runner.as_ref(), log);
        self.source.prepare(&mut steps, request).await?;

        let tree = self.source.tree_dir();
        let objdir = self.objdir();
        let mozconfig = self.mozconfig_path();
        tokio::fs::write(&mozconfig, mozconfig_contents(&request.mozconfig, &objdir)).await?;

        let clobbered = needs_clobber(&tree, &objdir);
        steps.clobbered = clobbered;

        if request.clobber {
            info!(objdir = %objdir.display(), "Removing object directory");
            remove_dir_if_exists(&objdir).await?;
        }

        let command = CommandSpec::from_argv(&self.command)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty build command"))?
            .current_dir(&tree)
            .env("MOZCONFIG", mozconfig.to_string_lossy());
        steps.run(&command).await?;

        info!(
            branch = %request.branch,
            changeset = %request.changeset,
            clobber = request.clobber,
            clobbered,
            "Build succeeded"
        );
        Ok(BuildOutcome { clobbered })
    }
}
