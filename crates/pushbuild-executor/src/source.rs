//! Mercurial working tree management.

use pushbuild_config::BuildConfig;
use pushbuild_core::executor::{BuildError, BuildRequest, CommandSpec};
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

use crate::command::StepRunner;

const PATCH_FILE: &str = "pushbuild.patch";

/// Keeps one working tree per repository and resets it to the requested
/// changeset before every build.
#[derive(Debug, Clone)]
pub struct MercurialSource {
    repository: Url,
    work_dir: PathBuf,
    tooltool_command: Vec<String>,
    setup_command: Option<Vec<String>>,
}

impl MercurialSource {
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            repository: config.repository.clone(),
            work_dir: config.work_dir.clone(),
            tooltool_command: config.tooltool_command.clone(),
            setup_command: config.setup_command.clone(),
        }
    }

    /// Checkout directory, named after the repository it was cloned from.
    pub fn tree_dir(&self) -> PathBuf {
        let digest = format!("{:x}", md5::compute(self.repository.as_str()));
        self.work_dir.join(digest)
    }

    pub fn branch_url(&self, branch: &str) -> String {
        format!("{}/{}", self.repository.as_str().trim_end_matches('/'), branch)
    }

    fn hg(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("hg", args.iter().copied()).current_dir(self.tree_dir())
    }

    /// Bring the tree to exactly `request.changeset`, apply the patch and
    /// fetch tooltool artifacts.
    pub async fn prepare(
        &self,
        steps: &mut StepRunner<'_>,
        request: &BuildRequest,
    ) -> Result<(), BuildError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let tree = self.tree_dir();
        let url = self.branch_url(&request.branch);
        let changeset = request.changeset.as_str();

        if !tree.join(".hg").is_dir() {
            info!(url = %url, path = %tree.display(), "Cloning repository");
            let target = tree.to_string_lossy();
            steps
                .run(&CommandSpec::new("hg", ["clone", "-U", url.as_str(), &*target]))
                .await?;
        }

        // Drop leftovers from earlier pulls of unpublished branches. Fails
        // when there is nothing to strip.
        steps
            .run_tolerant(&self.hg(&[
                "--config",
                "extensions.strip=",
                "strip",
                "--no-backup",
                "-r",
                "draft()",
            ]))
            .await?;

        steps
            .run(&self.hg(&["pull", "-r", changeset, url.as_str()]))
            .await?;
        steps.run(&self.hg(&["update", "-C", "-r", changeset])).await?;

        let mut purge = vec!["--config", "extensions.purge=", "purge"];
        if request.clobber {
            purge.push("--all");
        }
        steps.run(&self.hg(&purge)).await?;

        if let Some(patch) = &request.patch {
            let path = self.work_dir.join(PATCH_FILE);
            tokio::fs::write(&path, patch).await?;
            let path = path.to_string_lossy();
            steps
                .run(&self.hg(&["import", "--no-commit", &*path]))
                .await?;
        }

        if let Some(manifest) = &request.tooltool_manifest {
            self.fetch_tooltool(steps, &tree, manifest).await?;
        }

        Ok(())
    }

    async fn fetch_tooltool(
        &self,
        steps: &mut StepRunner<'_>,
        tree: &Path,
        manifest: &str,
    ) -> Result<(), BuildError> {
        let mut argv = self.tooltool_command.clone();
        argv.extend(["-m".to_string(), manifest.to_string()]);
        if let Some(fetch) = CommandSpec::from_argv(&argv) {
            steps.run(&fetch.current_dir(tree)).await?;
        }

        if let Some(setup) = self
            .setup_command
            .as_deref()
            .and_then(CommandSpec::from_argv)
        {
            steps.run(&setup.current_dir(tree)).await?;
        }
        Ok(())
    }
}
