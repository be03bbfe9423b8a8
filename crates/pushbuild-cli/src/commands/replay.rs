//! `pushbuild replay`: build a recorded range of pushes with the configured
//! worker, at the pace they originally landed.

use anyhow::{Context, Result};
use pushbuild_executor::{ProcessRunner, TreeBuilder};
use pushbuild_scheduler::{FsArtifactStore, TracingReporter, Worker, WorkerOptions};
use pushbuild_sync::{ChangesetFeed, PushReplayer};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub async fn run(config_path: &Path, branch: &str, after: &str, to: Option<&str>) -> Result<()> {
    let config = super::load(config_path)?;
    let options = WorkerOptions::from_config(&config).context("Failed to read build inputs")?;

    let feed = ChangesetFeed::new(&config.feed).context("Failed to create pushlog client")?;
    let max_delay = options.max_idle.unwrap_or_default();
    let replayer = PushReplayer::fetch(&feed, branch, after, to, max_delay).await;
    if replayer.remaining() == 0 {
        println!("No pushes to replay on {}", branch);
        return Ok(());
    }

    let builder = TreeBuilder::new(&config.build, Arc::new(ProcessRunner));
    let store = FsArtifactStore::from_config(&config.store);
    let worker = Worker::new(
        Box::new(replayer),
        Arc::new(builder),
        Arc::new(store),
        Arc::new(TracingReporter),
        options,
    );

    let handle = worker.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current build");
            handle.shutdown();
        }
    });

    let reason = worker.run().await;
    println!("Replay finished ({})", reason);
    Ok(())
}
