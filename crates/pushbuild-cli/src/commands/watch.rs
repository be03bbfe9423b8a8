//! `pushbuild watch`: catch up on the configured branches and print each
//! push as a JSON line.

use anyhow::{Context, Result};
use futures::StreamExt;
use pushbuild_core::push::BranchCursor;
use pushbuild_sync::{ChangesetFeed, PushSynchronizer};
use std::path::Path;
use std::sync::Arc;

pub async fn run(config_path: &Path) -> Result<()> {
    let config = super::load(config_path)?;
    let feed = ChangesetFeed::new(&config.feed).context("Failed to create pushlog client")?;
    let feed = Arc::new(feed);
    let cursors = config
        .branches
        .iter()
        .map(|b| BranchCursor::new(b.name.clone(), b.after.clone()));

    let sync = PushSynchronizer::new(feed, cursors);
    let stop = sync.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    let stream = sync.into_stream();
    futures::pin_mut!(stream);

    let mut count = 0usize;
    while let Some(push) = stream.next().await {
        println!("{}", serde_json::to_string(&push)?);
        count += 1;
    }
    tracing::info!(pushes = count, "Caught up");
    Ok(())
}
