//! `pushbuild pushes`: query the pushlog directly.

use anyhow::{Context, Result, bail};
use pushbuild_config::FeedConfig;
use pushbuild_core::push::Push;
use pushbuild_sync::{ChangesetFeed, FeedQuery, PushFeed};
use url::Url;

/// Map the `--after`/`--to` flags onto a pushlog query.
pub fn query_for(after: Option<String>, to: Option<String>) -> Result<FeedQuery> {
    match (after, to) {
        (after, None) => Ok(FeedQuery::After(after)),
        (Some(from), Some(to)) => Ok(FeedQuery::Range { from, to: Some(to) }),
        (None, Some(_)) => bail!("--to requires --after"),
    }
}

fn describe(push: &Push) -> String {
    format!(
        "{:>8}  {}  {}  ({} changeset{})",
        push.id,
        push.date.format("%Y-%m-%d %H:%M:%S"),
        push.head(),
        push.changesets.len(),
        if push.changesets.len() == 1 { "" } else { "s" }
    )
}

pub async fn list(
    base_url: Url,
    branch: &str,
    after: Option<String>,
    to: Option<String>,
) -> Result<()> {
    let query = query_for(after, to)?;
    let feed = ChangesetFeed::new(&FeedConfig {
        base_url,
        ..FeedConfig::default()
    })
    .context("Failed to create pushlog client")?;

    let pushes = feed.pushes(branch, &query).await;
    if pushes.is_empty() {
        println!("No pushes found on {}", branch);
        return Ok(());
    }

    for push in &pushes {
        println!("{}", describe(push));
    }
    println!("{} push(es) on {}", pushes.len(), branch);
    Ok(())
}
