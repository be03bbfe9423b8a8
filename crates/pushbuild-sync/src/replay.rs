//! Replays a recorded range of pushes at their original pace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pushbuild_core::push::Push;
use pushbuild_core::source::PushSource;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::info;

use crate::feed::{FeedQuery, PushFeed};

/// Hands out a fixed list of pushes, waiting between consecutive pushes for
/// as long as separated them upstream, but never longer than `max_delay`.
#[derive(Debug)]
pub struct PushReplayer {
    pushes: VecDeque<Push>,
    max_delay: Duration,
    last_date: Option<DateTime<Utc>>,
    stopped: bool,
}

impl PushReplayer {
    /// Fetch pushes on `branch` after `after`, up to and including `to`
    /// (the tip when `None`).
    pub async fn fetch(
        feed: &dyn PushFeed,
        branch: &str,
        after: &str,
        to: Option<&str>,
        max_delay: Duration,
    ) -> Self {
        let query = FeedQuery::Range {
            from: after.to_string(),
            to: to.map(str::to_string),
        };
        let pushes = feed.pushes(branch, &query).await;
        info!(branch = %branch, pushes = pushes.len(), "Replaying pushes");
        Self::from_pushes(pushes, max_delay)
    }

    pub fn from_pushes(mut pushes: Vec<Push>, max_delay: Duration) -> Self {
        pushes.sort_by_key(Push::order_key);
        Self {
            pushes: pushes.into(),
            max_delay,
            last_date: None,
            stopped: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.pushes.len()
    }

    fn delay_before(&self, push: &Push) -> Duration {
        self.last_date
            .and_then(|last| (push.date - last).to_std().ok())
            .unwrap_or_default()
            .min(self.max_delay)
    }
}

#[async_trait]
impl PushSource for PushReplayer {
    async fn next_push(&mut self) -> Option<Push> {
        if self.stopped {
            return None;
        }
        let delay = self.delay_before(self.pushes.front()?);
        if !delay.is_zero() {
            info!(seconds = delay.as_secs_f64(), "Waiting until next push");
            tokio::time::sleep(delay).await;
        }

        let mut push = self.pushes.pop_front()?;
        self.last_date = Some(push.date);
        push.received = Utc::now();
        Some(push)
    }

    fn is_exhausted(&self) -> bool {
        self.stopped || self.pushes.is_empty()
    }

    async fn shutdown(&mut self) {
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedFeed, push};

    #[tokio::test]
    async fn test_fetch_queries_range() {
        let feed = ScriptedFeed::new(vec![
            push(1, "try", &["a"], 100),
            push(2, "try", &["b"], 110),
            push(3, "try", &["c"], 120),
            push(4, "try", &["d"], 130),
        ]);

        let replayer =
            PushReplayer::fetch(&feed, "try", "a", Some("c"), Duration::from_millis(1)).await;
        assert_eq!(replayer.remaining(), 2);
        assert_eq!(
            feed.calls(),
            vec![(
                "try".to_string(),
                FeedQuery::Range {
                    from: "a".to_string(),
                    to: Some("c".to_string())
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_replays_in_order_then_exhausts() {
        let mut replayer = PushReplayer::from_pushes(
            vec![
                push(2, "try", &["b"], 200),
                push(1, "try", &["a"], 100),
                push(3, "try", &["c"], 200),
            ],
            Duration::from_millis(5),
        );

        let mut heads = Vec::new();
        while let Some(push) = replayer.next_push().await {
            heads.push(push.head().to_string());
        }
        assert_eq!(heads, vec!["a", "b", "c"]);
        assert!(replayer.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped() {
        let mut replayer = PushReplayer::from_pushes(
            vec![push(1, "try", &["a"], 0), push(2, "try", &["b"], 3600)],
            Duration::from_secs(30),
        );

        replayer.next_push().await.unwrap();
        let started = tokio::time::Instant::now();
        replayer.next_push().await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn test_shutdown_stops_replay() {
        let mut replayer = PushReplayer::from_pushes(
            vec![push(1, "try", &["a"], 0), push(2, "try", &["b"], 1)],
            Duration::ZERO,
        );

        replayer.shutdown().await;
        assert!(replayer.is_exhausted());
        assert!(replayer.next_push().await.is_none());
    }
}
