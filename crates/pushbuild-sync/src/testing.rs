//! Scripted feed shared by the sync tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pushbuild_core::push::Push;
use std::sync::Mutex;

use crate::feed::{FeedQuery, PushFeed};

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub(crate) fn push(id: u64, branch: &str, changesets: &[&str], date: i64) -> Push {
    Push::new(
        id,
        branch,
        changesets.iter().map(|c| c.to_string()).collect(),
        at(date),
        at(0),
    )
    .unwrap()
}

/// Answers queries from a fixed list of pushes, the way the pushlog would.
#[derive(Default)]
pub(crate) struct ScriptedFeed {
    pushes: Mutex<Vec<Push>>,
    /// Found by `Containing` but missing from every listing query, like a
    /// push the pushlog has recorded but not yet listed.
    unlisted: Mutex<Vec<Push>>,
    pub calls: Mutex<Vec<(String, FeedQuery)>>,
}

impl ScriptedFeed {
    pub fn new(pushes: Vec<Push>) -> Self {
        Self {
            pushes: Mutex::new(pushes),
            unlisted: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    pub fn add(&self, push: Push) {
        self.pushes.lock().unwrap().push(push);
    }

    pub fn add_unlisted(&self, push: Push) {
        self.unlisted.lock().unwrap().push(push);
    }

    pub fn calls(&self) -> Vec<(String, FeedQuery)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushFeed for ScriptedFeed {
    async fn pushes(&self, branch: &str, query: &FeedQuery) -> Vec<Push> {
        self.calls
            .lock()
            .unwrap()
            .push((branch.to_string(), query.clone()));

        let mut on_branch: Vec<Push> = self
            .pushes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.branch == branch)
            .cloned()
            .collect();
        on_branch.sort_by_key(Push::order_key);

        let position = |changeset: &str| {
            on_branch
                .iter()
                .position(|p| p.changesets.iter().any(|c| c == changeset))
        };

        match query {
            FeedQuery::After(None) => on_branch,
            FeedQuery::After(Some(from)) | FeedQuery::Range { from, to: None } => {
                match position(from) {
                    Some(i) => on_branch.split_off(i + 1),
                    None => on_branch,
                }
            }
            FeedQuery::Range {
                from,
                to: Some(to),
            } => {
                let start = position(from).map_or(0, |i| i + 1);
                let end = position(to).map_or(on_branch.len(), |i| i + 1);
                on_branch.get(start..end).map(<[Push]>::to_vec).unwrap_or_default()
            }
            FeedQuery::Containing(changeset) => on_branch
                .into_iter()
                .chain(self.unlisted.lock().unwrap().iter().cloned())
                .filter(|p| p.branch == branch)
                .filter(|p| p.changesets.iter().any(|c| c == changeset))
                .collect(),
        }
    }
}
