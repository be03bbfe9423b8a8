//! Push, cursor and notification types.
//!
//! A push is one atomic submission of changesets to a branch. Within a branch,
//! pushes are identified by their final changeset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One push as reported by the upstream pushlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    /// Upstream-assigned push identifier. Breaks ties between equal dates.
    pub id: u64,
    /// Branch the push landed on.
    pub branch: String,
    /// Changesets in the push, oldest first. Never empty.
    pub changesets: Vec<String>,
    /// When the push happened upstream.
    pub date: DateTime<Utc>,
    /// When we first learned about the push.
    pub received: DateTime<Utc>,
}

impl Push {
    /// Build a push, rejecting empty changeset lists.
    pub fn new(
        id: u64,
        branch: impl Into<String>,
        changesets: Vec<String>,
        date: DateTime<Utc>,
        received: DateTime<Utc>,
    ) -> Option<Self> {
        if changesets.is_empty() {
            return None;
        }
        Some(Self {
            id,
            branch: branch.into(),
            changesets,
            date,
            received,
        })
    }

    /// The final changeset, which is also the branch cursor after this push.
    pub fn head(&self) -> &str {
        self.changesets.last().map(String::as_str).unwrap_or_default()
    }

    /// Sort key used everywhere pushes are ordered.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.date, self.id)
    }
}

/// Per-branch resume point: the last changeset already processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCursor {
    pub branch: String,
    pub after: Option<String>,
}

impl BranchCursor {
    pub fn new(branch: impl Into<String>, after: Option<String>) -> Self {
        Self {
            branch: branch.into(),
            after,
        }
    }

    pub fn advance(&mut self, push: &Push) {
        self.after = Some(push.head().to_string());
    }
}

/// A live change notification. Only a pointer: the pushlog is the source of
/// truth for the push it refers to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub rev: String,
    pub branch: String,
    pub revlink: String,
    pub received: DateTime<Utc>,
    pub raw: serde_json::Value,
}
