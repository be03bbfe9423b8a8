//! Merges pushlog catch-up with live notifications.
//!
//! On first use every tracked branch is queried for pushes after its cursor.
//! Notifications that arrived in the meantime are resolved against the
//! pushlog and folded into that batch, which is then handed out in date
//! order. After that, each live notification is resolved and handed out as
//! it arrives, without reordering.
//!
//! A push is identified within its branch by its final changeset and is
//! never handed out twice while it is among the branch's recent heads.

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use pushbuild_core::push::{BranchCursor, NotificationEvent, Push};
use pushbuild_core::source::PushSource;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::NotificationBus;
use crate::feed::{FeedQuery, PushFeed};
use crate::listener::{ListenerConfig, NotificationFilter, NotificationListener};

/// Heads remembered per branch for duplicate detection. Redeliveries arrive
/// shortly after the original, so older heads can be forgotten.
const RECENT_HEADS: usize = 1024;

/// Final changesets recently handed out on one branch, oldest first.
#[derive(Debug)]
struct RecentHeads {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentHeads {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember `head`, forgetting the oldest entry when full. Returns
    /// `false` if `head` was already remembered.
    fn insert(&mut self, head: &str) -> bool {
        if self.members.contains(head) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(head.to_string());
        self.members.insert(head.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug)]
struct BranchState {
    cursor: BranchCursor,
    /// Heads already handed out, plus the starting cursor.
    seen: RecentHeads,
}

pub struct PushSynchronizer {
    feed: Arc<dyn PushFeed>,
    branches: BTreeMap<String, BranchState>,
    listener: Option<NotificationListener>,
    pending: VecDeque<Push>,
    caught_up: bool,
    shutdown: CancellationToken,
}

impl PushSynchronizer {
    /// Synchronize the given branches, starting after each cursor.
    ///
    /// Without [`PushSynchronizer::listen`] only the catch-up batch is
    /// produced, after which the synchronizer reports exhaustion.
    pub fn new(feed: Arc<dyn PushFeed>, cursors: impl IntoIterator<Item = BranchCursor>) -> Self {
        let branches = cursors
            .into_iter()
            .map(|cursor| {
                let mut seen = RecentHeads::new(RECENT_HEADS);
                if let Some(after) = &cursor.after {
                    seen.insert(after);
                }
                (cursor.branch.clone(), BranchState { cursor, seen })
            })
            .collect();

        Self {
            feed,
            branches,
            listener: None,
            pending: VecDeque::new(),
            caught_up: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start listening for live notifications on the tracked branches.
    ///
    /// Call before the first push is requested so notifications arriving
    /// during catch-up are not missed.
    pub fn listen(mut self, bus: Arc<dyn NotificationBus>, config: ListenerConfig) -> Self {
        let tracked: HashSet<String> = self.branches.keys().cloned().collect();
        let filter: NotificationFilter =
            Arc::new(move |event: &NotificationEvent| tracked.contains(&event.branch));
        self.listener = Some(NotificationListener::start_with_token(
            bus,
            config,
            filter,
            self.shutdown.clone(),
        ));
        self
    }

    pub fn cursor(&self, branch: &str) -> Option<&BranchCursor> {
        self.branches.get(branch).map(|state| &state.cursor)
    }

    pub fn cursors(&self) -> impl Iterator<Item = &BranchCursor> {
        self.branches.values().map(|state| &state.cursor)
    }

    /// Token that stops the synchronizer, and its listener, from another
    /// task. Nothing more is handed out once it is cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Consume the synchronizer as a stream that ends on shutdown.
    pub fn into_stream(self) -> impl Stream<Item = Push> + Send {
        futures::stream::unfold(self, |mut sync| async move {
            loop {
                if let Some(push) = sync.next_push().await {
                    return Some((push, sync));
                }
                if sync.is_exhausted() {
                    sync.shutdown().await;
                    return None;
                }
            }
        })
    }

    async fn catch_up(&mut self) {
        let started = Utc::now();
        let mut batch: Vec<Push> = Vec::new();

        for (branch, state) in &self.branches {
            let query = FeedQuery::After(state.cursor.after.clone());
            let pushes = self.feed.pushes(branch, &query).await;
            debug!(branch = %branch, count = pushes.len(), "Fetched catch-up pushes");
            batch.extend(pushes.into_iter().map(|mut push| {
                push.received = started;
                push
            }));
        }

        let live = self
            .listener
            .as_mut()
            .map(NotificationListener::drain_pending)
            .unwrap_or_default();
        for event in &live {
            for push in resolve(self.feed.as_ref(), event).await {
                match batch
                    .iter_mut()
                    .find(|p| p.branch == push.branch && p.head() == push.head())
                {
                    Some(existing) => existing.received = existing.received.min(push.received),
                    None => batch.push(push),
                }
            }
        }

        batch.sort_by_key(Push::order_key);
        info!(
            pushes = batch.len(),
            branches = self.branches.len(),
            notifications = live.len(),
            "Catch-up complete"
        );

        self.pending.extend(batch);
        self.caught_up = true;
    }

    /// Record a push as handed out, or reject it as already seen.
    fn accept(&mut self, push: Push) -> Option<Push> {
        let state = self.branches.get_mut(&push.branch)?;
        if !state.seen.insert(push.head()) {
            debug!(branch = %push.branch, changeset = %push.head(), "Skipping duplicate push");
            return None;
        }
        state.cursor.advance(&push);
        Some(push)
    }

    fn next_pending(&mut self) -> Option<Push> {
        while let Some(push) = self.pending.pop_front() {
            if let Some(push) = self.accept(push) {
                return Some(push);
            }
        }
        None
    }
}

/// Look up the authoritative push records a notification points at.
async fn resolve(feed: &dyn PushFeed, event: &NotificationEvent) -> Vec<Push> {
    let pushes = feed
        .pushes(&event.branch, &FeedQuery::Containing(event.rev.clone()))
        .await;
    if pushes.is_empty() {
        debug!(branch = %event.branch, rev = %event.rev, "Notification not found in pushlog");
    }
    pushes
        .into_iter()
        .map(|mut push| {
            push.received = event.received;
            push
        })
        .collect()
}

#[async_trait]
impl PushSource for PushSynchronizer {
    async fn next_push(&mut self) -> Option<Push> {
        let shutdown = self.shutdown.clone();
        if shutdown.is_cancelled() {
            return None;
        }

        if !self.caught_up {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = self.catch_up() => {}
            }
        }
        if let Some(push) = self.next_pending() {
            return Some(push);
        }

        let event = self.listener.as_mut()?.next().await?;
        let resolved = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            resolved = resolve(self.feed.as_ref(), &event) => resolved,
        };
        self.pending.extend(resolved);
        self.next_pending()
    }

    fn is_exhausted(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return true;
        }
        self.pending.is_empty() && self.caught_up && self.listener.is_none()
    }

    async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(listener) = self.listener.as_mut() {
            listener.shutdown().await;
        }
    }
}
