//! Push synchronization for pushbuild.
//!
//! Reconciles the pull-based pushlog feed with the push-based notification
//! bus into one ordered, deduplicated stream of pushes per tracked branch.

pub mod bus;
pub mod feed;
pub mod listener;
pub mod replay;
pub mod synchronizer;

#[cfg(test)]
mod testing;

pub use bus::{BroadcastBus, BusError, BusMessage, NotificationBus, Subscription, topic_matches};
pub use feed::{ChangesetFeed, FeedError, FeedQuery, PushFeed};
pub use listener::{ListenerConfig, NotificationFilter, NotificationListener};
pub use replay::PushReplayer;
pub use synchronizer::PushSynchronizer;
