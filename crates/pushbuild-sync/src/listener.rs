//! Background listener for live change notifications.
//!
//! A spawned task subscribes to the bus, acknowledges every message as soon
//! as it arrives, keeps the well-formed ones the filter accepts and hands
//! them to the foreground through an unbounded channel. The task is the only
//! producer; the owner of the [`NotificationListener`] is the only consumer.

use chrono::Utc;
use pushbuild_config::NotificationConfig;
use pushbuild_core::ResourceId;
use pushbuild_core::push::NotificationEvent;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusError, NotificationBus};

/// Properties marking a change as an echo from a repository poller.
const POLLER_PROPERTIES: &[&str] = &["polled_moz_revision", "polled_comm_revision"];

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub topic: String,
    /// How long [`NotificationListener::next`] waits for an event.
    pub poll_timeout: Duration,
    /// Keep only messages whose `_meta.master_name` contains this.
    pub master: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            topic: "change.#".to_string(),
            poll_timeout: Duration::from_secs(1),
            master: None,
        }
    }
}

impl From<&NotificationConfig> for ListenerConfig {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            poll_timeout: config.poll_timeout,
            master: config.master.clone(),
        }
    }
}

pub type NotificationFilter = Arc<dyn Fn(&NotificationEvent) -> bool + Send + Sync>;

pub struct NotificationListener {
    rx: mpsc::UnboundedReceiver<NotificationEvent>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    poll_timeout: Duration,
}

impl NotificationListener {
    /// Start listening immediately. Must be called inside a tokio runtime.
    pub fn start<F>(bus: Arc<dyn NotificationBus>, config: ListenerConfig, filter: F) -> Self
    where
        F: Fn(&NotificationEvent) -> bool + Send + Sync + 'static,
    {
        Self::start_with_token(bus, config, Arc::new(filter), CancellationToken::new())
    }

    /// Start listening until `shutdown` is cancelled.
    pub fn start_with_token(
        bus: Arc<dyn NotificationBus>,
        config: ListenerConfig,
        filter: NotificationFilter,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let poll_timeout = config.poll_timeout;
        let task = tokio::spawn(listen(bus, config, filter, tx, shutdown.clone()));

        Self {
            rx,
            shutdown,
            task: Some(task),
            poll_timeout,
        }
    }

    /// Wait up to the poll timeout for the next accepted notification.
    /// Returns `None` at once when shutdown is requested.
    pub async fn next(&mut self) -> Option<NotificationEvent> {
        let received = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return None,
            received = tokio::time::timeout(self.poll_timeout, self.rx.recv()) => received,
        };

        match received {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                // The task exited and dropped its sender.
                self.shutdown().await;
                None
            }
            Err(_) => {
                if !self.is_alive() {
                    self.shutdown().await;
                }
                None
            }
        }
    }

    /// Take every notification already queued, without waiting.
    pub fn drain_pending(&mut self) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Whether the background task is still running.
    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the background task and wait for it to exit. Once this returns
    /// no further notifications will be queued.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(e) = task.await {
            warn!(error = %e, "Notification listener task failed");
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn listen(
    bus: Arc<dyn NotificationBus>,
    config: ListenerConfig,
    filter: NotificationFilter,
    tx: mpsc::UnboundedSender<NotificationEvent>,
    shutdown: CancellationToken,
) {
    let label = ResourceId::new();
    info!(label = %label.short(), topic = %config.topic, "Starting notification listener");

    'connect: while !shutdown.is_cancelled() {
        let subscribed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break 'connect,
            subscribed = bus.subscribe(&config.topic) => subscribed,
        };
        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                debug!(error = %e, "Subscribe failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break 'connect,
                    _ = tokio::time::sleep(config.poll_timeout) => continue 'connect,
                }
            }
        };

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'connect,
                received = subscription.next_message(config.poll_timeout) => received,
            };
            match received {
                Ok(mut message) => {
                    message.ack();
                    let Some(event) =
                        parse_notification(&message.payload, config.master.as_deref())
                    else {
                        continue;
                    };
                    if filter(&event) && tx.send(event).is_err() {
                        // Receiver gone: nobody left to deliver to.
                        shutdown.cancel();
                    }
                }
                Err(BusError::Timeout) => {}
                Err(e) => {
                    debug!(error = %e, "Subscription failed, reconnecting");
                    continue 'connect;
                }
            }
        }
    }

    info!(label = %label.short(), "Notification listener stopped");
}

/// Extract a notification from a raw bus payload.
///
/// Expects `payload.change.{rev, branch, revlink}` as non-empty strings with
/// a hexadecimal `rev`. Poller echoes are rejected, as are messages from a
/// master other than `master` when one is given. Anything else is noise from
/// unrelated traffic and yields `None`.
pub fn parse_notification(data: &Value, master: Option<&str>) -> Option<NotificationEvent> {
    let change = data.get("payload")?.get("change")?;

    if let Some(master) = master {
        let name = data
            .get("_meta")
            .and_then(|m| m.get("master_name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !name.contains(master) {
            return None;
        }
    }

    let field = |name: &str| {
        change
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let revlink = field("revlink")?;
    let branch = field("branch")?;
    let rev = field("rev")?;
    if !rev.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    // Properties are [name, value, source] triples.
    let polled = change
        .get("properties")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| p.get(0).and_then(Value::as_str))
        .any(|name| POLLER_PROPERTIES.contains(&name));
    if polled {
        return None;
    }

    let mut raw = data.clone();
    if let Some(files) = raw
        .get_mut("payload")
        .and_then(|p| p.get_mut("change"))
        .and_then(|c| c.get_mut("files"))
    {
        *files = Value::Array(vec![Value::String("...".to_string())]);
    }

    Some(NotificationEvent {
        rev,
        branch,
        revlink,
        received: Utc::now(),
        raw,
    })
}
