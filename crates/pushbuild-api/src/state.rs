//! Application state.

use pushbuild_sync::BroadcastBus;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub bus: BroadcastBus,
    /// HMAC secret notifications must be signed with, if any.
    pub secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(bus: BroadcastBus, secret: Option<String>) -> Self {
        Self {
            bus,
            secret: secret.map(Arc::from),
        }
    }
}
