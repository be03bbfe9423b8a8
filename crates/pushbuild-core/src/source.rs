//! Push sources feed the dispatcher one push at a time.

use async_trait::async_trait;

use crate::push::Push;

#[async_trait]
pub trait PushSource: Send {
    /// Wait a bounded time for the next push.
    ///
    /// `None` means nothing arrived in this poll window; check
    /// [`PushSource::is_exhausted`] to tell that apart from the end.
    async fn next_push(&mut self) -> Option<Push>;

    /// No further pushes will ever be produced.
    fn is_exhausted(&self) -> bool;

    /// Stop producing pushes. Returns once background work has finished.
    async fn shutdown(&mut self);
}
