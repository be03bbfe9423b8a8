//! Build dispatch for pushbuild.
//!
//! Pulls pushes from a [`PushSource`](pushbuild_core::source::PushSource)
//! one at a time, builds each with a normal then a clobber attempt, and
//! persists every attempt's build log.

pub mod reporter;
pub mod store;
pub mod worker;

pub use reporter::TracingReporter;
pub use store::FsArtifactStore;
pub use worker::{AttemptPlan, StopReason, Worker, WorkerHandle, WorkerOptions};
