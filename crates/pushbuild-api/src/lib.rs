//! Notification ingestion API for pushbuild.
//!
//! Accepts change notifications over HTTP and publishes them on the
//! in-process bus the synchronizer listens to.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
