//! KDL configuration parsing for pushbuild.
//!
//! One file describes a worker: its identity, the pushlog feed, the
//! notification endpoint, the tracked branches, how to build and where build
//! logs go.

pub mod error;
pub mod worker;

pub use error::{ConfigError, ConfigResult};
pub use worker::{
    BranchConfig, BuildConfig, FeedConfig, LogFormat, NotificationConfig, StoreConfig,
    WorkerConfig, WorkerIdentity, load_worker_config, parse_worker_config,
};
