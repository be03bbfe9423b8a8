//! Build attempt records and the reporting sink.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::artifact::ArtifactRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

/// One build attempt for one push. At most two exist per push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAttempt {
    pub id: ResourceId,
    pub branch: String,
    pub changeset: String,
    /// Clean build requested by the dispatcher.
    pub clobber: bool,
    /// Clean build forced by the build system itself.
    pub clobbered: bool,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub status: AttemptStatus,
    pub buildlog: Option<ArtifactRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum ReportEvent {
    #[display("start")]
    Start,
    #[display("end")]
    End,
}

/// Structured record emitted at the start and end of every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub event: ReportEvent,
    pub instance_id: String,
    pub worker_type: String,
    pub attempt: ResourceId,
    pub branch: String,
    pub changeset: String,
    /// Only set on `End`.
    pub status: Option<AttemptStatus>,
    pub clobber: bool,
    pub clobbered: bool,
    /// Location of the persisted build log, if persisting succeeded.
    pub buildlog: Option<String>,
    pub pushed: DateTime<Utc>,
    pub received: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

/// Sink for build reports.
pub trait Reporter: Send + Sync {
    fn report(&self, report: &BuildReport);
}
