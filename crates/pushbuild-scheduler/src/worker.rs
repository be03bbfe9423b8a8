//! Worker that builds pushes one at a time.

use chrono::Utc;
use derive_more::Display;
use futures::FutureExt;
use pushbuild_config::{ConfigResult, WorkerConfig};
use pushbuild_core::ResourceId;
use pushbuild_core::artifact::{ArtifactRef, ArtifactStore};
use pushbuild_core::buildlog::BuildLog;
use pushbuild_core::executor::{BuildRequest, Builder};
use pushbuild_core::push::Push;
use pushbuild_core::report::{AttemptStatus, BuildAttempt, BuildReport, ReportEvent, Reporter};
use pushbuild_core::source::PushSource;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-worker settings that do not change between pushes.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub instance_id: String,
    pub worker_type: String,
    /// Stop after this long without a push. `None` never stops.
    pub max_idle: Option<Duration>,
    pub mozconfig: String,
    pub patch: Option<String>,
    pub tooltool_manifest: Option<String>,
}

impl WorkerOptions {
    /// Options from a worker configuration, reading the mozconfig and patch
    /// files it names.
    pub fn from_config(config: &WorkerConfig) -> ConfigResult<Self> {
        Ok(Self {
            instance_id: config.worker.instance_id.clone(),
            worker_type: config.worker.worker_type.clone(),
            max_idle: config.worker.max_idle,
            mozconfig: config.build.mozconfig_text()?,
            patch: config.build.patch_text()?,
            tooltool_manifest: config.build.tooltool_manifest.clone(),
        })
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StopReason {
    #[display("shutdown")]
    Shutdown,
    #[display("idle")]
    Idle,
    #[display("exhausted")]
    Exhausted,
}

/// Next step of the two-attempt build policy for one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPlan {
    /// Incremental build.
    Normal,
    /// Build again from a clean object directory.
    Clobber,
    Done,
}

impl AttemptPlan {
    /// Whether the planned attempt clobbers, or `None` when done.
    pub fn clobber(self) -> Option<bool> {
        match self {
            AttemptPlan::Normal => Some(false),
            AttemptPlan::Clobber => Some(true),
            AttemptPlan::Done => None,
        }
    }

    pub fn next(self, status: AttemptStatus) -> Self {
        match (self, status) {
            (AttemptPlan::Normal, AttemptStatus::Failed) => AttemptPlan::Clobber,
            _ => AttemptPlan::Done,
        }
    }
}

/// Stops a worker from another task.
#[derive(Debug, Clone, Default)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
}

impl WorkerHandle {
    /// Request a stop. Wakes a worker waiting for its next push but never
    /// interrupts a build in progress.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    async fn stopped(&self) {
        self.shutdown.cancelled().await
    }
}

/// Runs the attempts for one push and persists their logs.
struct BuildRunner {
    builder: Arc<dyn Builder>,
    store: Arc<dyn ArtifactStore>,
    reporter: Arc<dyn Reporter>,
    options: WorkerOptions,
}

impl BuildRunner {
    async fn process(&self, push: &Push) -> AttemptStatus {
        info!(branch = %push.branch, changeset = %push.head(), "Starting job");

        let mut plan = AttemptPlan::Normal;
        let mut status = AttemptStatus::Failed;
        while let Some(clobber) = plan.clobber() {
            status = self.attempt(push, clobber).await.status;
            plan = plan.next(status);
        }

        info!(branch = %push.branch, changeset = %push.head(), status = %status, "Finished job");
        status
    }

    async fn attempt(&self, push: &Push, clobber: bool) -> BuildAttempt {
        let id = ResourceId::new();
        let started = Utc::now();
        let start = BuildReport {
            event: ReportEvent::Start,
            instance_id: self.options.instance_id.clone(),
            worker_type: self.options.worker_type.clone(),
            attempt: id,
            branch: push.branch.clone(),
            changeset: push.head().to_string(),
            status: None,
            clobber,
            clobbered: false,
            buildlog: None,
            pushed: push.date,
            received: push.received,
            started,
            finished: None,
        };
        self.reporter.report(&start);

        let request = BuildRequest {
            branch: push.branch.clone(),
            changeset: push.head().to_string(),
            mozconfig: self.options.mozconfig.clone(),
            patch: self.options.patch.clone(),
            tooltool_manifest: self.options.tooltool_manifest.clone(),
            clobber,
        };

        let mut log = BuildLog::new();
        let result = AssertUnwindSafe(self.builder.build(&request, &mut log))
            .catch_unwind()
            .await;
        let (status, clobbered) = match result {
            Ok(Ok(outcome)) => (AttemptStatus::Success, outcome.clobbered),
            Ok(Err(e)) => {
                warn!(attempt = %id, clobber, error = %e, "Build failed");
                (AttemptStatus::Failed, e.clobbered())
            }
            Err(_) => {
                error!(attempt = %id, clobber, "Build panicked");
                (AttemptStatus::Failed, false)
            }
        };
        let finished = Utc::now();
        let buildlog = self.persist(&log).await;

        self.reporter.report(&BuildReport {
            event: ReportEvent::End,
            status: Some(status),
            clobbered,
            buildlog: buildlog.as_ref().map(|r| r.location.clone()),
            finished: Some(finished),
            ..start
        });

        BuildAttempt {
            id,
            branch: request.branch,
            changeset: request.changeset,
            clobber,
            clobbered,
            started,
            finished,
            status,
            buildlog,
        }
    }

    /// Store the log. A failure here loses the log but never the worker.
    async fn persist(&self, log: &BuildLog) -> Option<ArtifactRef> {
        let data = match log.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode build log");
                return None;
            }
        };
        match self.store.put(data).await {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!(error = %e, "Failed to store build log");
                None
            }
        }
    }
}

/// Pulls pushes from a source and builds each one, until shut down, idle
/// for longer than `max_idle`, or the source runs dry.
pub struct Worker {
    source: Box<dyn PushSource>,
    runner: BuildRunner,
    handle: WorkerHandle,
    idle_since: Instant,
    stop_reason: Option<StopReason>,
}

impl Worker {
    pub fn new(
        source: Box<dyn PushSource>,
        builder: Arc<dyn Builder>,
        store: Arc<dyn ArtifactStore>,
        reporter: Arc<dyn Reporter>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            source,
            runner: BuildRunner {
                builder,
                store,
                reporter,
                options,
            },
            handle: WorkerHandle::default(),
            idle_since: Instant::now(),
            stop_reason: None,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Stop at the next push boundary.
    pub fn shutdown(&mut self) {
        self.stop(StopReason::Shutdown);
    }

    fn stop(&mut self, reason: StopReason) {
        if self.handle.is_running() {
            info!(reason = %reason, "Shutting down worker");
            self.stop_reason = Some(reason);
            self.handle.shutdown();
        }
    }

    /// Wait for one push and build it. Returns whether the worker is still
    /// running.
    pub async fn run_once(&mut self) -> bool {
        if !self.handle.is_running() {
            return false;
        }

        let handle = self.handle.clone();
        let next = tokio::select! {
            biased;
            _ = handle.stopped() => return false,
            next = self.source.next_push() => next,
        };
        match next {
            Some(push) => {
                self.runner.process(&push).await;
                self.idle_since = Instant::now();
            }
            None if self.source.is_exhausted() => self.stop(StopReason::Exhausted),
            None => {
                let idle_for = self.idle_since.elapsed();
                if self.runner.options.max_idle.is_some_and(|max| idle_for > max) {
                    info!(idle_secs = idle_for.as_secs(), "Idle timeout exceeded");
                    self.stop(StopReason::Idle);
                }
            }
        }

        self.handle.is_running()
    }

    /// Run until stopped, then shut the source down.
    pub async fn run(mut self) -> StopReason {
        info!(
            instance_id = %self.runner.options.instance_id,
            worker_type = %self.runner.options.worker_type,
            "Starting worker"
        );

        while self.run_once().await {}
        self.source.shutdown().await;

        let reason = self.stop_reason.unwrap_or(StopReason::Shutdown);
        info!(reason = %reason, "Worker stopped");
        reason
    }
}
