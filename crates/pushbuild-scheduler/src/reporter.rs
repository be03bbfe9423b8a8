//! Build reports as structured tracing events.

use pushbuild_core::report::{BuildReport, Reporter};
use tracing::info;

/// Emits one event per report on the `pushbuild::report` target, so
/// subscribers can route reports separately from ordinary logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, report: &BuildReport) {
        let status = report.status.map(|s| s.to_string());
        let finished = report.finished.map(|t| t.to_rfc3339());
        info!(
            target: "pushbuild::report",
            event = %report.event,
            instance_id = %report.instance_id,
            worker_type = %report.worker_type,
            attempt = %report.attempt,
            branch = %report.branch,
            changeset = %report.changeset,
            status = status.as_deref(),
            clobber = report.clobber,
            clobbered = report.clobbered,
            buildlog = report.buildlog.as_deref(),
            pushed = %report.pushed.to_rfc3339(),
            received = %report.received.to_rfc3339(),
            started = %report.started.to_rfc3339(),
            finished = finished.as_deref(),
            "{} build for changeset {} on branch {}",
            if report.finished.is_some() { "Finished" } else { "Starting" },
            report.changeset,
            report.branch,
        );
    }
}
