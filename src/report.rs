/// JSON launch reports
use crate::executor::Launch;
use crate::types::{IsolationSet, LaunchOutcome, LaunchRequest};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Instant;

/// Summary of one launch attempt
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchReport {
    /// Unique identifier of this attempt
    pub launch_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub isolation: IsolationSet,
    pub hostname: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Wall clock time in seconds
    pub wall_time: f64,
    pub status: ReportStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Exited,
    Signaled,
    Failed,
}

impl LaunchReport {
    pub fn new(
        request: &LaunchRequest,
        outcome: &LaunchOutcome,
        started_at: DateTime<Utc>,
        wall_time: f64,
    ) -> Self {
        let (status, exit_code, signal, error) = match outcome {
            LaunchOutcome::Exited(code) => (ReportStatus::Exited, Some(*code), None, None),
            LaunchOutcome::Signaled { signal, .. } => {
                (ReportStatus::Signaled, None, Some(*signal), None)
            }
            LaunchOutcome::Failed(failure) => {
                (ReportStatus::Failed, None, None, Some(failure.to_string()))
            }
        };

        Self {
            launch_id: uuid::Uuid::new_v4().to_string(),
            program: request.program.clone(),
            args: request.args.clone(),
            isolation: request.isolation,
            hostname: request.hostname.clone(),
            started_at,
            wall_time,
            status,
            exit_code,
            signal,
            error,
        }
    }
}

/// Wraps a launcher and prints one JSON report per attempt to stderr
pub struct ReportingLauncher<L> {
    inner: L,
}

impl<L: Launch> ReportingLauncher<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }
}

impl<L: Launch> Launch for ReportingLauncher<L> {
    fn launch(&self, request: &LaunchRequest) -> LaunchOutcome {
        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = self.inner.launch(request);
        let report = LaunchReport::new(request, &outcome, started_at, start.elapsed().as_secs_f64());

        match serde_json::to_string(&report) {
            Ok(json) => {
                let mut stderr = std::io::stderr().lock();
                if let Err(e) = writeln!(stderr, "{}", json) {
                    warn!("failed to write launch report: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize launch report: {}", e),
        }
        outcome
    }
}
