use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

/// Process exit status reported by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success = 0,
    /// Completed, but at least one record or unit failed.
    Incidents = 1,
    /// Aborted before completing.
    Fatal = 2,
}

impl ExitStatus {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub command: String,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub incidents_file: Option<PathBuf>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub fatal: Option<String>,
}

impl RunSummary {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn fatal(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fatal: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    /// Folds another summary's counts into this one.
    pub fn absorb(&mut self, other: &RunSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        if self.incidents_file.is_none() {
            self.incidents_file = other.incidents_file.clone();
        }
        if self.fatal.is_none() {
            self.fatal = other.fatal.clone();
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 100.0;
        }
        self.succeeded as f64 * 100.0 / self.processed as f64
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.fatal.is_some() {
            ExitStatus::Fatal
        } else if self.failed > 0 {
            ExitStatus::Incidents
        } else {
            ExitStatus::Success
        }
    }

    pub fn log(&self) {
        let duration_ms = self.duration.as_millis() as u64;
        match (&self.fatal, self.failed) {
            (Some(err), _) => warn!(
                command = %self.command,
                processed = self.processed,
                duration_ms,
                error = %err,
                "run aborted"
            ),
            (None, 0) => info!(
                command = %self.command,
                processed = self.processed,
                succeeded = self.succeeded,
                duration_ms,
                "run completed"
            ),
            (None, failed) => warn!(
                command = %self.command,
                processed = self.processed,
                succeeded = self.succeeded,
                failed,
                success_rate = format!("{:.1}%", self.success_rate()),
                incidents = ?self.incidents_file,
                duration_ms,
                "run completed with incidents"
            ),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_mapping() {
        let mut s = RunSummary::new("run-stage");
        assert_eq!(s.exit_status(), ExitStatus::Success);
        s.record_success();
        s.record_failure();
        assert_eq!(s.exit_status(), ExitStatus::Incidents);
        assert_eq!(s.exit_status().code(), 1);
        assert_eq!(RunSummary::fatal("apply", "missing changeset").exit_status().code(), 2);
    }

    #[test]
    fn test_success_rate_and_absorb() {
        let mut total = RunSummary::new("run-pipeline");
        assert_eq!(total.success_rate(), 100.0);
        let mut part = RunSummary::new("extract");
        for _ in 0..3 {
            part.record_success();
        }
        part.record_failure();
        total.absorb(&part);
        assert_eq!(total.processed, 4);
        assert_eq!(total.success_rate(), 75.0);
    }

    #[test]
    fn test_summary_serializes_duration_as_ms() {
        let mut s = RunSummary::new("reconcile");
        s.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["duration"], 1500);
    }
}
