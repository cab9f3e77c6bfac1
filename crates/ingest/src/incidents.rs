//! Per-run JSON-lines incident log. The file is created on the first
//! incident; a run without incidents leaves no file behind.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use regsync_core::{ErrorClass, PipelineError};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub record_id: String,
    pub unit: Option<String>,
    pub class: ErrorClass,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl Incident {
    pub fn new(record_id: impl Into<String>, error: &PipelineError) -> Self {
        Self {
            record_id: record_id.into(),
            unit: None,
            class: error.class(),
            reason: error.to_string(),
            attempted: None,
            at: Utc::now(),
        }
    }

    pub fn unit(mut self, unit: impl ToString) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn attempted(mut self, values: serde_json::Value) -> Self {
        self.attempted = Some(values);
        self
    }
}

#[derive(Debug)]
pub struct IncidentLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    count: AtomicU64,
}

impl IncidentLog {
    /// `dir/<timestamp>_<label>.jsonl`.
    pub fn new(dir: &Path, label: &str) -> Self {
        let name = format!("{}_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"), label);
        Self::at(dir.join(name))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
            count: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Appends one incident. Write failures are logged, never propagated.
    pub fn record(&self, incident: Incident) {
        warn!(
            record_id = %incident.record_id,
            unit = incident.unit.as_deref().unwrap_or("-"),
            class = %incident.class,
            reason = %incident.reason,
            "incident recorded"
        );
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.append(&incident) {
            warn!(path = %self.path.display(), error = %e, "failed to write incident");
        }
    }

    fn append(&self, incident: &Incident) -> Result<(), PipelineError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            *guard = Some(BufWriter::new(file));
        }
        if let Some(writer) = guard.as_mut() {
            serde_json::to_writer(&mut *writer, incident)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Flushes the log. Returns its path when incidents were written,
    /// otherwise removes any empty file and returns `None`.
    pub fn finish(&self) -> Result<Option<PathBuf>, PipelineError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
        }
        if self.count() > 0 {
            return Ok(Some(self.path.clone()));
        }
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_log_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let log = IncidentLog::new(dir.path(), "run-stage");
        assert_eq!(log.finish().unwrap(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_incidents_are_jsonl() {
        let dir = TempDir::new().unwrap();
        let log = IncidentLog::at(dir.path().join("incidents/run.jsonl"));
        let err = PipelineError::validation("9", "missing id");
        log.record(Incident::new("9", &err).unit("call/2024-01/C/transform"));
        log.record(
            Incident::new("10", &PipelineError::TransientNetwork("timeout".into()))
                .attempted(serde_json::json!({ "id": "10" })),
        );
        let path = log.finish().unwrap().unwrap();
        let lines: Vec<Incident> = fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].class, ErrorClass::Validation);
        assert_eq!(lines[1].attempted.as_ref().unwrap()["id"], "10");
    }
}
