//! `sync_run` audit rows: one per reconciliation, updated by the apply that
//! consumes its changeset.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regsync_core::{DateWindow, PipelineError};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Detected,
    Completed,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Detected => "detected",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncRunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncRunStatus::Running),
            "detected" => Ok(SyncRunStatus::Detected),
            "completed" => Ok(SyncRunStatus::Completed),
            "failed" => Ok(SyncRunStatus::Failed),
            other => Err(PipelineError::validation(other, "unknown sync run status")),
        }
    }
}

/// Insert/update/delete counts, detected or applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
}

impl ChangeCounts {
    pub fn total(&self) -> u64 {
        self.insert + self.update + self.delete
    }
}

impl fmt::Display for ChangeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "insert={} update={} delete={}", self.insert, self.update, self.delete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub window: DateWindow,
    pub status: SyncRunStatus,
    pub detected: ChangeCounts,
    pub applied: ChangeCounts,
    pub changeset_id: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    pub fn start(window: DateWindow) -> Self {
        Self {
            id: Uuid::new_v4(),
            window,
            status: SyncRunStatus::Running,
            detected: ChangeCounts::default(),
            applied: ChangeCounts::default(),
            changeset_id: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn detected(&mut self, counts: ChangeCounts, changeset_id: Option<String>) {
        self.status = SyncRunStatus::Detected;
        self.detected = counts;
        self.changeset_id = changeset_id;
    }

    /// An apply has started on this run.
    pub fn applying(&mut self) {
        self.status = SyncRunStatus::Running;
        self.finished_at = None;
    }

    /// Clears any error left by an earlier attempt.
    pub fn completed(&mut self, applied: ChangeCounts) {
        self.status = SyncRunStatus::Completed;
        self.applied = applied;
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Keeps the first error recorded on the run.
    pub fn failed(&mut self, applied: ChangeCounts, error: impl Into<String>) {
        self.status = SyncRunStatus::Failed;
        self.applied = applied;
        self.error.get_or_insert_with(|| error.into());
        self.finished_at = Some(Utc::now());
    }
}

#[async_trait]
pub trait SyncRunStore: Send + Sync {
    async fn create(&self, run: &SyncRun) -> Result<(), SyncError>;

    /// Overwrites status, counts, changeset id, error and finish time.
    async fn update(&self, run: &SyncRun) -> Result<(), SyncError>;

    async fn get(&self, id: Uuid) -> Result<Option<SyncRun>, SyncError>;

    /// Most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>, SyncError>;
}

// ── Postgres ──────────────────────────────────────────────────

const RUN_COLUMNS: &str = "id, window_from, window_to, status, detected_insert, detected_update, \
     detected_delete, applied_insert, applied_update, applied_delete, changeset_id, error, started_at, finished_at";

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    window_from: NaiveDate,
    window_to: NaiveDate,
    status: String,
    detected_insert: i64,
    detected_update: i64,
    detected_delete: i64,
    applied_insert: i64,
    applied_update: i64,
    applied_delete: i64,
    changeset_id: Option<String>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for SyncRun {
    type Error = SyncError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let count = |v: i64| u64::try_from(v).map_err(|_| SyncError::InvalidRow(format!("run {} has count {}", row.id, v)));
        Ok(SyncRun {
            id: row.id,
            window: DateWindow { from: row.window_from, to: row.window_to },
            status: row.status.parse()?,
            detected: ChangeCounts {
                insert: count(row.detected_insert)?,
                update: count(row.detected_update)?,
                delete: count(row.detected_delete)?,
            },
            applied: ChangeCounts {
                insert: count(row.applied_insert)?,
                update: count(row.applied_update)?,
                delete: count(row.applied_delete)?,
            },
            changeset_id: row.changeset_id,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

pub struct PgSyncRunStore {
    pool: PgPool,
}

impl PgSyncRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncRunStore for PgSyncRunStore {
    async fn create(&self, run: &SyncRun) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO sync_run (id, window_from, window_to, status, started_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id)
        .bind(run.window.from)
        .bind(run.window.to)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, run: &SyncRun) -> Result<(), SyncError> {
        let result = sqlx::query(
            "UPDATE sync_run SET status = $2,
                    detected_insert = $3, detected_update = $4, detected_delete = $5,
                    applied_insert = $6, applied_update = $7, applied_delete = $8,
                    changeset_id = $9, error = $10, finished_at = $11
             WHERE id = $1",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.detected.insert as i64)
        .bind(run.detected.update as i64)
        .bind(run.detected.delete as i64)
        .bind(run.applied.insert as i64)
        .bind(run.applied.update as i64)
        .bind(run.applied.delete as i64)
        .bind(&run.changeset_id)
        .bind(&run.error)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::RunNotFound(run.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SyncRun>, SyncError> {
        let row = sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM sync_run WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SyncRun::try_from).transpose()
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>, SyncError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_run ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncRun::try_from).collect()
    }
}

// ── In-memory ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemorySyncRunStore {
    runs: RwLock<BTreeMap<Uuid, SyncRun>>,
}

impl MemorySyncRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncRunStore for MemorySyncRunStore {
    async fn create(&self, run: &SyncRun) -> Result<(), SyncError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update(&self, run: &SyncRun) -> Result<(), SyncError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let slot = runs.get_mut(&run.id).ok_or(SyncError::RunNotFound(run.id))?;
        *slot = run.clone();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SyncRun>, SyncError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.get(&id).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>, SyncError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<SyncRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> DateWindow {
        DateWindow::months_back(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(), 3)
    }

    #[test]
    fn test_failed_keeps_first_error() {
        let mut run = SyncRun::start(window());
        run.failed(ChangeCounts::default(), "first");
        run.failed(ChangeCounts::default(), "second");
        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("first"));
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_completed_replay_clears_earlier_error() {
        let mut run = SyncRun::start(window());
        run.failed(ChangeCounts { insert: 1, update: 0, delete: 0 }, "listener down");
        run.applying();
        assert_eq!(run.status, SyncRunStatus::Running);
        assert!(run.finished_at.is_none());
        run.completed(ChangeCounts { insert: 0, update: 1, delete: 1 });
        assert_eq!(run.status, SyncRunStatus::Completed);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_update_requires_existing_run() {
        let store = MemorySyncRunStore::new();
        let mut run = SyncRun::start(window());
        assert!(matches!(store.update(&run).await, Err(SyncError::RunNotFound(_))));

        store.create(&run).await.unwrap();
        run.detected(ChangeCounts { insert: 2, update: 1, delete: 0 }, Some("cs".into()));
        store.update(&run).await.unwrap();
        let stored = store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Detected);
        assert_eq!(stored.detected.total(), 3);
        assert_eq!(store.recent(10).await.unwrap().len(), 1);
    }

    #[test]
    fn test_status_names() {
        for status in [SyncRunStatus::Running, SyncRunStatus::Detected, SyncRunStatus::Completed, SyncRunStatus::Failed] {
            assert_eq!(status.as_str().parse::<SyncRunStatus>().unwrap(), status);
        }
    }
}
