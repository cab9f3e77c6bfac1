//! Applies one changeset to the canonical store in batches.
//!
//! Inserts ignore rows that already exist, updates are last-writer-wins by
//! primary key and deletes remove by primary key, so replaying a changeset
//! after partial success converges to the same state. Applies over
//! overlapping windows must not run concurrently.
//!
//! Listeners are notified after each batch commits, so a failed listener
//! (or a crash between commit and notification) leaves them behind the
//! store. A run is marked `running` while it applies; applying a run that
//! is no longer `detected` ends with a listener resync.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use regsync_core::{FactChange, PipelineError};
use regsync_store::CanonicalStore;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::changeset::{Changeset, ChangesetStore};
use crate::error::SyncError;
use crate::runs::{ChangeCounts, SyncRunStatus, SyncRunStore};

const STALE_HINT: &str = "aggregates stale, run `regsync stats recompute`";

/// Receives the fact changes produced by each applied batch.
#[async_trait]
pub trait FactListener: Send + Sync {
    async fn on_changes(&self, changes: &[FactChange]) -> Result<(), PipelineError>;

    /// Rebuilds listener state from the store after an interrupted apply.
    async fn resync(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub changeset_id: String,
    pub sync_run_id: Uuid,
    pub dry_run: bool,
    pub planned: ChangeCounts,
    pub applied: ChangeCounts,
    /// First error; the apply stopped there.
    pub error: Option<String>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ApplyEngine {
    store: Arc<dyn CanonicalStore>,
    runs: Arc<dyn SyncRunStore>,
    changesets: ChangesetStore,
    batch_size: usize,
    listeners: Vec<Arc<dyn FactListener>>,
}

impl ApplyEngine {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        runs: Arc<dyn SyncRunStore>,
        changesets: ChangesetStore,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            runs,
            changesets,
            batch_size: batch_size.max(1),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn FactListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Applies the changeset `changeset_id` and records the outcome on the
    /// sync run that produced it. A dry run only reports planned counts.
    pub async fn apply(&self, changeset_id: &str, dry_run: bool) -> Result<ApplyReport, SyncError> {
        let started = Instant::now();
        let changeset = self.changesets.read(changeset_id)?;
        let mut report = ApplyReport {
            changeset_id: changeset.id.clone(),
            sync_run_id: changeset.sync_run_id,
            dry_run,
            planned: changeset.counts(),
            applied: ChangeCounts::default(),
            error: None,
        };
        if dry_run {
            info!(changeset_id, planned = %report.planned, "dry run, nothing applied");
            return Ok(report);
        }

        let mut run = self
            .runs
            .get(changeset.sync_run_id)
            .await?
            .ok_or(SyncError::RunNotFound(changeset.sync_run_id))?;

        let replay = run.status != SyncRunStatus::Detected;
        run.applying();
        self.runs.update(&run).await?;

        let mut outcome = self.apply_sets(&changeset, &mut report.applied).await;
        if outcome.is_ok() && replay {
            info!(changeset_id, sync_run_id = %run.id, "replayed run, resyncing listeners");
            outcome = self.resync().await;
        }
        match outcome {
            Ok(()) => run.completed(report.applied),
            Err(e) => {
                warn!(changeset_id, applied = %report.applied, error = %e, "apply stopped");
                report.error = Some(e.to_string());
                run.failed(report.applied, e.to_string());
            }
        }
        self.runs.update(&run).await?;

        info!(
            changeset_id,
            sync_run_id = %run.id,
            status = %run.status,
            planned = %report.planned,
            applied = %report.applied,
            duration_ms = started.elapsed().as_millis() as u64,
            "apply finished"
        );
        Ok(report)
    }

    async fn apply_sets(&self, changeset: &Changeset, applied: &mut ChangeCounts) -> Result<(), SyncError> {
        let inserts = changeset.payloads_for(&changeset.inserts)?;
        for batch in inserts.chunks(self.batch_size) {
            let facts = self.store.insert_awards(batch).await?;
            applied.insert += facts.len() as u64;
            let changes: Vec<FactChange> = facts.into_iter().map(FactChange::Inserted).collect();
            self.notify(&changes).await?;
        }

        let updates = changeset.payloads_for(&changeset.updates)?;
        for batch in updates.chunks(self.batch_size) {
            let pairs = self.store.update_awards(batch).await?;
            applied.update += pairs.len() as u64;
            let changes: Vec<FactChange> = pairs
                .into_iter()
                .map(|(old, new)| FactChange::Updated { old, new })
                .collect();
            self.notify(&changes).await?;
        }

        let deletes: Vec<String> = changeset.deletes.iter().cloned().collect();
        for batch in deletes.chunks(self.batch_size) {
            let facts = self.store.delete_awards(batch).await?;
            applied.delete += facts.len() as u64;
            let changes: Vec<FactChange> = facts.into_iter().map(FactChange::Deleted).collect();
            self.notify(&changes).await?;
        }
        Ok(())
    }

    async fn notify(&self, changes: &[FactChange]) -> Result<(), SyncError> {
        if changes.is_empty() {
            return Ok(());
        }
        for listener in &self.listeners {
            listener
                .on_changes(changes)
                .await
                .map_err(|e| SyncError::ListenerFailed(format!("{STALE_HINT}: {e}")))?;
        }
        Ok(())
    }

    async fn resync(&self) -> Result<(), SyncError> {
        for listener in &self.listeners {
            listener
                .resync()
                .await
                .map_err(|e| SyncError::ListenerFailed(format!("{STALE_HINT}: {e}")))?;
        }
        Ok(())
    }
}
