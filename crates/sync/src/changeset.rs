//! Immutable changeset files, one per reconciliation run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use regsync_core::fsio::read_json;
use regsync_core::{AwardRecord, DateWindow, PipelineError};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::SyncError;
use crate::reconcile::Classification;
use crate::runs::ChangeCounts;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: String,
    pub sync_run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub window: DateWindow,
    pub inserts: BTreeSet<String>,
    pub updates: BTreeSet<String>,
    pub deletes: BTreeSet<String>,
    /// Remote records for every id in `inserts` and `updates`.
    pub payloads: BTreeMap<String, AwardRecord>,
}

impl Changeset {
    pub fn new(
        sync_run_id: Uuid,
        window: DateWindow,
        classification: Classification,
        payloads: BTreeMap<String, AwardRecord>,
    ) -> Self {
        let created_at = Utc::now();
        let run = sync_run_id.simple().to_string();
        let id = format!("{}_{}", created_at.format("%Y%m%dT%H%M%S"), &run[..8]);
        let payloads = payloads
            .into_iter()
            .filter(|(id, _)| classification.inserts.contains(id) || classification.updates.contains(id))
            .collect();
        Self {
            id,
            sync_run_id,
            created_at,
            window,
            inserts: classification.inserts,
            updates: classification.updates,
            deletes: classification.deletes,
            payloads,
        }
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            insert: self.inserts.len() as u64,
            update: self.updates.len() as u64,
            delete: self.deletes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().total() == 0
    }

    /// Payloads for `ids`, in id order.
    pub fn payloads_for(&self, ids: &BTreeSet<String>) -> Result<Vec<AwardRecord>, PipelineError> {
        ids.iter()
            .map(|id| {
                self.payloads
                    .get(id)
                    .cloned()
                    .ok_or_else(|| PipelineError::validation(id, "changeset has no payload for id"))
            })
            .collect()
    }
}

/// Directory of `changeset_<id>.json` files. A written changeset is never
/// overwritten.
#[derive(Debug, Clone)]
pub struct ChangesetStore {
    dir: PathBuf,
}

impl ChangesetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("changeset_{}.json", id))
    }

    /// Writes to a temporary file and hard-links it into place, so the final
    /// name either holds a complete changeset or does not exist.
    pub fn write(&self, changeset: &Changeset) -> Result<PathBuf, SyncError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(&changeset.id);
        let tmp = self.dir.join(format!(".changeset_{}.tmp", changeset.id));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(changeset)?)?;
            file.sync_all()?;
        }
        let linked = fs::hard_link(&tmp, &path);
        fs::remove_file(&tmp)?;
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SyncError::ChangesetExists(changeset.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            changeset_id = %changeset.id,
            sync_run_id = %changeset.sync_run_id,
            counts = %changeset.counts(),
            path = %path.display(),
            "changeset written"
        );
        Ok(path)
    }

    pub fn read(&self, id: &str) -> Result<Changeset, SyncError> {
        let path = self.path(id);
        if !path.exists() {
            return Err(SyncError::ChangesetNotFound(id.to_string()));
        }
        Ok(read_json(&path)?)
    }

    /// Ids of stored changesets, oldest first.
    pub fn list(&self) -> Result<Vec<String>, SyncError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_prefix("changeset_").and_then(|n| n.strip_suffix(".json")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
