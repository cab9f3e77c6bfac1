//! Windowed diff of remote award fingerprints against the canonical store.
//!
//! Both sides are fetched per calendar month of the window. The engine only
//! classifies; it writes a changeset and a `sync_run` row and never touches
//! the awards themselves.
//!
//! A remote award that fails to parse is left out of both sides, so its
//! local copy is neither updated nor deleted. Undated awards cannot be
//! selected by window on the local side and are skipped on the remote side.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use regsync_core::{raw_record_id, AwardRecord, DateWindow, PipelineError};
use regsync_ingest::{fetch_listing, Dataset, PageQuery, RegistrySource};
use regsync_store::CanonicalStore;
use tracing::{debug, info, warn};

use crate::changeset::{Changeset, ChangesetStore};
use crate::error::SyncError;
use crate::fingerprint::{fingerprints, Fingerprints};
use crate::runs::{ChangeCounts, SyncRun, SyncRunStore};

/// Pairwise disjoint id sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub inserts: BTreeSet<String>,
    pub updates: BTreeSet<String>,
    pub deletes: BTreeSet<String>,
}

impl Classification {
    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            insert: self.inserts.len() as u64,
            update: self.updates.len() as u64,
            delete: self.deletes.len() as u64,
        }
    }
}

/// Remote-only ids are inserts, local-only ids are deletes, and shared ids
/// whose fingerprints differ are updates.
pub fn classify(remote: &Fingerprints, local: &Fingerprints) -> Classification {
    let mut out = Classification::default();
    for (id, hash) in remote {
        match local.get(id) {
            None => {
                out.inserts.insert(id.clone());
            }
            Some(local_hash) if local_hash != hash => {
                out.updates.insert(id.clone());
            }
            Some(_) => {}
        }
    }
    for id in local.keys() {
        if !remote.contains_key(id) {
            out.deletes.insert(id.clone());
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub run: SyncRun,
    pub changeset: Changeset,
    /// `None` on a dry run.
    pub path: Option<PathBuf>,
    pub remote_records: u64,
    pub local_records: u64,
    /// Remote records that could not be parsed.
    pub invalid: u64,
    /// Remote records without an award date.
    pub undated: u64,
}

pub struct Reconciler {
    source: Arc<dyn RegistrySource>,
    store: Arc<dyn CanonicalStore>,
    runs: Arc<dyn SyncRunStore>,
    changesets: ChangesetStore,
    page_size: u32,
    concurrency: usize,
}

#[derive(Default)]
struct Sides {
    remote: BTreeMap<String, AwardRecord>,
    local: Vec<AwardRecord>,
    /// Ids of unparsable remote records.
    skipped: BTreeSet<String>,
    undated: BTreeSet<String>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn RegistrySource>,
        store: Arc<dyn CanonicalStore>,
        runs: Arc<dyn SyncRunStore>,
        changesets: ChangesetStore,
        page_size: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            store,
            runs,
            changesets,
            page_size,
            concurrency,
        }
    }

    /// Detects changes inside `window`. A dry run neither records a
    /// `sync_run` nor writes the changeset.
    pub async fn reconcile(&self, window: DateWindow, dry_run: bool) -> Result<ReconcileReport, SyncError> {
        let started = Instant::now();
        let mut run = SyncRun::start(window);
        if !dry_run {
            self.runs.create(&run).await?;
        }
        info!(sync_run_id = %run.id, window = %window, dry_run, "reconciliation started");

        let sides = match self.collect(window).await {
            Ok(sides) => sides,
            Err(e) => {
                warn!(sync_run_id = %run.id, error = %e, "reconciliation failed");
                if !dry_run {
                    run.failed(ChangeCounts::default(), e.to_string());
                    self.runs.update(&run).await?;
                }
                return Err(e);
            }
        };

        let remote = fingerprints(sides.remote.values());
        let local = fingerprints(sides.local.iter().filter(|a| !sides.skipped.contains(&a.id)));
        let classification = classify(&remote, &local);
        let counts = classification.counts();
        let changeset = Changeset::new(run.id, window, classification, sides.remote);

        let path = if dry_run {
            None
        } else {
            match self.changesets.write(&changeset) {
                Ok(path) => Some(path),
                Err(e) => {
                    run.failed(ChangeCounts::default(), e.to_string());
                    self.runs.update(&run).await?;
                    return Err(e);
                }
            }
        };
        run.detected(counts, path.as_ref().map(|_| changeset.id.clone()));
        if !dry_run {
            self.runs.update(&run).await?;
        }

        info!(
            sync_run_id = %run.id,
            changeset_id = %changeset.id,
            remote = remote.len(),
            local = local.len(),
            invalid = sides.skipped.len(),
            undated = sides.undated.len(),
            detected = %counts,
            duration_ms = started.elapsed().as_millis() as u64,
            "reconciliation detected changes"
        );
        Ok(ReconcileReport {
            run,
            changeset,
            path,
            remote_records: remote.len() as u64,
            local_records: local.len() as u64,
            invalid: sides.skipped.len() as u64,
            undated: sides.undated.len() as u64,
        })
    }

    async fn collect(&self, window: DateWindow) -> Result<Sides, SyncError> {
        let mut sides = Sides::default();
        for (period, chunk) in window.chunks() {
            let query = PageQuery {
                dataset: Dataset::Awards,
                page: 0,
                page_size: self.page_size,
                date_from: chunk.from,
                date_to: chunk.to,
                subtype: None,
            };
            let items = fetch_listing(self.source.as_ref(), &query, self.concurrency).await?;
            let fetched = items.len();
            for value in items {
                let award = match serde_json::from_value::<AwardRecord>(value.clone()) {
                    Ok(award) => award,
                    Err(e) => {
                        let Some(id) = raw_record_id(&value) else {
                            return Err(PipelineError::validation("award", format!("remote award without id: {e}")).into());
                        };
                        warn!(period = %period, award_id = %id, error = %e, "invalid remote award skipped");
                        sides.remote.remove(&id);
                        sides.skipped.insert(id);
                        continue;
                    }
                };
                if sides.skipped.contains(&award.id) {
                    continue;
                }
                match award.award_date {
                    Some(d) if window.contains(d) => {
                        sides.remote.insert(award.id.clone(), award);
                    }
                    Some(_) => {
                        debug!(award_id = %award.id, "remote award outside window skipped");
                    }
                    None => {
                        warn!(award_id = %award.id, "remote award without date skipped");
                        sides.undated.insert(award.id);
                    }
                }
            }
            let local = self.store.awards_in_window(&chunk).await?;
            debug!(period = %period, remote = fetched, local = local.len(), "window chunk collected");
            sides.local.extend(local);
        }
        Ok(sides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> Fingerprints {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_insert_update_delete() {
        let remote = map(&[("A", "h1"), ("B", "h2"), ("C", "h3")]);
        let local = map(&[("B", "h2"), ("C", "h3x"), ("D", "h4")]);
        let out = classify(&remote, &local);
        assert_eq!(out.inserts, set(&["A"]));
        assert_eq!(out.deletes, set(&["D"]));
        assert_eq!(out.updates, set(&["C"]));
    }

    #[test]
    fn test_classify_sets_are_disjoint_and_cover_changes() {
        let remote = map(&[("1", "a"), ("2", "b"), ("3", "c"), ("5", "e")]);
        let local = map(&[("2", "b"), ("3", "x"), ("4", "d"), ("5", "y")]);
        let out = classify(&remote, &local);
        assert!(out.inserts.is_disjoint(&out.updates));
        assert!(out.inserts.is_disjoint(&out.deletes));
        assert!(out.updates.is_disjoint(&out.deletes));
        let changed: BTreeSet<_> = out.inserts.iter().chain(&out.updates).chain(&out.deletes).cloned().collect();
        // everything except the unchanged intersection
        assert_eq!(changed, set(&["1", "3", "4", "5"]));
    }

    #[test]
    fn test_identical_sides_produce_nothing() {
        let side = map(&[("A", "h1")]);
        assert_eq!(classify(&side, &side), Classification::default());
        assert_eq!(classify(&Fingerprints::new(), &Fingerprints::new()).counts().total(), 0);
    }
}
