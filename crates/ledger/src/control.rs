//! Per-record checkpoints for one `(entity, year)`, kept as a JSON-lines file
//! that is rewritten atomically on every update.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use regsync_core::fsio::{read_jsonl, write_jsonl_atomic};
use regsync_core::{ControlRecord, ControlStatus, ListingItem, Period};
use tracing::debug;

use crate::error::LedgerError;

/// Records of one control file, indexed by external id.
#[derive(Debug, Clone, Default)]
pub struct ControlList {
    records: Vec<ControlRecord>,
    index: HashMap<String, usize>,
}

impl ControlList {
    pub fn from_records(records: Vec<ControlRecord>) -> Self {
        let mut list = Self::default();
        for record in records {
            list.upsert(record);
        }
        list
    }

    fn upsert(&mut self, record: ControlRecord) {
        match self.index.get(&record.external_id) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.external_id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Adds listing items not yet tracked as `pending`. Existing records keep
    /// their state. Returns how many were added.
    pub fn seed<'a>(&mut self, period: Period, subtype: &str, items: impl IntoIterator<Item = &'a ListingItem>) -> usize {
        let mut added = 0;
        for item in items {
            if self.index.contains_key(&item.id) {
                continue;
            }
            self.upsert(ControlRecord::pending(item.id.clone(), period, subtype));
            added += 1;
        }
        added
    }

    pub fn get(&self, external_id: &str) -> Option<&ControlRecord> {
        self.index.get(external_id).map(|&i| &self.records[i])
    }

    pub fn get_mut(&mut self, external_id: &str) -> Option<&mut ControlRecord> {
        self.index.get(external_id).map(|&i| &mut self.records[i])
    }

    /// Ids still to fetch for one `(period, subtype)`.
    pub fn pending_ids(&self, period: Period, subtype: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.period == period && r.subtype == subtype && r.status == ControlStatus::Pending)
            .map(|r| r.external_id.clone())
            .collect()
    }

    pub fn count(&self, period: Period, subtype: &str, status: ControlStatus) -> usize {
        self.records
            .iter()
            .filter(|r| r.period == period && r.subtype == subtype && r.status == status)
            .count()
    }

    pub fn records(&self) -> &[ControlRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Directory of control files. Updates to the same file are serialized.
#[derive(Debug)]
pub struct ControlLedger {
    dir: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl ControlLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self, entity: &str, year: i32) -> PathBuf {
        self.dir.join(format!("{}_{}.jsonl", entity, year))
    }

    fn file_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// `None` when the control file has not been created yet.
    pub fn load(&self, entity: &str, year: i32) -> Result<Option<ControlList>, LedgerError> {
        let records = read_jsonl(&self.path(entity, year))?;
        Ok(records.map(ControlList::from_records))
    }

    /// Load-modify-save under the file's lock. A missing file starts empty.
    pub async fn update<R>(
        &self,
        entity: &str,
        year: i32,
        f: impl FnOnce(&mut ControlList) -> R,
    ) -> Result<R, LedgerError> {
        let path = self.path(entity, year);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;

        let mut list = self.load(entity, year)?.unwrap_or_default();
        let out = f(&mut list);
        write_jsonl_atomic(&path, &list.records)?;
        debug!(path = %path.display(), records = list.len(), "control ledger saved");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn item(id: &str) -> ListingItem {
        ListingItem { id: id.into(), received_on: None, subtype: Some("C".into()) }
    }

    #[tokio::test]
    async fn test_seed_preserves_existing_state() {
        let dir = TempDir::new().unwrap();
        let ledger = ControlLedger::new(dir.path());
        let jan = Period::new(2024, 1).unwrap();

        let added = ledger
            .update("call", 2024, |list| list.seed(jan, "C", &[item("1"), item("2")]))
            .await
            .unwrap();
        assert_eq!(added, 2);

        ledger
            .update("call", 2024, |list| {
                if let Some(rec) = list.get_mut("1") {
                    rec.mark_extracted(Utc::now());
                }
            })
            .await
            .unwrap();

        let added = ledger
            .update("call", 2024, |list| list.seed(jan, "C", &[item("1"), item("2"), item("3")]))
            .await
            .unwrap();
        assert_eq!(added, 1);

        let list = ledger.load("call", 2024).unwrap().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get("1").unwrap().status, ControlStatus::Extracted);
        assert_eq!(list.pending_ids(jan, "C"), vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let ledger = ControlLedger::new(dir.path());
        assert!(ledger.load("call", 1999).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(ControlLedger::new(dir.path()));
        let mut handles = Vec::new();
        for month in 1..=12u32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let period = Period::new(2024, month).unwrap();
                let items = vec![item(&format!("m{}", month))];
                ledger.update("call", 2024, |list| list.seed(period, "C", &items)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ledger.load("call", 2024).unwrap().unwrap().len(), 12);
    }
}
