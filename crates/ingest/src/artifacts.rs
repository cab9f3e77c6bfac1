//! Raw and enriched snapshot files, one per `(entity, subtype, year, month)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regsync_core::config::StorageConfig;
use regsync_core::fsio::{read_json, write_json_atomic};
use regsync_core::{EnrichedRecord, Period, PipelineError, RawRecord};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    raw_dir: PathBuf,
    enriched_dir: PathBuf,
}

fn file_name(entity: &str, subtype: &str, period: Period) -> String {
    format!("{}_{}_{:04}_{:02}.json", entity, subtype, period.year, period.month)
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, PipelineError> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

impl ArtifactStore {
    pub fn new(raw_dir: impl Into<PathBuf>, enriched_dir: impl Into<PathBuf>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            enriched_dir: enriched_dir.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(storage.raw_dir(), storage.enriched_dir())
    }

    pub fn raw_path(&self, entity: &str, subtype: &str, period: Period) -> PathBuf {
        self.raw_dir.join(file_name(entity, subtype, period))
    }

    pub fn enriched_path(&self, entity: &str, subtype: &str, period: Period) -> PathBuf {
        self.enriched_dir.join(file_name(entity, subtype, period))
    }

    pub fn read_raw(&self, entity: &str, subtype: &str, period: Period) -> Result<Option<Vec<RawRecord>>, PipelineError> {
        read_optional(&self.raw_path(entity, subtype, period))
    }

    /// Merges `records` into the raw artifact, deduplicating by external id.
    /// A re-fetched record replaces the stored copy in place. The artifact is
    /// written even when empty. Returns the record count after the merge.
    pub fn merge_raw(
        &self,
        entity: &str,
        subtype: &str,
        period: Period,
        records: Vec<RawRecord>,
    ) -> Result<usize, PipelineError> {
        let path = self.raw_path(entity, subtype, period);
        let mut merged: Vec<RawRecord> = read_optional(&path)?.unwrap_or_default();
        let mut index: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, r)| (r.external_id.clone(), i))
            .collect();

        for record in records {
            match index.get(&record.external_id) {
                Some(&i) => merged[i] = record,
                None => {
                    index.insert(record.external_id.clone(), merged.len());
                    merged.push(record);
                }
            }
        }

        write_json_atomic(&path, &merged)?;
        debug!(path = %path.display(), records = merged.len(), "raw artifact merged");
        Ok(merged.len())
    }

    pub fn read_enriched(
        &self,
        entity: &str,
        subtype: &str,
        period: Period,
    ) -> Result<Option<Vec<EnrichedRecord>>, PipelineError> {
        read_optional(&self.enriched_path(entity, subtype, period))
    }

    /// Replaces the enriched artifact.
    pub fn write_enriched(
        &self,
        entity: &str,
        subtype: &str,
        period: Period,
        records: &[EnrichedRecord],
    ) -> Result<PathBuf, PipelineError> {
        let path = self.enriched_path(entity, subtype, period);
        write_json_atomic(&path, &records)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn raw(id: &str, v: i64) -> RawRecord {
        RawRecord {
            external_id: id.into(),
            fetched_at: Utc::now(),
            payload: serde_json::json!({ "id": id, "v": v }),
        }
    }

    #[test]
    fn test_merge_raw_dedupes_by_id() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("raw"), dir.path().join("enriched"));
        let period = Period::new(2024, 2).unwrap();

        assert_eq!(store.merge_raw("call", "C", period, vec![raw("1", 1), raw("2", 1)]).unwrap(), 2);
        assert_eq!(store.merge_raw("call", "C", period, vec![raw("2", 2), raw("3", 1)]).unwrap(), 3);

        let records = store.read_raw("call", "C", period).unwrap().unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(records[1].payload["v"], 2);
    }

    #[test]
    fn test_empty_merge_still_writes_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("raw"), dir.path().join("enriched"));
        let period = Period::new(2024, 7).unwrap();
        assert!(store.read_raw("call", "O", period).unwrap().is_none());
        store.merge_raw("call", "O", period, Vec::new()).unwrap();
        assert_eq!(store.read_raw("call", "O", period).unwrap(), Some(Vec::new()));
        assert!(store.raw_path("call", "O", period).ends_with("call_O_2024_07.json"));
    }
}
