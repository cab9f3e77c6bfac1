//! Side channel for catalog descriptions that could not be resolved:
//! one sorted, deduplicated `pending/<kind>.txt` per catalog.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use regsync_core::fsio::write_atomic;
use regsync_core::{CatalogKind, PipelineError};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug)]
pub struct PendingCatalog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl PendingCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self, kind: CatalogKind) -> PathBuf {
        self.dir.join(format!("{}.txt", kind.as_str()))
    }

    pub fn read(&self, kind: CatalogKind) -> Result<BTreeSet<String>, PipelineError> {
        match fs::read_to_string(self.path(kind)) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends unseen values. Returns how many were new.
    pub async fn record<'a>(
        &self,
        kind: CatalogKind,
        values: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, PipelineError> {
        let _guard = self.lock.lock().await;
        let mut known = self.read(kind)?;
        let before = known.len();
        known.extend(
            values
                .into_iter()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        );
        let added = known.len() - before;
        if added > 0 {
            let mut body = known.into_iter().collect::<Vec<_>>().join("\n");
            body.push('\n');
            write_atomic(&self.path(kind), body.as_bytes())?;
            info!(kind = %kind, added, "pending catalog values recorded");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_dedupes_across_calls() {
        let dir = TempDir::new().unwrap();
        let pending = PendingCatalog::new(dir.path());
        assert_eq!(pending.record(CatalogKind::Fund, ["Moon Fund", "Sun Fund", "Moon Fund"]).await.unwrap(), 2);
        assert_eq!(pending.record(CatalogKind::Fund, ["Sun Fund", " ", "Star Fund"]).await.unwrap(), 1);
        let values: Vec<_> = pending.read(CatalogKind::Fund).unwrap().into_iter().collect();
        assert_eq!(values, vec!["Moon Fund", "Star Fund", "Sun Fund"]);
        assert!(!pending.path(CatalogKind::Region).exists());
    }
}
