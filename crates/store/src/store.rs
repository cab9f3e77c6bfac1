use async_trait::async_trait;
use chrono::NaiveDate;
use regsync_core::{AwardRecord, CatalogEntry, CatalogKind, DateWindow, EnrichedRecord, Fact};

use crate::error::StoreError;

/// A stored call with its relation set, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub id: String,
    pub subtype: String,
    pub received_on: Option<NaiveDate>,
    pub title: Option<String>,
    pub budget: Option<f64>,
    pub organ_key: Option<String>,
    /// Sorted by `(kind, key)`.
    pub relations: Vec<(CatalogKind, String)>,
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Upserts one call by id and replaces its relation set wholesale, in a
    /// single transaction. Unresolved references are stored as absent.
    async fn upsert_call(&self, record: &EnrichedRecord) -> Result<(), StoreError>;

    async fn call(&self, id: &str) -> Result<Option<CallSnapshot>, StoreError>;

    async fn call_count(&self) -> Result<u64, StoreError>;

    async fn upsert_catalog_entries(&self, entries: &[CatalogEntry]) -> Result<u64, StoreError>;

    /// All entries, or those of one kind.
    async fn catalog_entries(&self, kind: Option<CatalogKind>) -> Result<Vec<CatalogEntry>, StoreError>;

    /// Awards whose date falls inside the window.
    async fn awards_in_window(&self, window: &DateWindow) -> Result<Vec<AwardRecord>, StoreError>;

    async fn award(&self, id: &str) -> Result<Option<AwardRecord>, StoreError>;

    async fn award_count(&self) -> Result<u64, StoreError>;

    /// Inserts awards, ignoring ids that already exist. Returns the facts of
    /// the rows actually inserted.
    async fn insert_awards(&self, awards: &[AwardRecord]) -> Result<Vec<Fact>, StoreError>;

    /// Overwrites existing awards by id. Returns `(old, new)` facts for the
    /// rows that existed; unknown ids are skipped.
    async fn update_awards(&self, awards: &[AwardRecord]) -> Result<Vec<(Fact, Fact)>, StoreError>;

    /// Deletes awards by id. Returns the facts of the rows removed.
    async fn delete_awards(&self, ids: &[String]) -> Result<Vec<Fact>, StoreError>;

    /// Every award projected as a fact, joined with its call's organ.
    async fn facts(&self) -> Result<Vec<Fact>, StoreError>;
}
