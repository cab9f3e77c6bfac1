use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use regsync_core::{AwardRecord, CatalogEntry, CatalogKind, DateWindow, EnrichedRecord, Fact};

use crate::error::StoreError;
use crate::store::{CallSnapshot, CanonicalStore};

#[derive(Debug, Default)]
struct State {
    catalog: BTreeMap<(CatalogKind, String), CatalogEntry>,
    calls: BTreeMap<String, CallSnapshot>,
    awards: BTreeMap<String, AwardRecord>,
}

impl State {
    fn fact(&self, award: &AwardRecord) -> Fact {
        Fact {
            award_id: award.id.clone(),
            subject: award.beneficiary_id.clone(),
            date: award.award_date,
            amount: award.amount.unwrap_or(0.0),
            dimension: award
                .call_id
                .as_ref()
                .and_then(|c| self.calls.get(c))
                .and_then(|c| c.organ_key.clone()),
        }
    }
}

/// Store kept in process memory, with the same upsert and conflict semantics
/// as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn upsert_call(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        let relations: BTreeSet<(CatalogKind, String)> = record
            .resolved_relations()
            .map(|(kind, key)| (kind, key.to_string()))
            .collect();
        let snapshot = CallSnapshot {
            id: record.id.clone(),
            subtype: record.subtype.clone(),
            received_on: record.received_on,
            title: record.title.clone(),
            budget: record.budget,
            organ_key: record.organ_key().map(str::to_string),
            relations: relations.into_iter().collect(),
        };
        self.write().calls.insert(record.id.clone(), snapshot);
        Ok(())
    }

    async fn call(&self, id: &str) -> Result<Option<CallSnapshot>, StoreError> {
        Ok(self.read().calls.get(id).cloned())
    }

    async fn call_count(&self) -> Result<u64, StoreError> {
        Ok(self.read().calls.len() as u64)
    }

    async fn upsert_catalog_entries(&self, entries: &[CatalogEntry]) -> Result<u64, StoreError> {
        let mut state = self.write();
        for entry in entries {
            state.catalog.insert((entry.kind, entry.key.clone()), entry.clone());
        }
        Ok(entries.len() as u64)
    }

    async fn catalog_entries(&self, kind: Option<CatalogKind>) -> Result<Vec<CatalogEntry>, StoreError> {
        Ok(self
            .read()
            .catalog
            .values()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect())
    }

    async fn awards_in_window(&self, window: &DateWindow) -> Result<Vec<AwardRecord>, StoreError> {
        Ok(self
            .read()
            .awards
            .values()
            .filter(|a| a.award_date.is_some_and(|d| window.contains(d)))
            .cloned()
            .collect())
    }

    async fn award(&self, id: &str) -> Result<Option<AwardRecord>, StoreError> {
        Ok(self.read().awards.get(id).cloned())
    }

    async fn award_count(&self) -> Result<u64, StoreError> {
        Ok(self.read().awards.len() as u64)
    }

    async fn insert_awards(&self, awards: &[AwardRecord]) -> Result<Vec<Fact>, StoreError> {
        let mut state = self.write();
        let mut inserted = Vec::new();
        for award in awards {
            if state.awards.contains_key(&award.id) {
                continue;
            }
            state.awards.insert(award.id.clone(), award.clone());
            inserted.push(state.fact(award));
        }
        Ok(inserted)
    }

    async fn update_awards(&self, awards: &[AwardRecord]) -> Result<Vec<(Fact, Fact)>, StoreError> {
        let mut state = self.write();
        let mut updated = Vec::new();
        for award in awards {
            let Some(old) = state.awards.get(&award.id).cloned() else {
                continue;
            };
            let old_fact = state.fact(&old);
            state.awards.insert(award.id.clone(), award.clone());
            updated.push((old_fact, state.fact(award)));
        }
        Ok(updated)
    }

    async fn delete_awards(&self, ids: &[String]) -> Result<Vec<Fact>, StoreError> {
        let mut state = self.write();
        let mut deleted = Vec::new();
        for id in ids {
            if let Some(award) = state.awards.remove(id) {
                deleted.push(state.fact(&award));
            }
        }
        Ok(deleted)
    }

    async fn facts(&self) -> Result<Vec<Fact>, StoreError> {
        let state = self.read();
        Ok(state.awards.values().map(|a| state.fact(a)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use regsync_core::{CallRelation, CatalogRef};

    fn award(id: &str, amount: f64) -> AwardRecord {
        AwardRecord {
            id: id.into(),
            call_id: Some("C1".into()),
            beneficiary_id: Some("B1".into()),
            amount: Some(amount),
            award_date: NaiveDate::from_ymd_opt(2024, 2, 1),
        }
    }

    fn call(relations: Vec<CallRelation>) -> EnrichedRecord {
        EnrichedRecord {
            id: "C1".into(),
            subtype: "C".into(),
            received_on: None,
            title: Some("Grants".into()),
            budget: Some(1000.0),
            organ: Some(CatalogRef::Resolved { key: "E1".into() }),
            relations,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_relations() {
        let store = MemoryStore::new();
        let fund = |k: &str| CallRelation {
            kind: CatalogKind::Fund,
            reference: CatalogRef::Resolved { key: k.into() },
        };
        store.upsert_call(&call(vec![fund("F1"), fund("F2")])).await.unwrap();
        store.upsert_call(&call(vec![fund("F3")])).await.unwrap();
        let snap = store.call("C1").await.unwrap().unwrap();
        assert_eq!(snap.relations, vec![(CatalogKind::Fund, "F3".to_string())]);
        assert_eq!(store.call_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_ignores_existing_and_facts_join_organ() {
        let store = MemoryStore::new();
        store.upsert_call(&call(vec![])).await.unwrap();
        let first = store.insert_awards(&[award("A", 10.0)]).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].dimension.as_deref(), Some("E1"));
        let second = store.insert_awards(&[award("A", 99.0)]).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.award("A").await.unwrap().unwrap().amount, Some(10.0));
    }

    #[tokio::test]
    async fn test_update_and_delete_report_facts() {
        let store = MemoryStore::new();
        store.insert_awards(&[award("A", 10.0)]).await.unwrap();
        let updated = store.update_awards(&[award("A", 20.0), award("Z", 1.0)]).await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].0.amount, 10.0);
        assert_eq!(updated[0].1.amount, 20.0);
        assert!(store.award("Z").await.unwrap().is_none());

        let deleted = store.delete_awards(&["A".to_string(), "A".to_string()]).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(store.award_count().await.unwrap(), 0);
    }
}
