use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use regsync_core::{AggregateKey, AggregateRow};

use crate::error::StatsError;
use crate::store::{AggregateDelta, AggregateStore};

#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    rows: RwLock<BTreeMap<AggregateKey, AggregateRow>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn apply(&self, delta: &AggregateDelta) -> Result<bool, StatsError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match delta {
            AggregateDelta::Add { key, amount, date } => {
                match rows.get_mut(key) {
                    Some(row) => row.add(*amount, *date),
                    None => {
                        rows.insert(key.clone(), AggregateRow::first(key.clone(), *amount, *date));
                    }
                }
                Ok(true)
            }
            AggregateDelta::Remove { key, amount } => {
                let Some(row) = rows.get_mut(key) else {
                    return Ok(false);
                };
                row.remove(*amount);
                if row.count <= 0 {
                    rows.remove(key);
                }
                Ok(true)
            }
        }
    }

    async fn replace_all(&self, new_rows: &[AggregateRow]) -> Result<(), StatsError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        *rows = new_rows.iter().map(|r| (r.key.clone(), r.clone())).collect();
        Ok(())
    }

    async fn get(&self, key: &AggregateKey) -> Result<Option<AggregateRow>, StatsError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(key).cloned())
    }

    async fn all(&self) -> Result<Vec<AggregateRow>, StatsError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn key() -> AggregateKey {
        AggregateKey { subject: "B1".into(), period: 2024, dimension: "E1".into() }
    }

    #[tokio::test]
    async fn test_last_removal_deletes_row() {
        let store = MemoryAggregateStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 2, 1);
        store.apply(&AggregateDelta::Add { key: key(), amount: 10.0, date }).await.unwrap();
        store.apply(&AggregateDelta::Add { key: key(), amount: 30.0, date: None }).await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap().unwrap().average, 20.0);

        store.apply(&AggregateDelta::Remove { key: key(), amount: 10.0 }).await.unwrap();
        store.apply(&AggregateDelta::Remove { key: key(), amount: 30.0 }).await.unwrap();
        assert!(store.get(&key()).await.unwrap().is_none());
        assert!(!store.apply(&AggregateDelta::Remove { key: key(), amount: 1.0 }).await.unwrap());
    }
}
