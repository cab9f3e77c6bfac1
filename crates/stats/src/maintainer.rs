//! Keeps aggregates in step with facts.
//!
//! Full recompute rebuilds every row from the current facts. The incremental
//! path turns each fact change into deltas; on removal the date bounds are
//! left as they were, so `min_date`/`max_date` may be wider than the facts
//! until the next full recompute.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use regsync_core::{AggregateKey, AggregateRow, Fact, FactChange, PipelineError};
use regsync_store::CanonicalStore;
use regsync_sync::FactListener;
use tracing::{debug, info, warn};

use crate::error::StatsError;
use crate::store::{AggregateDelta, AggregateStore};

/// Direct aggregation of `facts`. Facts without an aggregate key are skipped.
pub fn aggregate<'a>(facts: impl IntoIterator<Item = &'a Fact>) -> BTreeMap<AggregateKey, AggregateRow> {
    let mut rows: BTreeMap<AggregateKey, AggregateRow> = BTreeMap::new();
    for fact in facts {
        let Some(key) = fact.aggregate_key() else {
            continue;
        };
        match rows.get_mut(&key) {
            Some(row) => row.add(fact.amount, fact.date),
            None => {
                rows.insert(key.clone(), AggregateRow::first(key, fact.amount, fact.date));
            }
        }
    }
    rows
}

/// Deltas for one change. An update adds the new fact before removing the
/// old one, so a row whose only fact changes in place is never dropped.
pub fn deltas(change: &FactChange) -> Vec<AggregateDelta> {
    match change {
        FactChange::Inserted(fact) => AggregateDelta::add(fact).into_iter().collect(),
        FactChange::Deleted(fact) => AggregateDelta::remove(fact).into_iter().collect(),
        FactChange::Updated { old, new } => AggregateDelta::add(new)
            .into_iter()
            .chain(AggregateDelta::remove(old))
            .collect(),
    }
}

pub struct AggregateMaintainer {
    facts: Arc<dyn CanonicalStore>,
    aggregates: Arc<dyn AggregateStore>,
}

impl AggregateMaintainer {
    pub fn new(facts: Arc<dyn CanonicalStore>, aggregates: Arc<dyn AggregateStore>) -> Self {
        Self { facts, aggregates }
    }

    /// Clears and re-derives every aggregate. Returns the number of rows.
    pub async fn full_recompute(&self) -> Result<usize, StatsError> {
        let started = Instant::now();
        let facts = self.facts.facts().await?;
        let rows: Vec<AggregateRow> = aggregate(&facts).into_values().collect();
        self.aggregates.replace_all(&rows).await?;
        info!(
            facts = facts.len(),
            rows = rows.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "aggregates recomputed"
        );
        Ok(rows.len())
    }

    /// Applies the deltas of one fact change.
    pub async fn apply_change(&self, change: &FactChange) -> Result<(), StatsError> {
        for delta in deltas(change) {
            if !self.aggregates.apply(&delta).await? {
                warn!(key = %delta.key(), "removal against missing aggregate row ignored");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FactListener for AggregateMaintainer {
    async fn on_changes(&self, changes: &[FactChange]) -> Result<(), PipelineError> {
        for change in changes {
            self.apply_change(change).await?;
        }
        debug!(changes = changes.len(), "aggregates updated incrementally");
        Ok(())
    }

    async fn resync(&self) -> Result<(), PipelineError> {
        self.full_recompute().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fact(id: &str, amount: f64, day: u32, dimension: Option<&str>) -> Fact {
        Fact {
            award_id: id.into(),
            subject: Some("B1".into()),
            date: NaiveDate::from_ymd_opt(2024, 3, day),
            amount,
            dimension: dimension.map(str::to_string),
        }
    }

    #[test]
    fn test_aggregate_groups_by_key() {
        let facts = vec![
            fact("1", 10.0, 5, Some("E1")),
            fact("2", 30.0, 1, Some("E1")),
            fact("3", 99.0, 2, Some("E2")),
            fact("4", 50.0, 2, None),
        ];
        let rows = aggregate(&facts);
        assert_eq!(rows.len(), 2);
        let e1 = rows.values().find(|r| r.key.dimension == "E1").unwrap();
        assert_eq!(e1.count, 2);
        assert_eq!(e1.sum, 40.0);
        assert_eq!(e1.average, 20.0);
        assert_eq!(e1.min_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(e1.max_date, NaiveDate::from_ymd_opt(2024, 3, 5));
    }

    #[test]
    fn test_update_adds_before_removing() {
        let change = FactChange::Updated {
            old: fact("1", 10.0, 5, Some("E1")),
            new: fact("1", 12.0, 5, Some("E1")),
        };
        let out = deltas(&change);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], AggregateDelta::Add { amount, .. } if amount == 12.0));
        assert!(matches!(out[1], AggregateDelta::Remove { amount, .. } if amount == 10.0));
    }

    #[test]
    fn test_fact_without_key_has_no_deltas() {
        assert!(deltas(&FactChange::Inserted(fact("1", 1.0, 1, None))).is_empty());
    }
}
