use async_trait::async_trait;
use chrono::NaiveDate;
use regsync_core::{AggregateKey, AggregateRow, Fact};

use crate::error::StatsError;

/// One fact entering or leaving an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateDelta {
    Add {
        key: AggregateKey,
        amount: f64,
        date: Option<NaiveDate>,
    },
    Remove {
        key: AggregateKey,
        amount: f64,
    },
}

impl AggregateDelta {
    pub fn add(fact: &Fact) -> Option<Self> {
        Some(AggregateDelta::Add {
            key: fact.aggregate_key()?,
            amount: fact.amount,
            date: fact.date,
        })
    }

    pub fn remove(fact: &Fact) -> Option<Self> {
        Some(AggregateDelta::Remove {
            key: fact.aggregate_key()?,
            amount: fact.amount,
        })
    }

    pub fn key(&self) -> &AggregateKey {
        match self {
            AggregateDelta::Add { key, .. } | AggregateDelta::Remove { key, .. } => key,
        }
    }
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Applies one delta atomically. A removal that brings the count to zero
    /// deletes the row; a removal against a missing row is a no-op and
    /// returns `false`.
    async fn apply(&self, delta: &AggregateDelta) -> Result<bool, StatsError>;

    /// Replaces every row in one transaction.
    async fn replace_all(&self, rows: &[AggregateRow]) -> Result<(), StatsError>;

    async fn get(&self, key: &AggregateKey) -> Result<Option<AggregateRow>, StatsError>;

    /// Ordered by key.
    async fn all(&self) -> Result<Vec<AggregateRow>, StatsError>;
}
