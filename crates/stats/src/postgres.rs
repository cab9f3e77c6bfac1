//! `aggregate_row` table backend. Deltas are single SQL statements so that
//! concurrent appliers never lose an increment.

use async_trait::async_trait;
use chrono::NaiveDate;
use regsync_core::{AggregateKey, AggregateRow};
use sqlx::PgPool;
use tracing::debug;

use crate::error::StatsError;
use crate::store::{AggregateDelta, AggregateStore};

const ROW_COLUMNS: &str = "subject, period, dimension, count, sum, average, min_date, max_date";

#[derive(Debug, sqlx::FromRow)]
struct Row {
    subject: String,
    period: i32,
    dimension: String,
    count: i64,
    sum: f64,
    average: f64,
    min_date: Option<NaiveDate>,
    max_date: Option<NaiveDate>,
}

impl From<Row> for AggregateRow {
    fn from(row: Row) -> Self {
        AggregateRow {
            key: AggregateKey {
                subject: row.subject,
                period: row.period,
                dimension: row.dimension,
            },
            count: row.count,
            sum: row.sum,
            average: row.average,
            min_date: row.min_date,
            max_date: row.max_date,
        }
    }
}

pub struct PgAggregateStore {
    pool: PgPool,
}

impl PgAggregateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn apply(&self, delta: &AggregateDelta) -> Result<bool, StatsError> {
        match delta {
            AggregateDelta::Add { key, amount, date } => {
                sqlx::query(
                    "INSERT INTO aggregate_row AS r (subject, period, dimension, count, sum, average, min_date, max_date)
                     VALUES ($1, $2, $3, 1, $4, $4, $5, $5)
                     ON CONFLICT (subject, period, dimension) DO UPDATE SET
                         count = r.count + 1,
                         sum = r.sum + EXCLUDED.sum,
                         average = (r.sum + EXCLUDED.sum) / (r.count + 1),
                         min_date = LEAST(r.min_date, EXCLUDED.min_date),
                         max_date = GREATEST(r.max_date, EXCLUDED.max_date)",
                )
                .bind(&key.subject)
                .bind(key.period)
                .bind(&key.dimension)
                .bind(amount)
                .bind(date)
                .execute(&self.pool)
                .await?;
                Ok(true)
            }
            AggregateDelta::Remove { key, amount } => {
                let mut tx = self.pool.begin().await?;
                let remaining: Option<i64> = sqlx::query_scalar(
                    "UPDATE aggregate_row SET
                         count = count - 1,
                         sum = GREATEST(sum - $4, 0),
                         average = CASE WHEN count - 1 > 0 THEN GREATEST(sum - $4, 0) / (count - 1) ELSE 0 END
                     WHERE subject = $1 AND period = $2 AND dimension = $3
                     RETURNING count",
                )
                .bind(&key.subject)
                .bind(key.period)
                .bind(&key.dimension)
                .bind(amount)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(remaining) = remaining else {
                    tx.rollback().await?;
                    return Ok(false);
                };
                if remaining <= 0 {
                    sqlx::query("DELETE FROM aggregate_row WHERE subject = $1 AND period = $2 AND dimension = $3")
                        .bind(&key.subject)
                        .bind(key.period)
                        .bind(&key.dimension)
                        .execute(&mut *tx)
                        .await?;
                    debug!(key = %key, "aggregate row removed");
                }
                tx.commit().await?;
                Ok(true)
            }
        }
    }

    async fn replace_all(&self, rows: &[AggregateRow]) -> Result<(), StatsError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM aggregate_row").execute(&mut *tx).await?;

        let subjects: Vec<&str> = rows.iter().map(|r| r.key.subject.as_str()).collect();
        let periods: Vec<i32> = rows.iter().map(|r| r.key.period).collect();
        let dimensions: Vec<&str> = rows.iter().map(|r| r.key.dimension.as_str()).collect();
        let counts: Vec<i64> = rows.iter().map(|r| r.count).collect();
        let sums: Vec<f64> = rows.iter().map(|r| r.sum).collect();
        let averages: Vec<f64> = rows.iter().map(|r| r.average).collect();
        let min_dates: Vec<Option<NaiveDate>> = rows.iter().map(|r| r.min_date).collect();
        let max_dates: Vec<Option<NaiveDate>> = rows.iter().map(|r| r.max_date).collect();
        sqlx::query(&format!(
            "INSERT INTO aggregate_row ({ROW_COLUMNS})
             SELECT * FROM UNNEST($1::text[], $2::int[], $3::text[], $4::bigint[],
                                  $5::float8[], $6::float8[], $7::date[], $8::date[])"
        ))
        .bind(&subjects)
        .bind(&periods)
        .bind(&dimensions)
        .bind(&counts)
        .bind(&sums)
        .bind(&averages)
        .bind(&min_dates)
        .bind(&max_dates)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &AggregateKey) -> Result<Option<AggregateRow>, StatsError> {
        let row = sqlx::query_as::<_, Row>(&format!(
            "SELECT {ROW_COLUMNS} FROM aggregate_row WHERE subject = $1 AND period = $2 AND dimension = $3"
        ))
        .bind(&key.subject)
        .bind(key.period)
        .bind(&key.dimension)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AggregateRow::from))
    }

    async fn all(&self) -> Result<Vec<AggregateRow>, StatsError> {
        let rows = sqlx::query_as::<_, Row>(&format!(
            "SELECT {ROW_COLUMNS} FROM aggregate_row ORDER BY subject, period, dimension"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AggregateRow::from).collect())
    }
}
