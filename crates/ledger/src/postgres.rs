//! `work_unit` table backend.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... RETURNING`,
//! so selecting the candidate, locking it and moving it to `running` happen
//! in one statement and concurrent callers skip rows that are already taken.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regsync_core::{
    ClaimScope, LedgerSummary, Period, PeriodRange, Stage, StatusCount, UnitFilter, UnitStatus, WorkUnit,
};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::ledger::{bootstrap_keys, UnitLedger};

const UNIT_COLUMNS: &str =
    "id, entity, year, month, subtype, stage, status, retries, last_error, started_at, finished_at";

/// Filter predicate shared by claim, requeue, list and summary.
/// Binds: $1 entity, $2 year, $3 month, $4 subtype, $5 stage.
const FILTER_SQL: &str = "($1::text IS NULL OR w.entity = $1)
      AND ($2::int IS NULL OR w.year = $2)
      AND ($3::int IS NULL OR w.month = $3)
      AND ($4::text IS NULL OR w.subtype = $4)
      AND ($5::text IS NULL OR w.stage = $5)";

#[derive(Debug, sqlx::FromRow)]
struct UnitRow {
    id: i64,
    entity: String,
    year: i32,
    month: i32,
    subtype: String,
    stage: String,
    status: String,
    retries: i32,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<UnitRow> for WorkUnit {
    type Error = LedgerError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        let period = u32::try_from(row.month)
            .ok()
            .and_then(|m| Period::new(row.year, m))
            .ok_or_else(|| LedgerError::InvalidRow(format!("unit {} has month {}", row.id, row.month)))?;
        Ok(WorkUnit {
            id: row.id,
            entity: row.entity,
            period,
            subtype: row.subtype,
            stage: row.stage.parse()?,
            status: row.status.parse()?,
            retries: row.retries,
            last_error: row.last_error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn into_units(rows: Vec<UnitRow>) -> Result<Vec<WorkUnit>, LedgerError> {
    rows.into_iter().map(WorkUnit::try_from).collect()
}

pub struct PgUnitLedger {
    pool: PgPool,
}

impl PgUnitLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UnitLedger for PgUnitLedger {
    async fn bootstrap(
        &self,
        entity: &str,
        range: PeriodRange,
        subtypes: &[String],
        stages: &[Stage],
    ) -> Result<u64, LedgerError> {
        let keys = bootstrap_keys(entity, range, subtypes, stages);
        let mut entities = Vec::with_capacity(keys.len());
        let mut years = Vec::with_capacity(keys.len());
        let mut months = Vec::with_capacity(keys.len());
        let mut subs = Vec::with_capacity(keys.len());
        let mut stage_names = Vec::with_capacity(keys.len());
        for key in &keys {
            entities.push(key.entity.clone());
            years.push(key.period.year);
            months.push(key.period.month as i32);
            subs.push(key.subtype.clone());
            stage_names.push(key.stage.as_str().to_string());
        }

        let result = sqlx::query(
            "INSERT INTO work_unit (entity, year, month, subtype, stage)
             SELECT * FROM UNNEST($1::text[], $2::int[], $3::int[], $4::text[], $5::text[])
             ON CONFLICT (entity, year, month, subtype, stage) DO NOTHING",
        )
        .bind(&entities)
        .bind(&years)
        .bind(&months)
        .bind(&subs)
        .bind(&stage_names)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected();
        info!(entity, candidates = keys.len(), created, "ledger bootstrapped");
        Ok(created)
    }

    async fn claim(&self, scope: &ClaimScope) -> Result<Option<WorkUnit>, LedgerError> {
        let sql = format!(
            "UPDATE work_unit
             SET status = 'running', started_at = NOW(), finished_at = NULL
             WHERE id = (
                 SELECT w.id FROM work_unit w
                 WHERE w.status = 'pending'
                   AND {FILTER_SQL}
                   AND ($6::text IS NULL OR EXISTS (
                       SELECT 1 FROM work_unit p
                       WHERE p.entity = w.entity AND p.year = w.year AND p.month = w.month
                         AND p.subtype = w.subtype AND p.stage = $6 AND p.status = 'done'))
                 ORDER BY w.year, w.month, w.subtype
                 LIMIT 1
                 FOR UPDATE OF w SKIP LOCKED
             )
             AND status = 'pending'
             RETURNING {UNIT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(scope.entity.as_deref())
            .bind(scope.year)
            .bind(scope.month.map(|m| m as i32))
            .bind(scope.subtype.as_deref())
            .bind(scope.stage.as_str())
            .bind(scope.stage.predecessor().map(|s| s.as_str()))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let unit = WorkUnit::try_from(row)?;
                debug!(unit_id = unit.id, key = %unit.key(), "claimed work unit");
                Ok(Some(unit))
            }
            None => Ok(None),
        }
    }

    async fn count_claimable(&self, scope: &ClaimScope) -> Result<u64, LedgerError> {
        let sql = format!(
            "SELECT COUNT(*) FROM work_unit w
             WHERE w.status = 'pending'
               AND {FILTER_SQL}
               AND ($6::text IS NULL OR EXISTS (
                   SELECT 1 FROM work_unit p
                   WHERE p.entity = w.entity AND p.year = w.year AND p.month = w.month
                     AND p.subtype = w.subtype AND p.stage = $6 AND p.status = 'done'))"
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(scope.entity.as_deref())
            .bind(scope.year)
            .bind(scope.month.map(|m| m as i32))
            .bind(scope.subtype.as_deref())
            .bind(scope.stage.as_str())
            .bind(scope.stage.predecessor().map(|s| s.as_str()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn finish(&self, id: i64, success: bool, error: Option<&str>) -> Result<WorkUnit, LedgerError> {
        let sql = format!(
            "UPDATE work_unit
             SET status = CASE WHEN $2 THEN 'done' ELSE 'error' END,
                 retries = retries + CASE WHEN $2 THEN 0 ELSE 1 END,
                 last_error = CASE WHEN $2 THEN last_error ELSE $3 END,
                 finished_at = NOW()
             WHERE id = $1 AND status = 'running'
             RETURNING {UNIT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(id)
            .bind(success)
            .bind(error)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => WorkUnit::try_from(row),
            None => match self.get(id).await? {
                Some(unit) => Err(LedgerError::NotRunning { id, status: unit.status }),
                None => Err(LedgerError::NotFound(id)),
            },
        }
    }

    async fn requeue(&self, filter: &UnitFilter, include_running: bool) -> Result<u64, LedgerError> {
        let sql = format!(
            "UPDATE work_unit w
             SET status = 'pending', started_at = NULL, finished_at = NULL
             WHERE (w.status = 'error' OR ($6 AND w.status = 'running'))
               AND {FILTER_SQL}"
        );
        let result = sqlx::query(&sql)
            .bind(filter.entity.as_deref())
            .bind(filter.year)
            .bind(filter.month.map(|m| m as i32))
            .bind(filter.subtype.as_deref())
            .bind(filter.stage.map(|s| s.as_str()))
            .bind(include_running)
            .execute(&self.pool)
            .await?;
        let requeued = result.rows_affected();
        info!(requeued, include_running, "work units requeued");
        Ok(requeued)
    }

    async fn get(&self, id: i64) -> Result<Option<WorkUnit>, LedgerError> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_unit WHERE id = $1");
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkUnit::try_from).transpose()
    }

    async fn list(&self, filter: &UnitFilter) -> Result<Vec<WorkUnit>, LedgerError> {
        let sql = format!(
            "SELECT {UNIT_COLUMNS} FROM work_unit w
             WHERE {FILTER_SQL}
             ORDER BY w.year, w.month, w.subtype, w.stage"
        );
        let rows = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(filter.entity.as_deref())
            .bind(filter.year)
            .bind(filter.month.map(|m| m as i32))
            .bind(filter.subtype.as_deref())
            .bind(filter.stage.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        into_units(rows)
    }

    async fn summary(&self, filter: &UnitFilter) -> Result<LedgerSummary, LedgerError> {
        let sql = format!(
            "SELECT w.stage, w.status, COUNT(*) FROM work_unit w
             WHERE {FILTER_SQL}
             GROUP BY w.stage, w.status"
        );
        let rows: Vec<(String, String, i64)> = sqlx::query_as(&sql)
            .bind(filter.entity.as_deref())
            .bind(filter.year)
            .bind(filter.month.map(|m| m as i32))
            .bind(filter.subtype.as_deref())
            .bind(filter.stage.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for (stage, status, count) in rows {
            counts.push(StatusCount {
                stage: stage.parse()?,
                status: status.parse::<UnitStatus>()?,
                count,
            });
        }
        counts.sort_by_key(|c| (c.stage, c.status));
        Ok(LedgerSummary { counts })
    }
}
