use async_trait::async_trait;
use chrono::NaiveDate;
use regsync_core::{AwardRecord, CatalogEntry, CatalogKind, DateWindow, EnrichedRecord, Fact};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{CallSnapshot, CanonicalStore};

#[derive(Debug, sqlx::FromRow)]
struct FactRow {
    id: String,
    beneficiary_id: Option<String>,
    award_date: Option<NaiveDate>,
    amount: f64,
    organ_key: Option<String>,
}

impl From<FactRow> for Fact {
    fn from(row: FactRow) -> Self {
        Fact {
            award_id: row.id,
            subject: row.beneficiary_id,
            date: row.award_date,
            amount: row.amount,
            dimension: row.organ_key,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AwardRow {
    id: String,
    call_id: Option<String>,
    beneficiary_id: Option<String>,
    amount: Option<f64>,
    award_date: Option<NaiveDate>,
}

impl From<AwardRow> for AwardRecord {
    fn from(row: AwardRow) -> Self {
        AwardRecord {
            id: row.id,
            call_id: row.call_id,
            beneficiary_id: row.beneficiary_id,
            amount: row.amount,
            award_date: row.award_date,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CallRow {
    id: String,
    subtype: String,
    received_on: Option<NaiveDate>,
    title: Option<String>,
    budget: Option<f64>,
    organ_key: Option<String>,
}

const FACT_SELECT: &str =
    "SELECT a.id, a.beneficiary_id, a.award_date, COALESCE(a.amount, 0) AS amount, c.organ_key";

/// Column vectors for `UNNEST`-based batch statements.
struct AwardColumns {
    ids: Vec<String>,
    call_ids: Vec<Option<String>>,
    beneficiary_ids: Vec<Option<String>>,
    amounts: Vec<Option<f64>>,
    dates: Vec<Option<NaiveDate>>,
}

impl AwardColumns {
    fn from_awards(awards: &[AwardRecord]) -> Self {
        Self {
            ids: awards.iter().map(|a| a.id.clone()).collect(),
            call_ids: awards.iter().map(|a| a.call_id.clone()).collect(),
            beneficiary_ids: awards.iter().map(|a| a.beneficiary_id.clone()).collect(),
            amounts: awards.iter().map(|a| a.amount).collect(),
            dates: awards.iter().map(|a| a.award_date).collect(),
        }
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn facts_for(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[String],
    ) -> Result<Vec<Fact>, StoreError> {
        let sql = format!(
            "{FACT_SELECT} FROM award a LEFT JOIN call c ON c.id = a.call_id
             WHERE a.id = ANY($1) ORDER BY a.id"
        );
        let rows = sqlx::query_as::<_, FactRow>(&sql)
            .bind(ids)
            .fetch_all(&mut **tx)
            .await?;
        Ok(rows.into_iter().map(Fact::from).collect())
    }
}

#[async_trait]
impl CanonicalStore for PgStore {
    async fn upsert_call(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO call (id, subtype, received_on, title, budget, organ_key)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                 subtype = EXCLUDED.subtype,
                 received_on = EXCLUDED.received_on,
                 title = EXCLUDED.title,
                 budget = EXCLUDED.budget,
                 organ_key = EXCLUDED.organ_key,
                 updated_at = NOW()",
        )
        .bind(&record.id)
        .bind(&record.subtype)
        .bind(record.received_on)
        .bind(&record.title)
        .bind(record.budget)
        .bind(record.organ_key())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM call_relation WHERE call_id = $1")
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;

        let (kinds, keys): (Vec<&str>, Vec<&str>) = record
            .resolved_relations()
            .map(|(kind, key)| (kind.as_str(), key))
            .unzip();
        if !kinds.is_empty() {
            sqlx::query(
                "INSERT INTO call_relation (call_id, kind, catalog_key)
                 SELECT $1, k, v FROM UNNEST($2::text[], $3::text[]) AS r(k, v)
                 ON CONFLICT DO NOTHING",
            )
            .bind(&record.id)
            .bind(&kinds)
            .bind(&keys)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(call_id = %record.id, relations = kinds.len(), "call upserted");
        Ok(())
    }

    async fn call(&self, id: &str) -> Result<Option<CallSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, CallRow>(
            "SELECT id, subtype, received_on, title, budget, organ_key FROM call WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let rels: Vec<(String, String)> = sqlx::query_as(
            "SELECT kind, catalog_key FROM call_relation WHERE call_id = $1 ORDER BY kind, catalog_key",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let mut relations = Vec::with_capacity(rels.len());
        for (kind, key) in rels {
            let kind: CatalogKind = kind.parse().map_err(|_| StoreError::Invalid(kind))?;
            relations.push((kind, key));
        }
        relations.sort();

        Ok(Some(CallSnapshot {
            id: row.id,
            subtype: row.subtype,
            received_on: row.received_on,
            title: row.title,
            budget: row.budget,
            organ_key: row.organ_key,
            relations,
        }))
    }

    async fn call_count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM call").fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    async fn upsert_catalog_entries(&self, entries: &[CatalogEntry]) -> Result<u64, StoreError> {
        let kinds: Vec<&str> = entries.iter().map(|e| e.kind.as_str()).collect();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        let descriptions: Vec<&str> = entries.iter().map(|e| e.description.as_str()).collect();
        let parents: Vec<Option<&str>> = entries.iter().map(|e| e.parent_key.as_deref()).collect();

        let result = sqlx::query(
            "INSERT INTO catalog_entry (kind, key, description, parent_key)
             SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])
             ON CONFLICT (kind, key) DO UPDATE SET
                 description = EXCLUDED.description,
                 parent_key = EXCLUDED.parent_key",
        )
        .bind(&kinds)
        .bind(&keys)
        .bind(&descriptions)
        .bind(&parents)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn catalog_entries(&self, kind: Option<CatalogKind>) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT kind, key, description, parent_key FROM catalog_entry
             WHERE ($1::text IS NULL OR kind = $1)
             ORDER BY kind, key",
        )
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, key, description, parent_key)| {
                Ok(CatalogEntry {
                    kind: kind.parse().map_err(|_| StoreError::Invalid(kind))?,
                    key,
                    description,
                    parent_key,
                })
            })
            .collect()
    }

    async fn awards_in_window(&self, window: &DateWindow) -> Result<Vec<AwardRecord>, StoreError> {
        let rows = sqlx::query_as::<_, AwardRow>(
            "SELECT id, call_id, beneficiary_id, amount, award_date FROM award
             WHERE award_date >= $1 AND award_date <= $2",
        )
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AwardRecord::from).collect())
    }

    async fn award(&self, id: &str) -> Result<Option<AwardRecord>, StoreError> {
        let row = sqlx::query_as::<_, AwardRow>(
            "SELECT id, call_id, beneficiary_id, amount, award_date FROM award WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AwardRecord::from))
    }

    async fn award_count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM award").fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    async fn insert_awards(&self, awards: &[AwardRecord]) -> Result<Vec<Fact>, StoreError> {
        if awards.is_empty() {
            return Ok(Vec::new());
        }
        let cols = AwardColumns::from_awards(awards);
        let rows = sqlx::query_as::<_, FactRow>(
            "WITH ins AS (
                 INSERT INTO award (id, call_id, beneficiary_id, amount, award_date)
                 SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::float8[], $5::date[])
                 ON CONFLICT (id) DO NOTHING
                 RETURNING id, call_id, beneficiary_id, amount, award_date
             )
             SELECT a.id, a.beneficiary_id, a.award_date, COALESCE(a.amount, 0) AS amount, c.organ_key
             FROM ins a LEFT JOIN call c ON c.id = a.call_id",
        )
        .bind(&cols.ids)
        .bind(&cols.call_ids)
        .bind(&cols.beneficiary_ids)
        .bind(&cols.amounts)
        .bind(&cols.dates)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Fact::from).collect())
    }

    async fn update_awards(&self, awards: &[AwardRecord]) -> Result<Vec<(Fact, Fact)>, StoreError> {
        if awards.is_empty() {
            return Ok(Vec::new());
        }
        let cols = AwardColumns::from_awards(awards);
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM award WHERE id = ANY($1) FOR UPDATE")
            .bind(&cols.ids)
            .execute(&mut *tx)
            .await?;
        let old = Self::facts_for(&mut tx, &cols.ids).await?;

        sqlx::query(
            "UPDATE award a SET
                 call_id = n.call_id,
                 beneficiary_id = n.beneficiary_id,
                 amount = n.amount,
                 award_date = n.award_date,
                 updated_at = NOW()
             FROM UNNEST($1::text[], $2::text[], $3::text[], $4::float8[], $5::date[])
                  AS n(id, call_id, beneficiary_id, amount, award_date)
             WHERE a.id = n.id",
        )
        .bind(&cols.ids)
        .bind(&cols.call_ids)
        .bind(&cols.beneficiary_ids)
        .bind(&cols.amounts)
        .bind(&cols.dates)
        .execute(&mut *tx)
        .await?;

        let new = Self::facts_for(&mut tx, &cols.ids).await?;
        tx.commit().await?;

        Ok(old.into_iter().zip(new).collect())
    }

    async fn delete_awards(&self, ids: &[String]) -> Result<Vec<Fact>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, FactRow>(
            "WITH del AS (
                 DELETE FROM award WHERE id = ANY($1)
                 RETURNING id, call_id, beneficiary_id, amount, award_date
             )
             SELECT a.id, a.beneficiary_id, a.award_date, COALESCE(a.amount, 0) AS amount, c.organ_key
             FROM del a LEFT JOIN call c ON c.id = a.call_id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Fact::from).collect())
    }

    async fn facts(&self) -> Result<Vec<Fact>, StoreError> {
        let sql = format!("{FACT_SELECT} FROM award a LEFT JOIN call c ON c.id = a.call_id ORDER BY a.id");
        let rows = sqlx::query_as::<_, FactRow>(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Fact::from).collect())
    }
}
