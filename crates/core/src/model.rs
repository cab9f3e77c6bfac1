//! Domain records shared across the pipeline, the reconciliation engine and
//! the aggregate maintainer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::period::Period;

// ── Control ledger ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Pending,
    Extracted,
    Error,
}

/// Per-source-record checkpoint inside one `(entity, year)` control ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub external_id: String,
    pub period: Period,
    pub subtype: String,
    pub status: ControlStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries: u32,
}

impl ControlRecord {
    pub fn pending(external_id: impl Into<String>, period: Period, subtype: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            period,
            subtype: subtype.into(),
            status: ControlStatus::Pending,
            last_error: None,
            last_attempt: None,
            retries: 0,
        }
    }

    pub fn mark_extracted(&mut self, at: DateTime<Utc>) {
        self.status = ControlStatus::Extracted;
        self.last_error = None;
        self.last_attempt = Some(at);
    }

    /// Records a failed attempt; moves to `error` once `max_retries` is reached.
    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>, max_retries: u32) {
        self.retries += 1;
        self.last_error = Some(error.into());
        self.last_attempt = Some(at);
        self.status = if self.retries >= max_retries {
            ControlStatus::Error
        } else {
            ControlStatus::Pending
        };
    }
}

// ── Catalogs ──────────────────────────────────────────────────

/// Closed set of catalogs a call can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Organ,
    Instrument,
    BeneficiaryType,
    Sector,
    ProductSector,
    Region,
    Purpose,
    Objective,
    Regulation,
    Fund,
}

impl CatalogKind {
    pub const ALL: [CatalogKind; 10] = [
        CatalogKind::Organ,
        CatalogKind::Instrument,
        CatalogKind::BeneficiaryType,
        CatalogKind::Sector,
        CatalogKind::ProductSector,
        CatalogKind::Region,
        CatalogKind::Purpose,
        CatalogKind::Objective,
        CatalogKind::Regulation,
        CatalogKind::Fund,
    ];

    /// Kinds that appear as reference arrays on a call detail.
    pub const RELATIONS: [CatalogKind; 9] = [
        CatalogKind::Instrument,
        CatalogKind::BeneficiaryType,
        CatalogKind::Sector,
        CatalogKind::ProductSector,
        CatalogKind::Region,
        CatalogKind::Purpose,
        CatalogKind::Objective,
        CatalogKind::Regulation,
        CatalogKind::Fund,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::Organ => "organ",
            CatalogKind::Instrument => "instrument",
            CatalogKind::BeneficiaryType => "beneficiary_type",
            CatalogKind::Sector => "sector",
            CatalogKind::ProductSector => "product_sector",
            CatalogKind::Region => "region",
            CatalogKind::Purpose => "purpose",
            CatalogKind::Objective => "objective",
            CatalogKind::Regulation => "regulation",
            CatalogKind::Fund => "fund",
        }
    }

    /// Field name on the remote call detail.
    pub fn field(&self) -> &'static str {
        match self {
            CatalogKind::Organ => "organ",
            CatalogKind::Instrument => "instruments",
            CatalogKind::BeneficiaryType => "beneficiaryTypes",
            CatalogKind::Sector => "sectors",
            CatalogKind::ProductSector => "productSectors",
            CatalogKind::Region => "regions",
            CatalogKind::Purpose => "purposes",
            CatalogKind::Objective => "objectives",
            CatalogKind::Regulation => "regulations",
            CatalogKind::Fund => "funds",
        }
    }

    /// Region, sector and organ catalogs are trees.
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, CatalogKind::Organ | CatalogKind::Region | CatalogKind::Sector)
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CatalogKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PipelineError::validation(s, "unknown catalog kind"))
    }
}

/// One row of a catalog table as stored canonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub kind: CatalogKind,
    pub key: String,
    pub description: String,
    pub parent_key: Option<String>,
}

/// Outcome of resolving one embedded reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CatalogRef {
    Resolved { key: String },
    Unresolved { raw: String },
}

impl CatalogRef {
    pub fn key(&self) -> Option<&str> {
        match self {
            CatalogRef::Resolved { key } => Some(key),
            CatalogRef::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, CatalogRef::Resolved { .. })
    }
}

// ── Remote payloads ───────────────────────────────────────────

/// Entry of the paginated call listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingItem {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub received_on: Option<NaiveDate>,
    #[serde(default)]
    pub subtype: Option<String>,
}

/// Catalog reference item embedded in a call detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganPath {
    #[serde(default)]
    pub level1: Option<String>,
    #[serde(default)]
    pub level2: Option<String>,
    #[serde(default)]
    pub level3: Option<String>,
}

impl OrganPath {
    /// Non-empty levels from the root down.
    pub fn levels(&self) -> Vec<&str> {
        [&self.level1, &self.level2, &self.level3]
            .into_iter()
            .filter_map(|l| l.as_deref())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Full call detail as served by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDetail {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub received_on: Option<NaiveDate>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "de_opt_amount")]
    pub budget: Option<f64>,
    #[serde(default)]
    pub organ: Option<OrganPath>,
    #[serde(default)]
    pub instruments: Vec<ReferenceItem>,
    #[serde(default)]
    pub beneficiary_types: Vec<ReferenceItem>,
    #[serde(default)]
    pub sectors: Vec<ReferenceItem>,
    #[serde(default)]
    pub product_sectors: Vec<ReferenceItem>,
    #[serde(default)]
    pub regions: Vec<ReferenceItem>,
    #[serde(default)]
    pub purposes: Vec<ReferenceItem>,
    #[serde(default)]
    pub objectives: Vec<ReferenceItem>,
    #[serde(default)]
    pub regulations: Vec<ReferenceItem>,
    #[serde(default)]
    pub funds: Vec<ReferenceItem>,
}

impl CallDetail {
    pub fn references(&self, kind: CatalogKind) -> &[ReferenceItem] {
        match kind {
            CatalogKind::Organ => &[],
            CatalogKind::Instrument => &self.instruments,
            CatalogKind::BeneficiaryType => &self.beneficiary_types,
            CatalogKind::Sector => &self.sectors,
            CatalogKind::ProductSector => &self.product_sectors,
            CatalogKind::Region => &self.regions,
            CatalogKind::Purpose => &self.purposes,
            CatalogKind::Objective => &self.objectives,
            CatalogKind::Regulation => &self.regulations,
            CatalogKind::Fund => &self.funds,
        }
    }
}

/// Ids arrive either as JSON numbers or strings.
fn id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The `id` of a raw record, readable even when the rest of it is not.
pub fn raw_record_id(record: &serde_json::Value) -> Option<String> {
    record.get("id").and_then(id_from_value)
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    id_from_value(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {value}")))
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<serde_json::Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(id_from_value))
}

/// Amounts arrive as JSON numbers or numeric strings; blank strings count as missing.
fn de_opt_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid amount: {s:?}"))),
        Some(other) => Err(serde::de::Error::custom(format!("invalid amount: {other}"))),
    }
}

// ── Artifacts ─────────────────────────────────────────────────

/// One fetched record inside a raw artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub external_id: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRelation {
    pub kind: CatalogKind,
    pub reference: CatalogRef,
}

/// A call with every catalog reference resolved (or kept unresolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub id: String,
    pub subtype: String,
    pub received_on: Option<NaiveDate>,
    pub title: Option<String>,
    pub budget: Option<f64>,
    pub organ: Option<CatalogRef>,
    pub relations: Vec<CallRelation>,
}

impl EnrichedRecord {
    pub fn organ_key(&self) -> Option<&str> {
        self.organ.as_ref().and_then(CatalogRef::key)
    }

    /// Resolved relation keys; unresolved ones load as absent.
    pub fn resolved_relations(&self) -> impl Iterator<Item = (CatalogKind, &str)> {
        self.relations
            .iter()
            .filter_map(|r| r.reference.key().map(|k| (r.kind, k)))
    }

    pub fn unresolved(&self) -> impl Iterator<Item = (CatalogKind, &str)> {
        let organ = self.organ.iter().filter_map(|r| match r {
            CatalogRef::Unresolved { raw } => Some((CatalogKind::Organ, raw.as_str())),
            CatalogRef::Resolved { .. } => None,
        });
        let rel = self.relations.iter().filter_map(|r| match &r.reference {
            CatalogRef::Unresolved { raw } => Some((r.kind, raw.as_str())),
            CatalogRef::Resolved { .. } => None,
        });
        organ.chain(rel)
    }
}

// ── Awards and aggregates ─────────────────────────────────────

/// Grant award, the reconciled fact entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardRecord {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub call_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub beneficiary_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_amount")]
    pub amount: Option<f64>,
    #[serde(default)]
    pub award_date: Option<NaiveDate>,
}

/// Aggregate-relevant projection of an award.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub award_id: String,
    pub subject: Option<String>,
    pub date: Option<NaiveDate>,
    pub amount: f64,
    /// Organ key of the award's call.
    pub dimension: Option<String>,
}

impl Fact {
    /// The aggregate this fact contributes to, if any.
    pub fn aggregate_key(&self) -> Option<AggregateKey> {
        Some(AggregateKey {
            subject: self.subject.clone()?,
            period: self.date?.year(),
            dimension: self.dimension.clone()?,
        })
    }
}

/// Change to one fact, as produced by the apply engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FactChange {
    Inserted(Fact),
    Updated { old: Fact, new: Fact },
    Deleted(Fact),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub subject: String,
    pub period: i32,
    pub dimension: String,
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subject, self.period, self.dimension)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub key: AggregateKey,
    pub count: i64,
    pub sum: f64,
    pub average: f64,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

impl AggregateRow {
    pub fn first(key: AggregateKey, amount: f64, date: Option<NaiveDate>) -> Self {
        Self {
            key,
            count: 1,
            sum: amount,
            average: amount,
            min_date: date,
            max_date: date,
        }
    }

    /// Adds one fact, widening the date bounds.
    pub fn add(&mut self, amount: f64, date: Option<NaiveDate>) {
        self.count += 1;
        self.sum += amount;
        self.average = self.sum / self.count as f64;
        if let Some(d) = date {
            self.min_date = Some(self.min_date.map_or(d, |m| m.min(d)));
            self.max_date = Some(self.max_date.map_or(d, |m| m.max(d)));
        }
    }

    /// Removes one fact. Date bounds are left as they are.
    pub fn remove(&mut self, amount: f64) {
        self.count -= 1;
        self.sum = (self.sum - amount).max(0.0);
        self.average = if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        };
    }
}
