//! Work units: the schedulable `(entity, period, subtype, stage)` tuples the
//! ledger hands out to workers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::period::Period;

pub const DEFAULT_ENTITY: &str = "call";

/// Administration levels: central, regional, local, other.
pub const DEFAULT_SUBTYPES: &[&str] = &["C", "A", "L", "O"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Transform, Stage::Load];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }

    /// Stage whose unit must be `done` before this one becomes claimable.
    pub fn predecessor(&self) -> Option<Stage> {
        match self {
            Stage::Extract => None,
            Stage::Transform => Some(Stage::Extract),
            Stage::Load => Some(Stage::Transform),
        }
    }

    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::Extract => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Load),
            Stage::Load => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "extract" => Ok(Stage::Extract),
            "transform" => Ok(Stage::Transform),
            "load" => Ok(Stage::Load),
            other => Err(PipelineError::validation(other, "unknown stage")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl UnitStatus {
    pub const ALL: [UnitStatus; 4] = [
        UnitStatus::Pending,
        UnitStatus::Running,
        UnitStatus::Done,
        UnitStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Done => "done",
            UnitStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Error)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UnitStatus::Pending),
            "running" => Ok(UnitStatus::Running),
            "done" => Ok(UnitStatus::Done),
            "error" => Ok(UnitStatus::Error),
            other => Err(PipelineError::validation(other, "unknown unit status")),
        }
    }
}

/// Unique identity of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub entity: String,
    pub period: Period,
    pub subtype: String,
    pub stage: Stage,
}

impl UnitKey {
    pub fn new(entity: impl Into<String>, period: Period, subtype: impl Into<String>, stage: Stage) -> Self {
        Self {
            entity: entity.into(),
            period,
            subtype: subtype.into(),
            stage,
        }
    }

    /// Same `(entity, period, subtype)` at a different stage.
    pub fn at_stage(&self, stage: Stage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.entity, self.period, self.subtype, self.stage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: i64,
    pub entity: String,
    pub period: Period,
    pub subtype: String,
    pub stage: Stage,
    pub status: UnitStatus,
    pub retries: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkUnit {
    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.entity.clone(), self.period, self.subtype.clone(), self.stage)
    }
}

/// Optional narrowing of ledger operations. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFilter {
    pub entity: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub subtype: Option<String>,
    pub stage: Option<Stage>,
}

impl UnitFilter {
    pub fn year(year: i32) -> Self {
        Self {
            year: Some(year),
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn matches(&self, unit: &WorkUnit) -> bool {
        self.entity.as_ref().map_or(true, |e| *e == unit.entity)
            && self.year.map_or(true, |y| y == unit.period.year)
            && self.month.map_or(true, |m| m == unit.period.month)
            && self.subtype.as_ref().map_or(true, |s| *s == unit.subtype)
            && self.stage.map_or(true, |s| s == unit.stage)
    }
}

/// What a worker is allowed to claim: one stage, optionally narrowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimScope {
    pub stage: Stage,
    pub entity: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub subtype: Option<String>,
}

impl ClaimScope {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage,
            entity: None,
            year: None,
            month: None,
            subtype: None,
        }
    }

    pub fn year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn month(mut self, month: Option<u32>) -> Self {
        self.month = month;
        self
    }

    pub fn subtype(mut self, subtype: Option<String>) -> Self {
        self.subtype = subtype;
        self
    }

    pub fn entity(mut self, entity: Option<String>) -> Self {
        self.entity = entity;
        self
    }

    pub fn filter(&self) -> UnitFilter {
        UnitFilter {
            entity: self.entity.clone(),
            year: self.year,
            month: self.month,
            subtype: self.subtype.clone(),
            stage: Some(self.stage),
        }
    }
}

/// Unit count for one `(stage, status)` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub stage: Stage,
    pub status: UnitStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub counts: Vec<StatusCount>,
}

impl LedgerSummary {
    pub fn count(&self, stage: Stage, status: UnitStatus) -> i64 {
        self.counts
            .iter()
            .filter(|c| c.stage == stage && c.status == status)
            .map(|c| c.count)
            .sum()
    }

    pub fn total(&self) -> i64 {
        self.counts.iter().map(|c| c.count).sum()
    }

    pub fn status_total(&self, status: UnitStatus) -> i64 {
        self.counts.iter().filter(|c| c.status == status).map(|c| c.count).sum()
    }

    /// No unit is pending or running.
    pub fn is_settled(&self) -> bool {
        self.status_total(UnitStatus::Pending) == 0 && self.status_total(UnitStatus::Running) == 0
    }
}
