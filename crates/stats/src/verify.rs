//! Audits maintained aggregates against a direct aggregation of the facts.
//! Mismatches are reported, never repaired.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use regsync_core::AggregateKey;
use regsync_store::CanonicalStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::StatsError;
use crate::maintainer::aggregate;
use crate::store::AggregateStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchKind {
    /// Facts exist for the key but no row is maintained.
    Missing,
    /// A row is maintained for a key without facts.
    Unexpected,
    CountDiffers { expected: i64, actual: i64 },
    SumDiffers { expected: f64, actual: f64 },
    /// Maintained bounds do not cover the facts' dates.
    DatesNarrower,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub key: AggregateKey,
    #[serde(flatten)]
    pub kind: MismatchKind,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::Missing => write!(f, "{}: missing", self.key),
            MismatchKind::Unexpected => write!(f, "{}: unexpected", self.key),
            MismatchKind::CountDiffers { expected, actual } => {
                write!(f, "{}: count {} != {}", self.key, actual, expected)
            }
            MismatchKind::SumDiffers { expected, actual } => {
                write!(f, "{}: sum {} != {}", self.key, actual, expected)
            }
            MismatchKind::DatesNarrower => write!(f, "{}: date bounds narrower than facts", self.key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub checked: u64,
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct ConsistencyVerifier {
    facts: Arc<dyn CanonicalStore>,
    aggregates: Arc<dyn AggregateStore>,
    tolerance: f64,
}

impl ConsistencyVerifier {
    pub fn new(facts: Arc<dyn CanonicalStore>, aggregates: Arc<dyn AggregateStore>, tolerance: f64) -> Self {
        Self { facts, aggregates, tolerance }
    }

    pub async fn verify(&self) -> Result<VerifyReport, StatsError> {
        let facts = self.facts.facts().await?;
        let expected = aggregate(&facts);
        let maintained = self.aggregates.all().await?;

        let mut report = VerifyReport::default();
        let mut seen = BTreeSet::new();
        for row in &maintained {
            report.checked += 1;
            seen.insert(row.key.clone());
            let Some(want) = expected.get(&row.key) else {
                report.mismatches.push(Mismatch { key: row.key.clone(), kind: MismatchKind::Unexpected });
                continue;
            };
            if want.count != row.count {
                report.mismatches.push(Mismatch {
                    key: row.key.clone(),
                    kind: MismatchKind::CountDiffers { expected: want.count, actual: row.count },
                });
            }
            if (want.sum - row.sum).abs() > self.tolerance {
                report.mismatches.push(Mismatch {
                    key: row.key.clone(),
                    kind: MismatchKind::SumDiffers { expected: want.sum, actual: row.sum },
                });
            }
            if !covers(row.min_date, want.min_date, |have, need| have <= need)
                || !covers(row.max_date, want.max_date, |have, need| have >= need)
            {
                report.mismatches.push(Mismatch { key: row.key.clone(), kind: MismatchKind::DatesNarrower });
            }
        }
        for key in expected.keys().filter(|k| !seen.contains(*k)) {
            report.checked += 1;
            report.mismatches.push(Mismatch { key: key.clone(), kind: MismatchKind::Missing });
        }

        for mismatch in &report.mismatches {
            warn!(mismatch = %mismatch, "aggregate mismatch");
        }
        info!(
            checked = report.checked,
            mismatches = report.mismatches.len(),
            "aggregate verification finished"
        );
        Ok(report)
    }
}

/// A maintained bound covers the expected one when the expected bound is
/// absent or the maintained one is present and at least as wide.
fn covers<T: Copy>(have: Option<T>, need: Option<T>, wider: impl Fn(T, T) -> bool) -> bool {
    match (have, need) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(h), Some(n)) => wider(h, n),
    }
}
