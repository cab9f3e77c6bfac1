//! Work unit ledger trait.

use async_trait::async_trait;
use regsync_core::{ClaimScope, LedgerSummary, PeriodRange, Stage, UnitFilter, UnitKey, WorkUnit};

use crate::error::LedgerError;

/// Persistent table of work units with atomic non-blocking claims.
///
/// A claim hands a `pending` unit to exactly one caller and moves it to
/// `running` in the same step. Rows another caller is busy with are skipped,
/// never waited on. Transform and Load units are only claimable once the
/// unit of the previous stage for the same `(entity, period, subtype)` is `done`.
#[async_trait]
pub trait UnitLedger: Send + Sync {
    /// Inserts missing units as `pending`. Existing rows are left untouched.
    /// Returns how many units were created.
    async fn bootstrap(
        &self,
        entity: &str,
        range: PeriodRange,
        subtypes: &[String],
        stages: &[Stage],
    ) -> Result<u64, LedgerError>;

    /// Claims the earliest-by-period claimable unit in scope.
    async fn claim(&self, scope: &ClaimScope) -> Result<Option<WorkUnit>, LedgerError>;

    async fn claim_next(&self, stage: Stage) -> Result<Option<WorkUnit>, LedgerError> {
        self.claim(&ClaimScope::stage(stage)).await
    }

    /// Number of units in scope a claim could currently return.
    async fn count_claimable(&self, scope: &ClaimScope) -> Result<u64, LedgerError>;

    /// Moves a `running` unit to `done`, or to `error` with `retries + 1`.
    async fn finish(&self, id: i64, success: bool, error: Option<&str>) -> Result<WorkUnit, LedgerError>;

    /// Resets `error` units (and `running` ones when asked) back to `pending`.
    async fn requeue(&self, filter: &UnitFilter, include_running: bool) -> Result<u64, LedgerError>;

    async fn get(&self, id: i64) -> Result<Option<WorkUnit>, LedgerError>;

    async fn list(&self, filter: &UnitFilter) -> Result<Vec<WorkUnit>, LedgerError>;

    async fn summary(&self, filter: &UnitFilter) -> Result<LedgerSummary, LedgerError>;
}

/// Cross product of periods, subtypes and stages.
pub fn bootstrap_keys(entity: &str, range: PeriodRange, subtypes: &[String], stages: &[Stage]) -> Vec<UnitKey> {
    let mut keys = Vec::with_capacity(range.len() * subtypes.len() * stages.len());
    for period in range.iter() {
        for subtype in subtypes {
            for stage in stages {
                keys.push(UnitKey::new(entity, period, subtype.clone(), *stage));
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_keys_cross_product() {
        let subtypes: Vec<String> = ["C", "A", "L", "O"].iter().map(|s| s.to_string()).collect();
        let keys = bootstrap_keys("call", PeriodRange::year(2024), &subtypes, &Stage::ALL);
        assert_eq!(keys.len(), 144);
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 144);
    }
}
