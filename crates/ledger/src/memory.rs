//! In-process ledger with the same claim semantics as the Postgres backend.
//!
//! Each unit sits behind its own mutex. Claims walk units in period order and
//! `try_lock` each candidate, skipping any that another caller holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

use async_trait::async_trait;
use chrono::Utc;
use regsync_core::{
    ClaimScope, LedgerSummary, PeriodRange, Stage, StatusCount, UnitFilter, UnitKey, UnitStatus, WorkUnit,
};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::ledger::{bootstrap_keys, UnitLedger};

type Slot = Arc<Mutex<WorkUnit>>;

#[derive(Default)]
struct Units {
    /// Sorted by `(period, subtype, entity, stage)`.
    ordered: Vec<(UnitKey, Slot)>,
    by_key: HashMap<UnitKey, Slot>,
    by_id: HashMap<i64, Slot>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryUnitLedger {
    units: RwLock<Units>,
}

fn lock(slot: &Slot) -> MutexGuard<'_, WorkUnit> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `None` when another caller holds the unit.
fn try_lock(slot: &Slot) -> Option<MutexGuard<'_, WorkUnit>> {
    match slot.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl MemoryUnitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Units> {
        self.units.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Units> {
        self.units.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the predecessor unit is `done`. Waits for a predecessor held
    /// by another caller; slots are only ever locked successor before
    /// predecessor.
    fn predecessor_done(units: &Units, key: &UnitKey) -> bool {
        let Some(prev) = key.stage.predecessor() else {
            return true;
        };
        match units.by_key.get(&key.at_stage(prev)) {
            Some(slot) => lock(slot).status == UnitStatus::Done,
            None => false,
        }
    }

    fn snapshot(&self, filter: &UnitFilter) -> Vec<WorkUnit> {
        let units = self.read();
        units
            .ordered
            .iter()
            .map(|(_, slot)| lock(slot).clone())
            .filter(|u| filter.matches(u))
            .collect()
    }
}

#[async_trait]
impl UnitLedger for MemoryUnitLedger {
    async fn bootstrap(
        &self,
        entity: &str,
        range: PeriodRange,
        subtypes: &[String],
        stages: &[Stage],
    ) -> Result<u64, LedgerError> {
        let keys = bootstrap_keys(entity, range, subtypes, stages);
        let mut units = self.write();
        let mut created = 0u64;
        for key in keys {
            if units.by_key.contains_key(&key) {
                continue;
            }
            units.next_id += 1;
            let unit = WorkUnit {
                id: units.next_id,
                entity: key.entity.clone(),
                period: key.period,
                subtype: key.subtype.clone(),
                stage: key.stage,
                status: UnitStatus::Pending,
                retries: 0,
                last_error: None,
                started_at: None,
                finished_at: None,
            };
            let slot = Arc::new(Mutex::new(unit));
            let id = units.next_id;
            units.by_id.insert(id, slot.clone());
            units.by_key.insert(key.clone(), slot.clone());
            units.ordered.push((key, slot));
            created += 1;
        }
        units
            .ordered
            .sort_by(|(a, _), (b, _)| (a.period, &a.subtype, &a.entity, a.stage).cmp(&(b.period, &b.subtype, &b.entity, b.stage)));
        info!(entity, created, "ledger bootstrapped");
        Ok(created)
    }

    async fn claim(&self, scope: &ClaimScope) -> Result<Option<WorkUnit>, LedgerError> {
        let filter = scope.filter();
        let units = self.read();
        for (key, slot) in units.ordered.iter() {
            if key.stage != scope.stage {
                continue;
            }
            let Some(mut unit) = try_lock(slot) else {
                continue;
            };
            if unit.status != UnitStatus::Pending || !filter.matches(&unit) {
                continue;
            }
            if !Self::predecessor_done(&units, key) {
                continue;
            }
            unit.status = UnitStatus::Running;
            unit.started_at = Some(Utc::now());
            unit.finished_at = None;
            debug!(unit_id = unit.id, key = %key, "claimed work unit");
            return Ok(Some(unit.clone()));
        }
        Ok(None)
    }

    async fn count_claimable(&self, scope: &ClaimScope) -> Result<u64, LedgerError> {
        let filter = scope.filter();
        let units = self.read();
        let mut count = 0;
        for (key, slot) in units.ordered.iter() {
            if key.stage != scope.stage {
                continue;
            }
            let claimable = {
                let unit = lock(slot);
                unit.status == UnitStatus::Pending && filter.matches(&unit)
            };
            if claimable && Self::predecessor_done(&units, key) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn finish(&self, id: i64, success: bool, error: Option<&str>) -> Result<WorkUnit, LedgerError> {
        let slot = self.read().by_id.get(&id).cloned().ok_or(LedgerError::NotFound(id))?;
        let mut unit = lock(&slot);
        if unit.status != UnitStatus::Running {
            return Err(LedgerError::NotRunning { id, status: unit.status });
        }
        if success {
            unit.status = UnitStatus::Done;
        } else {
            unit.status = UnitStatus::Error;
            unit.retries += 1;
            unit.last_error = error.map(str::to_string);
        }
        unit.finished_at = Some(Utc::now());
        Ok(unit.clone())
    }

    async fn requeue(&self, filter: &UnitFilter, include_running: bool) -> Result<u64, LedgerError> {
        let units = self.read();
        let mut requeued = 0;
        for (_, slot) in units.ordered.iter() {
            let mut unit = lock(slot);
            let eligible = unit.status == UnitStatus::Error
                || (include_running && unit.status == UnitStatus::Running);
            if eligible && filter.matches(&unit) {
                unit.status = UnitStatus::Pending;
                unit.started_at = None;
                unit.finished_at = None;
                requeued += 1;
            }
        }
        info!(requeued, include_running, "work units requeued");
        Ok(requeued)
    }

    async fn get(&self, id: i64) -> Result<Option<WorkUnit>, LedgerError> {
        let slot = self.read().by_id.get(&id).cloned();
        Ok(slot.map(|s| lock(&s).clone()))
    }

    async fn list(&self, filter: &UnitFilter) -> Result<Vec<WorkUnit>, LedgerError> {
        Ok(self.snapshot(filter))
    }

    async fn summary(&self, filter: &UnitFilter) -> Result<LedgerSummary, LedgerError> {
        let mut cells: HashMap<(Stage, UnitStatus), i64> = HashMap::new();
        for unit in self.snapshot(filter) {
            *cells.entry((unit.stage, unit.status)).or_default() += 1;
        }
        let mut counts: Vec<StatusCount> = cells
            .into_iter()
            .map(|((stage, status), count)| StatusCount { stage, status, count })
            .collect();
        counts.sort_by_key(|c| (c.stage, c.status));
        Ok(LedgerSummary { counts })
    }
}
