//! Claim loop and worker pool over the work unit ledger.
//!
//! Each execution ends in exactly one ledger transition (`done` or `error`)
//! followed by a [`StageCompleted`] event. Idle workers of a gated stage wait
//! on those events instead of polling the filesystem.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use regsync_core::{ClaimScope, PipelineError, RunSummary, Stage, UnitFilter, UnitStatus, WorkUnit};
use regsync_ledger::{EventBus, StageCompleted, UnitLedger};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::stages::{self, StageContext, StageReport};

/// Upper bound on how long an idle worker waits before re-checking the ledger.
const IDLE_WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct Pipeline {
    ctx: Arc<StageContext>,
    ledger: Arc<dyn UnitLedger>,
    events: EventBus,
}

impl Pipeline {
    pub fn new(ctx: Arc<StageContext>, ledger: Arc<dyn UnitLedger>, events: EventBus) -> Self {
        Self { ctx, ledger, events }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Runs one claimed unit and records the outcome in the ledger. Stage
    /// errors are converted into an `error` transition, never propagated.
    pub async fn execute(&self, unit: WorkUnit) -> StageReport {
        let started = Instant::now();
        let mut report = match stages::run(&self.ctx, &unit).await {
            Ok(report) => report,
            Err(e) => {
                self.ctx.incident(&unit, &unit.key().to_string(), &e);
                let mut report = StageReport::new(&unit);
                report.error = Some(e.to_string());
                report
            }
        };

        let status = match self
            .ledger
            .finish(unit.id, report.is_success(), report.error.as_deref())
            .await
        {
            Ok(finished) => finished.status,
            Err(e) => {
                error!(unit_id = unit.id, error = %e, "failed to record unit outcome");
                report.error.get_or_insert_with(|| e.to_string());
                UnitStatus::Error
            }
        };

        match &report.error {
            None => info!(
                unit_id = unit.id,
                key = %report.key,
                processed = report.processed,
                duration_ms = started.elapsed().as_millis() as u64,
                "unit done"
            ),
            Some(err) => warn!(
                unit_id = unit.id,
                key = %report.key,
                error = %err,
                duration_ms = started.elapsed().as_millis() as u64,
                "unit failed"
            ),
        }

        self.events.publish(StageCompleted {
            unit_id: unit.id,
            key: report.key.clone(),
            status,
        });
        report
    }

    /// Claims and runs units in `scope` one after another until none is claimable.
    pub async fn run_stage(&self, scope: &ClaimScope) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let mut summary = RunSummary::new(format!("run-stage {}", scope.stage));
        while let Some(unit) = self.ledger.claim(scope).await? {
            let report = self.execute(unit).await;
            absorb(&mut summary, &report);
        }
        summary.duration = started.elapsed();
        Ok(summary)
    }

    /// Drives all three stages with `workers` workers each until every unit in
    /// `filter` that can still make progress is terminal.
    pub async fn run_pipeline(&self, filter: &UnitFilter, workers: usize) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let mut handles = Vec::new();
        for stage in Stage::ALL {
            for worker in 0..workers.max(1) {
                let pipeline = self.clone();
                let scope = ClaimScope {
                    stage,
                    entity: filter.entity.clone(),
                    year: filter.year,
                    month: filter.month,
                    subtype: filter.subtype.clone(),
                };
                handles.push(tokio::spawn(async move { pipeline.worker(scope, worker).await }));
            }
        }

        let mut summary = RunSummary::new("run-pipeline");
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(part)) => summary.absorb(&part),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(PipelineError::fatal(format!("worker panicked: {e}"))),
            }
        }
        summary.duration = started.elapsed();
        Ok(summary)
    }

    async fn worker(&self, scope: ClaimScope, worker: usize) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::new(format!("{} worker {}", scope.stage, worker));
        let mut rx = self.events.subscribe();
        loop {
            if let Some(unit) = self.ledger.claim(&scope).await? {
                let report = self.execute(unit).await;
                absorb(&mut summary, &report);
                continue;
            }
            if self.exhausted(&scope).await? {
                break;
            }
            match tokio::time::timeout(IDLE_WAIT, rx.recv()).await {
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) | Err(_) => {}
                Ok(Err(RecvError::Closed)) => break,
            }
        }
        Ok(summary)
    }

    /// No unit in scope is claimable and none can become claimable: every
    /// upstream stage has nothing running and nothing claimable. Units gated
    /// behind an `error` predecessor stay pending and do not hold workers.
    async fn exhausted(&self, scope: &ClaimScope) -> Result<bool, PipelineError> {
        let mut upstream = scope.stage.predecessor();
        while let Some(stage) = upstream {
            let mut prev = scope.clone();
            prev.stage = stage;
            let summary = self.ledger.summary(&prev.filter()).await?;
            if summary.count(stage, UnitStatus::Running) > 0 {
                return Ok(false);
            }
            if self.ledger.count_claimable(&prev).await? > 0 {
                return Ok(false);
            }
            upstream = stage.predecessor();
        }
        Ok(self.ledger.count_claimable(scope).await? == 0)
    }
}

fn absorb(summary: &mut RunSummary, report: &StageReport) {
    summary.processed += report.processed;
    summary.succeeded += report.succeeded;
    summary.failed += report.failed;
    if report.error.is_some() && report.failed == 0 {
        summary.processed += 1;
        summary.failed += 1;
    }
}
