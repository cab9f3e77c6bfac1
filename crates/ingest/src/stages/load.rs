//! Load: idempotent upsert of the enriched artifact into the canonical store.
//!
//! Each record is its own transaction. A failing record is rolled back alone
//! and logged; the rest of the batch still loads, and the unit ends in
//! `error` so the failure stays visible in the ledger.

use regsync_core::{PipelineError, WorkUnit};
use tracing::info;

use crate::incidents::Incident;
use crate::stages::{StageContext, StageReport};

pub async fn run(ctx: &StageContext, unit: &WorkUnit) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(unit);
    let records = ctx
        .artifacts
        .read_enriched(&unit.entity, &unit.subtype, unit.period)?
        .ok_or_else(|| {
            PipelineError::fatal(format!(
                "enriched artifact missing: {}",
                ctx.artifacts.enriched_path(&unit.entity, &unit.subtype, unit.period).display()
            ))
        })?;

    for record in &records {
        match ctx.store.upsert_call(record).await {
            Ok(()) => report.success(),
            Err(e) => {
                let err = PipelineError::from(e);
                ctx.incidents.record(
                    Incident::new(&record.id, &err)
                        .unit(unit.key())
                        .attempted(serde_json::to_value(record)?),
                );
                report.failure();
            }
        }
    }

    if report.failed > 0 {
        report.error = Some(format!(
            "{} of {} records failed to load",
            report.failed, report.processed
        ));
    }

    info!(
        unit_id = unit.id,
        key = %unit.key(),
        loaded = report.succeeded,
        failed = report.failed,
        "load finished"
    );
    Ok(report)
}
