//! Transform: resolve catalog references of every raw record into the
//! enriched artifact. Unresolved references are kept and sent to the
//! pending-catalog channel.

use std::collections::{BTreeMap, BTreeSet};

use regsync_core::{CallDetail, CatalogKind, EnrichedRecord, PipelineError, WorkUnit};
use tracing::{debug, info};

use crate::incidents::Incident;
use crate::stages::{StageContext, StageReport};

pub async fn run(ctx: &StageContext, unit: &WorkUnit) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(unit);
    let raw = ctx
        .artifacts
        .read_raw(&unit.entity, &unit.subtype, unit.period)?
        .ok_or_else(|| {
            PipelineError::fatal(format!(
                "raw artifact missing: {}",
                ctx.artifacts.raw_path(&unit.entity, &unit.subtype, unit.period).display()
            ))
        })?;
    let catalogs = ctx.catalogs().await?;

    let mut enriched: BTreeMap<String, EnrichedRecord> = BTreeMap::new();
    let mut gaps: BTreeMap<CatalogKind, BTreeSet<String>> = BTreeMap::new();

    for record in &raw {
        let detail = match serde_json::from_value::<CallDetail>(record.payload.clone()) {
            Ok(detail) => detail,
            Err(e) => {
                let err = PipelineError::validation(&record.external_id, e.to_string());
                ctx.incidents.record(
                    Incident::new(&record.external_id, &err)
                        .unit(unit.key())
                        .attempted(record.payload.clone()),
                );
                report.failure();
                continue;
            }
        };

        let rec = catalogs.enrich(&detail, &unit.subtype);
        for (kind, raw_value) in rec.unresolved() {
            let gap = PipelineError::ReferentialGap {
                kind: kind.to_string(),
                value: raw_value.to_string(),
            };
            debug!(record_id = %rec.id, error = %gap, "reference left unresolved");
            gaps.entry(kind).or_default().insert(raw_value.to_string());
        }
        enriched.insert(rec.id.clone(), rec);
        report.success();
    }

    let records: Vec<EnrichedRecord> = enriched.into_values().collect();
    let path = ctx
        .artifacts
        .write_enriched(&unit.entity, &unit.subtype, unit.period, &records)?;

    let mut unresolved = 0;
    for (kind, values) in &gaps {
        unresolved += values.len();
        ctx.pending.record(*kind, values.iter().map(String::as_str)).await?;
    }

    info!(
        unit_id = unit.id,
        key = %unit.key(),
        records = records.len(),
        invalid = report.failed,
        unresolved,
        path = %path.display(),
        "transform finished"
    );
    Ok(report)
}
