//! Extract: seed the control ledger from the remote listing, fetch every
//! pending record's detail and merge the successes into the raw artifact.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use regsync_core::{ListingItem, PipelineError, RawRecord, WorkUnit};
use tracing::info;

use crate::client::{fetch_listing, Dataset, PageQuery};
use crate::incidents::Incident;
use crate::stages::{StageContext, StageReport};

pub async fn run(ctx: &StageContext, unit: &WorkUnit) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(unit);
    let period = unit.period;
    let year = period.year;

    let query = PageQuery {
        dataset: Dataset::Calls,
        page: 0,
        page_size: ctx.page_size,
        date_from: period.first_day(),
        date_to: period.last_day(),
        subtype: Some(unit.subtype.clone()),
    };
    let listing = fetch_listing(ctx.source.as_ref(), &query, ctx.config.fetch_concurrency).await?;

    let mut items = Vec::with_capacity(listing.len());
    for value in listing {
        match serde_json::from_value::<ListingItem>(value.clone()) {
            Ok(item) => items.push(item),
            Err(e) => {
                let err = PipelineError::validation("listing", e.to_string());
                ctx.incidents
                    .record(Incident::new("listing", &err).unit(unit.key()).attempted(value));
            }
        }
    }

    let (seeded, pending) = ctx
        .control
        .update(&unit.entity, year, |list| {
            let seeded = list.seed(period, &unit.subtype, &items);
            (seeded, list.pending_ids(period, &unit.subtype))
        })
        .await?;

    let source = ctx.source.as_ref();
    let results: Vec<(String, Result<serde_json::Value, PipelineError>)> = stream::iter(pending)
        .map(|id| async move {
            let result = source.fetch_detail(Dataset::Calls, &id).await;
            (id, result)
        })
        .buffer_unordered(ctx.config.fetch_concurrency.max(1))
        .collect()
        .await;

    let now = Utc::now();
    let mut fetched = Vec::new();
    let mut failures = Vec::new();
    for (id, result) in results {
        match result {
            Ok(payload) => fetched.push(RawRecord {
                external_id: id,
                fetched_at: now,
                payload,
            }),
            Err(e) => failures.push((id, e)),
        }
    }

    let fetched_ids: Vec<String> = fetched.iter().map(|r| r.external_id.clone()).collect();
    let total = ctx.artifacts.merge_raw(&unit.entity, &unit.subtype, period, fetched)?;

    let max_retries = ctx.config.record_max_retries;
    ctx.control
        .update(&unit.entity, year, |list| {
            for id in &fetched_ids {
                if let Some(rec) = list.get_mut(id) {
                    rec.mark_extracted(now);
                }
            }
            for (id, err) in &failures {
                if let Some(rec) = list.get_mut(id) {
                    rec.mark_failed(err.to_string(), now, max_retries);
                }
            }
        })
        .await?;

    for _ in &fetched_ids {
        report.success();
    }
    for (id, err) in &failures {
        ctx.incident(unit, id, err);
        report.failure();
    }

    info!(
        unit_id = unit.id,
        key = %unit.key(),
        seeded,
        fetched = report.succeeded,
        failed = report.failed,
        artifact_records = total,
        "extract finished"
    );
    Ok(report)
}
