use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Datelike;
use regsync_core::config::PipelineConfig;
use regsync_core::{
    AwardRecord, CatalogEntry, CatalogKind, ClaimScope, ControlStatus, DateWindow, EnrichedRecord, Fact, Period,
    PeriodRange, PipelineError, Stage, UnitFilter, UnitStatus,
};
use regsync_ingest::{
    stages, ArtifactStore, Dataset, IncidentLog, Page, PageQuery, PendingCatalog, Pipeline, RegistrySource,
    StageContext,
};
use regsync_ledger::{ControlLedger, EventBus, MemoryUnitLedger, UnitLedger};
use regsync_store::{CallSnapshot, CanonicalStore, MemoryStore, StoreError};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Serves January 2024 calls of subtype `C`; every other month is empty.
struct Registry {
    listing: Vec<Value>,
    details: HashMap<String, Value>,
    failing: HashSet<String>,
}

impl Registry {
    fn new() -> Self {
        let details = [
            json!({
                "id": 101,
                "receivedOn": "2024-01-10",
                "title": "Research grants",
                "budget": 1000.0,
                "organ": {"level1": "State", "level2": "Ministry of Science"},
                "regions": [{"description": "North"}],
                "instruments": [{"description": "Grant"}]
            }),
            json!({
                "id": "102",
                "receivedOn": "2024-01-20",
                "regions": [{"description": "Atlantis"}]
            }),
            json!({"id": 103, "receivedOn": "2024-01-25"}),
        ];
        let listing = details
            .iter()
            .map(|d| json!({"id": d["id"], "receivedOn": d["receivedOn"]}))
            .collect();
        let details = details
            .into_iter()
            .map(|d| (d["id"].to_string().trim_matches('"').to_string(), d))
            .collect();
        Self { listing, details, failing: HashSet::new() }
    }

    fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }
}

#[async_trait]
impl RegistrySource for Registry {
    async fn search(&self, query: &PageQuery) -> Result<Page, PipelineError> {
        let january = query.date_from.year() == 2024 && query.date_from.month() == 1;
        if !january || query.subtype.as_deref() != Some("C") || query.page > 0 {
            return Ok(Page { content: Vec::new(), total_elements: if january { 3 } else { 0 } });
        }
        Ok(Page { content: self.listing.clone(), total_elements: self.listing.len() as u64 })
    }

    async fn fetch_detail(&self, _: Dataset, id: &str) -> Result<Value, PipelineError> {
        if self.failing.contains(id) {
            return Err(PipelineError::TransientNetwork(format!("timeout fetching {id}")));
        }
        self.details
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::validation(id, "not found"))
    }
}

/// Rejects one call id, delegating everything else.
struct RejectingStore {
    inner: MemoryStore,
    reject: String,
}

#[async_trait]
impl CanonicalStore for RejectingStore {
    async fn upsert_call(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        if record.id == self.reject {
            return Err(StoreError::Rejected { id: record.id.clone(), reason: "constraint violation".into() });
        }
        self.inner.upsert_call(record).await
    }
    async fn call(&self, id: &str) -> Result<Option<CallSnapshot>, StoreError> {
        self.inner.call(id).await
    }
    async fn call_count(&self) -> Result<u64, StoreError> {
        self.inner.call_count().await
    }
    async fn upsert_catalog_entries(&self, entries: &[CatalogEntry]) -> Result<u64, StoreError> {
        self.inner.upsert_catalog_entries(entries).await
    }
    async fn catalog_entries(&self, kind: Option<CatalogKind>) -> Result<Vec<CatalogEntry>, StoreError> {
        self.inner.catalog_entries(kind).await
    }
    async fn awards_in_window(&self, window: &DateWindow) -> Result<Vec<AwardRecord>, StoreError> {
        self.inner.awards_in_window(window).await
    }
    async fn award(&self, id: &str) -> Result<Option<AwardRecord>, StoreError> {
        self.inner.award(id).await
    }
    async fn award_count(&self) -> Result<u64, StoreError> {
        self.inner.award_count().await
    }
    async fn insert_awards(&self, awards: &[AwardRecord]) -> Result<Vec<Fact>, StoreError> {
        self.inner.insert_awards(awards).await
    }
    async fn update_awards(&self, awards: &[AwardRecord]) -> Result<Vec<(Fact, Fact)>, StoreError> {
        self.inner.update_awards(awards).await
    }
    async fn delete_awards(&self, ids: &[String]) -> Result<Vec<Fact>, StoreError> {
        self.inner.delete_awards(ids).await
    }
    async fn facts(&self) -> Result<Vec<Fact>, StoreError> {
        self.inner.facts().await
    }
}

fn catalog() -> Vec<CatalogEntry> {
    let entry = |kind, key: &str, desc: &str, parent: Option<&str>| CatalogEntry {
        kind,
        key: key.into(),
        description: desc.into(),
        parent_key: parent.map(str::to_string),
    };
    vec![
        entry(CatalogKind::Organ, "E0", "State", None),
        entry(CatalogKind::Organ, "E1", "Ministry of Science", Some("E0")),
        entry(CatalogKind::Region, "RN", "North", None),
        entry(CatalogKind::Instrument, "I1", "Grant", None),
    ]
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.upsert_catalog_entries(&catalog()).await.unwrap();
    store
}

fn context(dir: &Path, source: Registry, store: Arc<dyn CanonicalStore>, max_retries: u32) -> Arc<StageContext> {
    let config = PipelineConfig {
        subtypes: vec!["C".to_string()],
        fetch_concurrency: 4,
        workers: 2,
        record_max_retries: max_retries,
        ..PipelineConfig::default()
    };
    Arc::new(StageContext::new(
        config,
        100,
        Arc::new(source),
        store,
        Arc::new(ControlLedger::new(dir.join("control"))),
        ArtifactStore::new(dir.join("raw"), dir.join("enriched")),
        PendingCatalog::new(dir.join("pending")),
        IncidentLog::new(&dir.join("incidents"), "test"),
    ))
}

fn subtypes() -> Vec<String> {
    vec!["C".to_string()]
}

fn january() -> Period {
    Period::new(2024, 1).unwrap()
}

#[tokio::test]
async fn pipeline_runs_every_unit_to_done() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let ledger = Arc::new(MemoryUnitLedger::new());
    ledger
        .bootstrap("call", PeriodRange::year(2024), &subtypes(), &Stage::ALL)
        .await
        .unwrap();
    let ctx = context(dir.path(), Registry::new(), store.clone(), 3);
    let pipeline = Pipeline::new(ctx, ledger.clone(), EventBus::default());

    let summary = pipeline.run_pipeline(&UnitFilter::year(2024), 2).await.unwrap();

    let status = ledger.summary(&UnitFilter::default()).await.unwrap();
    assert_eq!(status.status_total(UnitStatus::Done), 36);
    assert_eq!(summary.failed, 0);
    assert_eq!(store.call_count().await.unwrap(), 3);

    let call = store.call("101").await.unwrap().unwrap();
    assert_eq!(call.organ_key.as_deref(), Some("E1"));
    assert_eq!(
        call.relations,
        vec![(CatalogKind::Instrument, "I1".to_string()), (CatalogKind::Region, "RN".to_string())]
    );
}

#[tokio::test]
async fn unresolved_reference_goes_to_pending_catalog() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let ledger = Arc::new(MemoryUnitLedger::new());
    let range = PeriodRange::new(january(), january());
    ledger.bootstrap("call", range, &subtypes(), &Stage::ALL).await.unwrap();
    let ctx = context(dir.path(), Registry::new(), store.clone(), 3);
    let pipeline = Pipeline::new(ctx.clone(), ledger, EventBus::default());

    pipeline.run_pipeline(&UnitFilter::default(), 1).await.unwrap();

    let pending = ctx.pending.read(CatalogKind::Region).unwrap();
    assert!(pending.contains("Atlantis"));
    assert!(!pending.contains("North"));
    // unresolved references load as absent relations
    let call = store.call("102").await.unwrap().unwrap();
    assert!(call.relations.is_empty());
}

#[tokio::test]
async fn load_twice_yields_same_relations() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let ledger = Arc::new(MemoryUnitLedger::new());
    let range = PeriodRange::new(january(), january());
    ledger.bootstrap("call", range, &subtypes(), &Stage::ALL).await.unwrap();
    let ctx = context(dir.path(), Registry::new(), store.clone(), 3);
    let pipeline = Pipeline::new(ctx.clone(), ledger.clone(), EventBus::default());
    pipeline.run_pipeline(&UnitFilter::default(), 1).await.unwrap();
    let before = store.call("101").await.unwrap().unwrap();

    let load = ledger
        .list(&UnitFilter::default().with_stage(Stage::Load))
        .await
        .unwrap()
        .remove(0);
    let report = stages::run(&ctx, &load).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.succeeded, 3);
    assert_eq!(store.call_count().await.unwrap(), 3);
    assert_eq!(store.call("101").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn record_fetch_failure_stays_on_control_ledger() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let ledger = Arc::new(MemoryUnitLedger::new());
    let range = PeriodRange::new(january(), january());
    ledger.bootstrap("call", range, &subtypes(), &[Stage::Extract]).await.unwrap();
    let ctx = context(dir.path(), Registry::new().failing("103"), store, 2);
    let pipeline = Pipeline::new(ctx.clone(), ledger.clone(), EventBus::default());

    let summary = pipeline.run_stage(&ClaimScope::stage(Stage::Extract)).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    // the unit itself completes
    let unit = ledger.list(&UnitFilter::default()).await.unwrap().remove(0);
    assert_eq!(unit.status, UnitStatus::Done);

    let control = ctx.control.load("call", 2024).unwrap().unwrap();
    let rec = control.get("103").unwrap();
    assert_eq!(rec.status, ControlStatus::Pending);
    assert_eq!(rec.retries, 1);
    assert!(rec.last_error.as_deref().unwrap().contains("timeout"));
    assert_eq!(control.get("101").unwrap().status, ControlStatus::Extracted);

    let raw = ctx.artifacts.read_raw("call", "C", january()).unwrap().unwrap();
    assert_eq!(raw.len(), 2);
    assert_eq!(ctx.incidents.count(), 1);
}

#[tokio::test]
async fn retry_cap_moves_record_to_error() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let ledger = Arc::new(MemoryUnitLedger::new());
    let range = PeriodRange::new(january(), january());
    ledger.bootstrap("call", range, &subtypes(), &[Stage::Extract]).await.unwrap();
    let ctx = context(dir.path(), Registry::new().failing("103"), store, 2);
    let unit = ledger.list(&UnitFilter::default()).await.unwrap().remove(0);

    let first = stages::run(&ctx, &unit).await.unwrap();
    assert_eq!(first.processed, 3);
    let second = stages::run(&ctx, &unit).await.unwrap();
    // only the failing record is still pending
    assert_eq!(second.processed, 1);

    let control = ctx.control.load("call", 2024).unwrap().unwrap();
    let rec = control.get("103").unwrap();
    assert_eq!(rec.status, ControlStatus::Error);
    assert_eq!(rec.retries, 2);

    let third = stages::run(&ctx, &unit).await.unwrap();
    assert_eq!(third.processed, 0);
}

#[tokio::test]
async fn transform_without_raw_artifact_fails_unit() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let ledger = Arc::new(MemoryUnitLedger::new());
    let range = PeriodRange::new(january(), january());
    ledger
        .bootstrap("call", range, &subtypes(), &[Stage::Extract, Stage::Transform])
        .await
        .unwrap();
    // extract marked done without producing an artifact
    let extract = ledger.claim_next(Stage::Extract).await.unwrap().unwrap();
    ledger.finish(extract.id, true, None).await.unwrap();

    let ctx = context(dir.path(), Registry::new(), store, 3);
    let pipeline = Pipeline::new(ctx, ledger.clone(), EventBus::default());
    let summary = pipeline.run_stage(&ClaimScope::stage(Stage::Transform)).await.unwrap();

    assert_eq!(summary.failed, 1);
    let transform = ledger
        .list(&UnitFilter::default().with_stage(Stage::Transform))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(transform.status, UnitStatus::Error);
    assert!(transform.last_error.unwrap().contains("raw artifact missing"));
}

#[tokio::test]
async fn rejected_record_does_not_block_batch() {
    let dir = TempDir::new().unwrap();
    let inner = MemoryStore::new();
    inner.upsert_catalog_entries(&catalog()).await.unwrap();
    let store = Arc::new(RejectingStore { inner, reject: "102".into() });
    let ledger = Arc::new(MemoryUnitLedger::new());
    let range = PeriodRange::new(january(), january());
    ledger.bootstrap("call", range, &subtypes(), &Stage::ALL).await.unwrap();
    let ctx = context(dir.path(), Registry::new(), store.clone(), 3);
    let pipeline = Pipeline::new(ctx.clone(), ledger.clone(), EventBus::default());

    let summary = pipeline.run_pipeline(&UnitFilter::default(), 2).await.unwrap();

    assert_eq!(store.call_count().await.unwrap(), 2);
    assert!(store.call("102").await.unwrap().is_none());
    let load = ledger
        .list(&UnitFilter::default().with_stage(Stage::Load))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(load.status, UnitStatus::Error);
    assert_eq!(load.last_error.as_deref(), Some("1 of 3 records failed to load"));
    assert!(summary.failed >= 1);

    let path = ctx.incidents.finish().unwrap().unwrap();
    let log = std::fs::read_to_string(path).unwrap();
    assert!(log.contains("\"record_id\":\"102\""));
}

#[tokio::test]
async fn error_upstream_does_not_stall_workers() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let ledger = Arc::new(MemoryUnitLedger::new());
    let range = PeriodRange::new(january(), january());
    ledger.bootstrap("call", range, &subtypes(), &Stage::ALL).await.unwrap();
    let extract = ledger.claim_next(Stage::Extract).await.unwrap().unwrap();
    ledger.finish(extract.id, false, Some("listing unavailable")).await.unwrap();

    let ctx = context(dir.path(), Registry::new(), store, 3);
    let pipeline = Pipeline::new(ctx, ledger.clone(), EventBus::default());
    let filter = UnitFilter::default();
    let run = pipeline.run_pipeline(&filter, 2);
    let summary = tokio::time::timeout(std::time::Duration::from_secs(10), run)
        .await
        .expect("workers exit")
        .unwrap();

    assert_eq!(summary.processed, 0);
    let status = ledger.summary(&UnitFilter::default()).await.unwrap();
    assert_eq!(status.count(Stage::Transform, UnitStatus::Pending), 1);
    assert_eq!(status.count(Stage::Load, UnitStatus::Pending), 1);
}
