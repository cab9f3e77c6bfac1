use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use regsync_core::{AwardRecord, DateWindow, FactChange, PipelineError};
use regsync_ingest::{Dataset, Page, PageQuery, RegistrySource};
use regsync_store::{CanonicalStore, MemoryStore};
use regsync_sync::{
    ApplyEngine, ChangeCounts, ChangesetStore, FactListener, MemorySyncRunStore, Reconciler, SyncRunStatus,
    SyncRunStore,
};
use serde_json::{json, Value};
use tempfile::TempDir;

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, d).unwrap()
}

fn window() -> DateWindow {
    DateWindow::months_back(date(6, 30), 3)
}

fn award(id: &str, amount: f64, on: NaiveDate) -> AwardRecord {
    AwardRecord {
        id: id.into(),
        call_id: Some("C1".into()),
        beneficiary_id: Some("B1".into()),
        amount: Some(amount),
        award_date: Some(on),
    }
}

/// Serves a fixed award set, filtered by the query's date range. Undated
/// records are served in every range.
struct Awards {
    records: Vec<Value>,
}

#[async_trait]
impl RegistrySource for Awards {
    async fn search(&self, query: &PageQuery) -> Result<Page, PipelineError> {
        assert_eq!(query.dataset, Dataset::Awards);
        let content: Vec<Value> = self
            .records
            .iter()
            .filter(|r| {
                r["awardDate"]
                    .as_str()
                    .map(|s| s.parse::<NaiveDate>().unwrap())
                    .map_or(true, |on| on >= query.date_from && on <= query.date_to)
            })
            .cloned()
            .collect();
        let total = content.len() as u64;
        let content = if query.page == 0 { content } else { Vec::new() };
        Ok(Page { content, total_elements: total })
    }

    async fn fetch_detail(&self, _: Dataset, id: &str) -> Result<Value, PipelineError> {
        Err(PipelineError::validation(id, "no detail endpoint"))
    }
}

#[derive(Default)]
struct Recorder {
    changes: Mutex<Vec<FactChange>>,
}

#[async_trait]
impl FactListener for Recorder {
    async fn on_changes(&self, changes: &[FactChange]) -> Result<(), PipelineError> {
        self.changes.lock().unwrap().extend_from_slice(changes);
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<MemoryStore>,
    runs: Arc<MemorySyncRunStore>,
    changesets: ChangesetStore,
    reconciler: Reconciler,
}

/// Remote `{A, B, C'}` against local `{B, C, D}`.
async fn harness() -> Harness {
    harness_with(Vec::new()).await
}

async fn harness_with(extra: Vec<Value>) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut records = vec![
        json!({"id": "A", "callId": "C1", "beneficiaryId": "B1", "amount": 10, "awardDate": "2024-04-02"}),
        json!({"id": "B", "callId": "C1", "beneficiaryId": "B1", "amount": "20.00", "awardDate": "2024-05-02"}),
        json!({"id": "C", "callId": "C1", "beneficiaryId": "B1", "amount": 35.5, "awardDate": "2024-06-02"}),
        json!({"id": "Z", "callId": "C1", "beneficiaryId": "B1", "amount": 1, "awardDate": "2023-01-02"}),
    ];
    records.extend(extra);
    let remote = Awards { records };
    let store = Arc::new(MemoryStore::new());
    store
        .insert_awards(&[
            award("B", 20.0, date(5, 2)),
            award("C", 30.0, date(6, 2)),
            award("D", 40.0, date(4, 20)),
            // outside the window, never considered
            award("OLD", 5.0, date(1, 5)),
        ])
        .await
        .unwrap();
    let runs = Arc::new(MemorySyncRunStore::new());
    let changesets = ChangesetStore::new(dir.path().join("changesets"));
    let reconciler = Reconciler::new(Arc::new(remote), store.clone(), runs.clone(), changesets.clone(), 100, 2);
    Harness { _dir: dir, store, runs, changesets, reconciler }
}

fn ids(set: &std::collections::BTreeSet<String>) -> Vec<&str> {
    set.iter().map(String::as_str).collect()
}

#[tokio::test]
async fn reconcile_classifies_window() {
    let h = harness().await;
    let report = h.reconciler.reconcile(window(), false).await.unwrap();

    assert_eq!(ids(&report.changeset.inserts), vec!["A"]);
    assert_eq!(ids(&report.changeset.updates), vec!["C"]);
    assert_eq!(ids(&report.changeset.deletes), vec!["D"]);
    assert!(report.path.as_ref().unwrap().exists());

    let run = h.runs.get(report.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, SyncRunStatus::Detected);
    assert_eq!(run.detected, ChangeCounts { insert: 1, update: 1, delete: 1 });
    assert_eq!(run.changeset_id.as_deref(), Some(report.changeset.id.as_str()));
    // detection never mutates
    assert_eq!(h.store.award_count().await.unwrap(), 4);
}

#[tokio::test]
async fn dry_run_reconcile_records_nothing() {
    let h = harness().await;
    let report = h.reconciler.reconcile(window(), true).await.unwrap();
    assert_eq!(report.changeset.counts().total(), 3);
    assert!(report.path.is_none());
    assert!(h.runs.recent(10).await.unwrap().is_empty());
    assert!(h.changesets.list().unwrap().is_empty());
}

#[tokio::test]
async fn apply_converges_and_completes_run() {
    let h = harness().await;
    let recorder = Arc::new(Recorder::default());
    let engine = ApplyEngine::new(h.store.clone(), h.runs.clone(), h.changesets.clone(), 1)
        .with_listener(recorder.clone());
    let detected = h.reconciler.reconcile(window(), false).await.unwrap();

    let report = engine.apply(&detected.changeset.id, false).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.applied, ChangeCounts { insert: 1, update: 1, delete: 1 });
    assert_eq!(h.store.award("C").await.unwrap().unwrap().amount, Some(35.5));
    assert!(h.store.award("D").await.unwrap().is_none());
    assert!(h.store.award("A").await.unwrap().is_some());

    let run = h.runs.get(detected.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.applied, report.applied);

    let changes = recorder.changes.lock().unwrap().clone();
    assert_eq!(changes.len(), 3);
    assert!(matches!(&changes[0], FactChange::Inserted(f) if f.award_id == "A"));
    assert!(matches!(&changes[1], FactChange::Updated { old, new } if old.amount == 30.0 && new.amount == 35.5));
    assert!(matches!(&changes[2], FactChange::Deleted(f) if f.award_id == "D"));

    // a second reconciliation finds nothing left to do
    let again = h.reconciler.reconcile(window(), true).await.unwrap();
    assert_eq!(again.changeset.counts().total(), 0);
}

#[tokio::test]
async fn replaying_changeset_is_safe() {
    let h = harness().await;
    let engine = ApplyEngine::new(h.store.clone(), h.runs.clone(), h.changesets.clone(), 500);
    let detected = h.reconciler.reconcile(window(), false).await.unwrap();

    let first = engine.apply(&detected.changeset.id, false).await.unwrap();
    let after_first = h.store.facts().await.unwrap();
    let second = engine.apply(&detected.changeset.id, false).await.unwrap();

    assert_eq!(first.applied.insert, 1);
    assert_eq!(second.applied.insert, 0);
    assert_eq!(second.applied.delete, 0);
    assert_eq!(h.store.facts().await.unwrap(), after_first);
    assert_eq!(h.store.award_count().await.unwrap(), 4);
}

#[tokio::test]
async fn insert_only_changeset_applied_twice() {
    let h = harness().await;
    let engine = ApplyEngine::new(h.store.clone(), h.runs.clone(), h.changesets.clone(), 500);
    let detected = h.reconciler.reconcile(window(), false).await.unwrap();
    // keep only the insert of A
    let mut changeset = detected.changeset.clone();
    changeset.id = format!("{}_inserts", changeset.id);
    changeset.updates.clear();
    changeset.deletes.clear();
    h.changesets.write(&changeset).unwrap();

    let first = engine.apply(&changeset.id, false).await.unwrap();
    let second = engine.apply(&changeset.id, false).await.unwrap();

    assert_eq!(first.applied, ChangeCounts { insert: 1, update: 0, delete: 0 });
    assert_eq!(second.applied, ChangeCounts::default());
    let a_rows = h
        .store
        .facts()
        .await
        .unwrap()
        .into_iter()
        .filter(|f| f.award_id == "A")
        .count();
    assert_eq!(a_rows, 1);
}

#[tokio::test]
async fn dry_run_apply_does_not_mutate() {
    let h = harness().await;
    let engine = ApplyEngine::new(h.store.clone(), h.runs.clone(), h.changesets.clone(), 500);
    let detected = h.reconciler.reconcile(window(), false).await.unwrap();

    let report = engine.apply(&detected.changeset.id, true).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.planned.total(), 3);
    assert_eq!(report.applied, ChangeCounts::default());
    assert!(h.store.award("A").await.unwrap().is_none());
    let run = h.runs.get(detected.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, SyncRunStatus::Detected);
}

#[tokio::test]
async fn unparsable_remote_award_keeps_local_copy() {
    // D exists locally; the remote copy has an amount that cannot be read
    let h = harness_with(vec![
        json!({"id": "D", "callId": "C1", "beneficiaryId": "B1", "amount": {"value": 40}, "awardDate": "2024-04-20"}),
    ])
    .await;

    let report = h.reconciler.reconcile(window(), false).await.unwrap();

    assert!(report.changeset.deletes.is_empty());
    assert_eq!(ids(&report.changeset.inserts), vec!["A"]);
    assert_eq!(ids(&report.changeset.updates), vec!["C"]);
    assert_eq!(report.invalid, 1);

    let engine = ApplyEngine::new(h.store.clone(), h.runs.clone(), h.changesets.clone(), 500);
    engine.apply(&report.changeset.id, false).await.unwrap();
    assert!(h.store.award("D").await.unwrap().is_some());
}

#[tokio::test]
async fn remote_award_without_id_fails_run() {
    let h = harness_with(vec![json!({"callId": "C1", "amount": 3, "awardDate": "2024-04-03"})]).await;

    assert!(h.reconciler.reconcile(window(), false).await.is_err());

    let runs = h.runs.recent(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, SyncRunStatus::Failed);
    assert!(runs[0].error.as_deref().unwrap().contains("without id"));
    assert!(h.changesets.list().unwrap().is_empty());
}

#[tokio::test]
async fn undated_remote_award_is_skipped() {
    let h = harness_with(vec![json!({"id": "U", "callId": "C1", "beneficiaryId": "B1", "amount": 9})]).await;

    let report = h.reconciler.reconcile(window(), true).await.unwrap();

    assert_eq!(report.undated, 1);
    assert_eq!(ids(&report.changeset.inserts), vec!["A"]);
    assert_eq!(report.changeset.counts().total(), 3);
}

#[tokio::test]
async fn completed_replay_clears_failed_apply_error() {
    let h = harness().await;
    let detected = h.reconciler.reconcile(window(), false).await.unwrap();
    let mut run = h.runs.get(detected.run.id).await.unwrap().unwrap();
    run.failed(ChangeCounts::default(), "interrupted");
    h.runs.update(&run).await.unwrap();

    let engine = ApplyEngine::new(h.store.clone(), h.runs.clone(), h.changesets.clone(), 500);
    let report = engine.apply(&detected.changeset.id, false).await.unwrap();

    assert!(report.is_success());
    let run = h.runs.get(detected.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, SyncRunStatus::Completed);
    assert!(run.error.is_none());
}
