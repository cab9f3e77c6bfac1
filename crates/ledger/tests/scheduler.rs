use std::collections::HashSet;
use std::sync::Arc;

use regsync_core::{ClaimScope, PeriodRange, Stage, UnitFilter, UnitStatus, DEFAULT_SUBTYPES};
use regsync_ledger::{MemoryUnitLedger, UnitLedger};

fn subtypes() -> Vec<String> {
    DEFAULT_SUBTYPES.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn bootstrap_year_then_extract_unlocks_transform() {
    let ledger = MemoryUnitLedger::new();
    let created = ledger
        .bootstrap("call", PeriodRange::year(2024), &subtypes(), &Stage::ALL)
        .await
        .unwrap();
    assert_eq!(created, 144);

    let summary = ledger.summary(&UnitFilter::year(2024)).await.unwrap();
    assert_eq!(summary.status_total(UnitStatus::Pending), 144);
    assert_eq!(
        ledger.count_claimable(&ClaimScope::stage(Stage::Transform)).await.unwrap(),
        0
    );

    while let Some(unit) = ledger.claim_next(Stage::Extract).await.unwrap() {
        ledger.finish(unit.id, true, None).await.unwrap();
    }

    let summary = ledger.summary(&UnitFilter::year(2024)).await.unwrap();
    assert_eq!(summary.count(Stage::Extract, UnitStatus::Done), 48);
    assert_eq!(
        ledger.count_claimable(&ClaimScope::stage(Stage::Transform)).await.unwrap(),
        48
    );
    assert_eq!(
        ledger.count_claimable(&ClaimScope::stage(Stage::Load)).await.unwrap(),
        0
    );

    let mut claimed = 0;
    while ledger.claim_next(Stage::Transform).await.unwrap().is_some() {
        claimed += 1;
    }
    assert_eq!(claimed, 48);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_are_exclusive() {
    let ledger = Arc::new(MemoryUnitLedger::new());
    ledger
        .bootstrap("call", PeriodRange::year(2024), &subtypes(), &[Stage::Extract])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(unit) = ledger.claim_next(Stage::Extract).await.unwrap() {
                mine.push(unit.id);
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for result in futures::future::join_all(handles).await {
        all.extend(result.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 48);
    assert_eq!(unique.len(), 48);

    let summary = ledger.summary(&UnitFilter::default()).await.unwrap();
    assert_eq!(summary.count(Stage::Extract, UnitStatus::Running), 48);
}

#[tokio::test]
async fn scoped_claim_respects_month_and_subtype() {
    let ledger = MemoryUnitLedger::new();
    ledger
        .bootstrap("call", PeriodRange::year(2024), &subtypes(), &[Stage::Extract])
        .await
        .unwrap();

    let scope = ClaimScope::stage(Stage::Extract)
        .year(2024)
        .month(Some(3))
        .subtype(Some("L".to_string()));
    let unit = ledger.claim(&scope).await.unwrap().unwrap();
    assert_eq!(unit.period.month, 3);
    assert_eq!(unit.subtype, "L");
    assert!(ledger.claim(&scope).await.unwrap().is_none());
}
