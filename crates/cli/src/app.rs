//! Wires the Postgres-backed components and runs one command.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use regsync_core::{ClaimScope, Config, DateWindow, PeriodRange, RunSummary, Stage, UnitFilter, UnitStatus};
use regsync_ingest::{
    ArtifactStore, HttpRegistry, IncidentLog, PendingCatalog, Pipeline, RegistrySource, StageContext,
};
use regsync_ledger::{db::init_pg_pool, ControlLedger, EventBus, PgUnitLedger, UnitLedger};
use regsync_stats::{AggregateMaintainer, AggregateStore, ConsistencyVerifier, PgAggregateStore};
use regsync_store::{CanonicalStore, PgStore};
use regsync_sync::{ApplyEngine, ChangesetStore, PgSyncRunStore, Reconciler, SyncRunStore};
use sqlx::PgPool;
use tracing::info;

use crate::cli::{Command, StatsCommand};

pub struct App {
    config: Config,
    pool: PgPool,
}

impl App {
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = init_pg_pool(&config.postgres)
            .await
            .context("failed to initialise postgres")?;
        Ok(Self { config, pool })
    }

    fn ledger(&self) -> Arc<dyn UnitLedger> {
        Arc::new(PgUnitLedger::new(self.pool.clone()))
    }

    fn store(&self) -> Arc<dyn CanonicalStore> {
        Arc::new(PgStore::new(self.pool.clone()))
    }

    fn aggregates(&self) -> Arc<dyn AggregateStore> {
        Arc::new(PgAggregateStore::new(self.pool.clone()))
    }

    fn runs(&self) -> Arc<dyn SyncRunStore> {
        Arc::new(PgSyncRunStore::new(self.pool.clone()))
    }

    fn registry(&self) -> Result<Arc<dyn RegistrySource>> {
        let client = HttpRegistry::new(self.config.registry.clone()).context("failed to build registry client")?;
        Ok(Arc::new(client))
    }

    fn changesets(&self) -> ChangesetStore {
        ChangesetStore::new(self.config.storage.changesets_dir())
    }

    fn pipeline(&self, label: &str, entity: Option<String>) -> Result<Pipeline> {
        let storage = &self.config.storage;
        let mut pipeline_config = self.config.pipeline.clone();
        if let Some(entity) = entity {
            pipeline_config.entity = entity;
        }
        let ctx = StageContext::new(
            pipeline_config,
            self.config.registry.page_size,
            self.registry()?,
            self.store(),
            Arc::new(ControlLedger::new(storage.control_dir())),
            ArtifactStore::from_config(storage),
            PendingCatalog::new(storage.pending_dir()),
            IncidentLog::new(&storage.incidents_dir(), label),
        );
        Ok(Pipeline::new(Arc::new(ctx), self.ledger(), EventBus::default()))
    }

    pub async fn run(&self, command: Command) -> Result<RunSummary> {
        let name = command.name();
        match command {
            Command::Bootstrap { year, entity, subtypes } => {
                let entity = entity.unwrap_or_else(|| self.config.pipeline.entity.clone());
                let subtypes = subtypes.unwrap_or_else(|| self.config.pipeline.subtypes.clone());
                let created = self
                    .ledger()
                    .bootstrap(&entity, PeriodRange::year(year), &subtypes, &Stage::ALL)
                    .await?;
                println!("{} work units created for {} {}", created, entity, year);
                let mut summary = RunSummary::new(name);
                summary.processed = created;
                summary.succeeded = created;
                Ok(summary)
            }

            Command::RunStage { stage, year, month, subtype, entity } => {
                let entity = entity.unwrap_or_else(|| self.config.pipeline.entity.clone());
                let pipeline = self.pipeline(stage.as_str(), Some(entity.clone()))?;
                let scope = ClaimScope::stage(stage)
                    .year(year)
                    .month(month)
                    .subtype(subtype)
                    .entity(Some(entity));
                let mut summary = pipeline.run_stage(&scope).await?;
                summary.command = name.to_string();
                summary.incidents_file = pipeline.context().incidents.finish()?;
                Ok(summary)
            }

            Command::RunPipeline { year, workers, entity } => {
                let entity = entity.unwrap_or_else(|| self.config.pipeline.entity.clone());
                let workers = workers.unwrap_or(self.config.pipeline.workers);
                let pipeline = self.pipeline("pipeline", Some(entity.clone()))?;
                let filter = UnitFilter {
                    entity: Some(entity),
                    year: Some(year),
                    ..UnitFilter::default()
                };
                let mut summary = pipeline.run_pipeline(&filter, workers).await?;
                summary.command = name.to_string();
                summary.incidents_file = pipeline.context().incidents.finish()?;
                Ok(summary)
            }

            Command::Requeue { year, month, stage, subtype, include_running } => {
                let filter = UnitFilter {
                    entity: None,
                    year,
                    month,
                    subtype,
                    stage,
                };
                let requeued = self.ledger().requeue(&filter, include_running).await?;
                println!("{} work units requeued", requeued);
                let mut summary = RunSummary::new(name);
                summary.processed = requeued;
                summary.succeeded = requeued;
                Ok(summary)
            }

            Command::Status { year, entity } => {
                let filter = UnitFilter {
                    entity,
                    year,
                    ..UnitFilter::default()
                };
                let status = self.ledger().summary(&filter).await?;
                println!("{:<10} {:>8} {:>8} {:>8} {:>8}", "stage", "pending", "running", "done", "error");
                for stage in Stage::ALL {
                    println!(
                        "{:<10} {:>8} {:>8} {:>8} {:>8}",
                        stage.as_str(),
                        status.count(stage, UnitStatus::Pending),
                        status.count(stage, UnitStatus::Running),
                        status.count(stage, UnitStatus::Done),
                        status.count(stage, UnitStatus::Error),
                    );
                }
                let mut summary = RunSummary::new(name);
                summary.processed = status.total() as u64;
                summary.succeeded = summary.processed;
                Ok(summary)
            }

            Command::Reconcile { window_months, dry_run } => {
                let months = window_months.unwrap_or(self.config.sync.window_months);
                let window = DateWindow::months_back(Utc::now().date_naive(), months);
                let reconciler = Reconciler::new(
                    self.registry()?,
                    self.store(),
                    self.runs(),
                    self.changesets(),
                    self.config.registry.page_size,
                    self.config.pipeline.fetch_concurrency,
                );
                let report = reconciler.reconcile(window, dry_run).await?;
                let counts = report.changeset.counts();
                match &report.path {
                    Some(path) => println!("changeset {} ({}) written to {}", report.changeset.id, counts, path.display()),
                    None => println!("dry run over {}: {}", window, counts),
                }
                let mut summary = RunSummary::new(name);
                summary.processed = report.remote_records + report.invalid + report.undated;
                summary.succeeded = report.remote_records;
                summary.failed = report.invalid;
                Ok(summary)
            }

            Command::Apply { changeset_id, dry_run } => {
                let store = self.store();
                let maintainer = AggregateMaintainer::new(store.clone(), self.aggregates());
                let engine = ApplyEngine::new(store, self.runs(), self.changesets(), self.config.sync.batch_size)
                    .with_listener(Arc::new(maintainer));
                let report = engine.apply(&changeset_id, dry_run).await?;
                if dry_run {
                    println!("dry run of changeset {}: {}", report.changeset_id, report.planned);
                } else {
                    println!("changeset {} applied: {}", report.changeset_id, report.applied);
                }
                let mut summary = RunSummary::new(name);
                summary.processed = report.planned.total();
                summary.succeeded = if dry_run { report.planned.total() } else { report.applied.total() };
                summary.fatal = report.error;
                Ok(summary)
            }

            Command::Stats { command: StatsCommand::Recompute } => {
                let maintainer = AggregateMaintainer::new(self.store(), self.aggregates());
                let rows = maintainer.full_recompute().await?;
                println!("{} aggregate rows recomputed", rows);
                let mut summary = RunSummary::new(name);
                summary.processed = rows as u64;
                summary.succeeded = rows as u64;
                Ok(summary)
            }

            Command::Stats { command: StatsCommand::Verify } => {
                let verifier = ConsistencyVerifier::new(self.store(), self.aggregates(), self.config.sync.sum_tolerance);
                let report = verifier.verify().await?;
                for mismatch in &report.mismatches {
                    println!("{}", mismatch);
                }
                info!(checked = report.checked, mismatches = report.mismatches.len(), "verification done");
                let mut summary = RunSummary::new(name);
                summary.processed = report.checked;
                summary.failed = report.mismatches.len() as u64;
                summary.succeeded = report.checked.saturating_sub(summary.failed);
                Ok(summary)
            }
        }
    }
}
