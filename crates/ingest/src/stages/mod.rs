//! Extract, Transform and Load, each a function of one claimed work unit.
//!
//! Record-level problems are recorded as incidents and counted in the
//! [`StageReport`]; only unit-level failures are returned as errors.

pub mod extract;
pub mod load;
pub mod transform;

use std::sync::Arc;

use regsync_core::config::PipelineConfig;
use regsync_core::{PipelineError, Stage, UnitKey, WorkUnit};
use regsync_ledger::ControlLedger;
use regsync_store::CanonicalStore;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::artifacts::ArtifactStore;
use crate::catalog::CatalogSet;
use crate::client::RegistrySource;
use crate::incidents::{Incident, IncidentLog};
use crate::pending::PendingCatalog;

/// Collaborators shared by every stage execution in one run.
pub struct StageContext {
    pub config: PipelineConfig,
    pub page_size: u32,
    pub source: Arc<dyn RegistrySource>,
    pub store: Arc<dyn CanonicalStore>,
    pub control: Arc<ControlLedger>,
    pub artifacts: ArtifactStore,
    pub pending: PendingCatalog,
    pub incidents: IncidentLog,
    catalogs: OnceCell<Arc<CatalogSet>>,
}

impl StageContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        page_size: u32,
        source: Arc<dyn RegistrySource>,
        store: Arc<dyn CanonicalStore>,
        control: Arc<ControlLedger>,
        artifacts: ArtifactStore,
        pending: PendingCatalog,
        incidents: IncidentLog,
    ) -> Self {
        Self {
            config,
            page_size,
            source,
            store,
            control,
            artifacts,
            pending,
            incidents,
            catalogs: OnceCell::new(),
        }
    }

    /// Catalogs are loaded from the store once per run.
    pub async fn catalogs(&self) -> Result<Arc<CatalogSet>, PipelineError> {
        let set = self
            .catalogs
            .get_or_try_init(|| async {
                CatalogSet::load(self.store.as_ref()).await.map(Arc::new)
            })
            .await?;
        Ok(set.clone())
    }

    pub fn incident(&self, unit: &WorkUnit, record_id: &str, error: &PipelineError) {
        self.incidents
            .record(Incident::new(record_id, error).unit(unit.key()));
    }
}

/// Outcome of one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub unit_id: i64,
    pub key: UnitKey,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Set when the unit must end in `error`.
    pub error: Option<String>,
}

impl StageReport {
    pub fn new(unit: &WorkUnit) -> Self {
        Self {
            unit_id: unit.id,
            key: unit.key(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            error: None,
        }
    }

    pub fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Dispatches to the stage of `unit`.
pub async fn run(ctx: &StageContext, unit: &WorkUnit) -> Result<StageReport, PipelineError> {
    match unit.stage {
        Stage::Extract => extract::run(ctx, unit).await,
        Stage::Transform => transform::run(ctx, unit).await,
        Stage::Load => load::run(ctx, unit).await,
    }
}
