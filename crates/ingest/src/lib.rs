//! Staged ingestion of the remote registry: Extract pages the listing and
//! fetches details into raw artifacts, Transform resolves catalog references
//! into enriched artifacts, Load upserts them into the canonical store.

pub mod artifacts;
pub mod backoff;
pub mod catalog;
pub mod client;
pub mod incidents;
pub mod pending;
pub mod runner;
pub mod stages;

pub use artifacts::ArtifactStore;
pub use catalog::{CatalogSet, CatalogTable};
pub use client::{fetch_listing, Dataset, HttpRegistry, Page, PageQuery, RegistrySource};
pub use incidents::{Incident, IncidentLog};
pub use pending::PendingCatalog;
pub use runner::Pipeline;
pub use stages::{StageContext, StageReport};
