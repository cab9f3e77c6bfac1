//! Windowed reconciliation of remote awards against the canonical store and
//! idempotent application of the resulting changesets.

pub mod apply;
pub mod changeset;
pub mod error;
pub mod fingerprint;
pub mod reconcile;
pub mod runs;

pub use apply::{ApplyEngine, ApplyReport, FactListener};
pub use changeset::{Changeset, ChangesetStore};
pub use error::SyncError;
pub use fingerprint::{fingerprint, fingerprints, Fingerprints};
pub use reconcile::{classify, Classification, Reconciler, ReconcileReport};
pub use runs::{ChangeCounts, MemorySyncRunStore, PgSyncRunStore, SyncRun, SyncRunStatus, SyncRunStore};
