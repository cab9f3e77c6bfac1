//! Per `(subject, period, dimension)` award aggregates derived from facts,
//! maintained by full recompute or incrementally, and audited by an
//! independent verifier.

pub mod error;
pub mod maintainer;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod verify;

pub use error::StatsError;
pub use maintainer::{aggregate, AggregateMaintainer};
pub use memory::MemoryAggregateStore;
pub use postgres::PgAggregateStore;
pub use store::{AggregateDelta, AggregateStore};
pub use verify::{ConsistencyVerifier, Mismatch, MismatchKind, VerifyReport};
