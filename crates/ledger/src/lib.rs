pub mod control;
pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod memory;
pub mod postgres;

pub use control::{ControlLedger, ControlList};
pub use error::LedgerError;
pub use events::{EventBus, StageCompleted};
pub use ledger::{bootstrap_keys, UnitLedger};
pub use memory::MemoryUnitLedger;
pub use postgres::PgUnitLedger;
