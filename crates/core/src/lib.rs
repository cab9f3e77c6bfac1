pub mod config;
pub mod error;
pub mod fsio;
pub mod model;
pub mod period;
pub mod summary;
pub mod unit;

pub use config::Config;
pub use error::*;
pub use model::*;
pub use period::{DateWindow, Period, PeriodRange};
pub use summary::{ExitStatus, RunSummary};
pub use unit::*;
