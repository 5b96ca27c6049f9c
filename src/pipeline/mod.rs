pub mod partition;
pub mod runner;
pub mod runs;

pub use runner::{Pipeline, TickerSelection};
pub use runs::{RunRecord, RunRepository, RunStatus, RunSummary, Stage};
