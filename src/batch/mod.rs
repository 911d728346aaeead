//! Batch orchestration: enumerate units, analyze them, publish once.

mod driver;
mod metrics;

pub use driver::{BatchDriver, BatchOptions, BatchReport, UnitFailure};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
