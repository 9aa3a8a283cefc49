//! Shared data model for the weft compute layer.
//!
//! Everything that crosses a process boundary lives here: the task
//! descriptions pulled from the ledger (`LearnUplet`, `PredUplet`), the
//! storage metadata records, and the performance report produced by a
//! problem-workflow container.

mod error;
mod perf;
mod record;
mod status;
mod uplet;

pub use error::ValidationError;
pub use perf::Perfuplet;
pub use record::{AlgoRecord, ModelRecord, PredictionRecord};
pub use status::TaskStatus;
pub use uplet::{LearnUplet, PredUplet};
