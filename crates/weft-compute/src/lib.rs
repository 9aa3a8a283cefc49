//! Worker execution pipelines for the weft compute layer.
//!
//! A [`Worker`] executes learn- and pred-uplets as staged, idempotent
//! container workflows; the [`Dispatcher`] pulls tasks from the broker
//! under per-topic parallelism caps and timeouts; the [`Relay`] forwards
//! freshly published ledger tasks onto the broker exactly once per process
//! lifetime.

pub mod dispatch;
pub mod error;
pub mod images;
pub mod relay;
pub mod worker;
pub mod workspace;

#[cfg(test)]
mod tests;

pub use dispatch::{Dispatcher, Subscription, TaskHandler, TopicConfig};
pub use error::ComputeError;
pub use images::ImageSet;
pub use relay::Relay;
pub use worker::Worker;
pub use workspace::TaskWorkspace;
