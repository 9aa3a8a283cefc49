use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Lifecycle state of an uplet on the ledger.
///
/// Transitions form a DAG owned by the ledger: `todo -> pending ->
/// {done, failed}`, no backward edges.  Workers only ever claim a `todo`
/// task and report `done` or `failed` from `pending`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Published by the orchestrator, not yet picked up.
    Todo,
    /// A worker has claimed the task.
    Pending,
    /// Terminal: the task completed and its outputs were reported.
    Done,
    /// Terminal: the task failed; outputs are not to be trusted.
    Failed,
}

impl TaskStatus {
    /// Parse a wire status string, mapping unknown values to a
    /// [`ValidationError`] rather than a decode error.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        Self::from_str(raw).map_err(|_| ValidationError::UnknownStatus {
            status: raw.to_owned(),
        })
    }
}
