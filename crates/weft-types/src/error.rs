use thiserror::Error;

/// A task description violated one of the data-model invariants.
///
/// Validation runs in the ingestion API before a task is enqueued, and is
/// re-run defensively at the start of each pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is empty or the nil UUID.
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    /// The status string is not one of the known task statuses.
    #[error("unknown status: {status:?}")]
    UnknownStatus { status: String },

    /// `rank` > 0 requires a usable starting model.
    #[error("model_start is nil although rank is set to {rank}")]
    MissingModelStart { rank: u32 },

    /// `train_data` and `test_data` must not share dataset UUIDs.
    #[error("train_data and test_data overlap on {uuid}")]
    OverlappingData { uuid: uuid::Uuid },

    /// A dataset list is empty.
    #[error("{field} must not be empty")]
    EmptyDataSet { field: &'static str },

    /// `pending` (and later) statuses require an assigned worker.
    #[error("status {status} requires a worker to be set")]
    MissingWorker { status: String },
}
