use thiserror::Error;
use uuid::Uuid;

use weft_archive::ArchiveError;
use weft_clients::ClientError;
use weft_runtime::RuntimeError;
use weft_types::ValidationError;

/// Everything that can go wrong while executing one task.
///
/// Each variant carries its retry classification: the dispatcher requeues a
/// delivery only when [`ComputeError::is_retryable`] says a later attempt
/// can succeed; everything else is acknowledged after the `failed` report.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// The message body is not a valid JSON uplet.
    #[error("error decoding task body to JSON: {0}")]
    Decode(#[from] serde_json::Error),

    /// The uplet decoded but violates a data-model invariant.
    #[error("invalid uplet: {0}")]
    Validation(#[from] ValidationError),

    /// A storage or ledger call failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The container runtime failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Packing or unpacking an artifact failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Local filesystem failure in the task workspace.
    #[error("workspace i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A spawn_blocking stage panicked or was aborted.
    #[error("blocking stage failed: {reason}")]
    Blocking { reason: String },

    /// `perf/performance.json` is missing or malformed.
    #[error("reading performance report: {reason}")]
    Perf { reason: String },

    /// The predict container did not produce `pred/<data>`.
    #[error("missing prediction file for data {data}")]
    MissingPrediction { data: Uuid },

    /// A model archive must unpack to exactly one file before prediction.
    #[error("model archive unpacked to {count} files, expected exactly one")]
    AmbiguousModel { count: usize },

    /// The task was cancelled by the dispatcher.
    #[error("task cancelled")]
    Cancelled,

    /// The task exceeded its per-topic execution budget.
    #[error("task exceeded its execution budget")]
    Timeout,
}

impl ComputeError {
    /// Whether the broker should redeliver the task.
    ///
    /// Transient infrastructure failures and interrupted attempts are worth
    /// retrying; malformed tasks and failing user containers are not, since
    /// a redelivery would fail identically.
    pub fn is_retryable(&self) -> bool {
        match self {
            ComputeError::Client(e) => e.is_transient(),
            ComputeError::Runtime(e) => matches!(
                e,
                RuntimeError::Unavailable { .. } | RuntimeError::Cancelled
            ),
            ComputeError::Cancelled | ComputeError::Timeout => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_client_errors_are_retryable() {
        let err = ComputeError::Client(ClientError::Unavailable {
            service: "storage",
            reason: "connection refused".to_owned(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn container_failures_are_not_retryable() {
        let err = ComputeError::Runtime(RuntimeError::NonZeroExit {
            container: "c".to_owned(),
            code: 1,
        });
        assert!(!err.is_retryable());

        let err = ComputeError::Runtime(RuntimeError::Timeout {
            container: "c".to_owned(),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = ComputeError::Validation(ValidationError::MissingField { field: "key" });
        assert!(!err.is_retryable());
    }

    #[test]
    fn cancellation_and_budget_timeouts_are_retryable() {
        assert!(ComputeError::Cancelled.is_retryable());
        assert!(ComputeError::Timeout.is_retryable());
    }
}
