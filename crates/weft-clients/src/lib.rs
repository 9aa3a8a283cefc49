//! HTTP clients for the platform's storage and ledger services.
//!
//! Pipelines depend only on the [`Storage`] and [`Ledger`] traits; the
//! reqwest-backed implementations live in [`storage`] and [`ledger`], and
//! the recording mocks used across the test suite in [`mock`].

pub mod ledger;
pub mod mock;
pub mod storage;

use thiserror::Error;

pub use ledger::{Ledger, LedgerAck, LedgerHttp};
pub use mock::{LedgerMock, StorageMock};
pub use storage::{BlobKind, BlobStream, Storage, StorageHttp};

/// Errors surfaced by the storage and ledger adapters.
///
/// The split between [`ClientError::Unavailable`] and
/// [`ClientError::Rejected`] drives retry classification: transient
/// failures are requeued by the broker, permanent ones fail the task.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transient: connection refused, timeout, or a 5xx answer.
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },

    /// Permanent: the service understood the request and refused it.
    #[error("{service} rejected request with status {status}: {reason}")]
    Rejected {
        service: &'static str,
        status: u16,
        reason: String,
    },

    /// The response body could not be decoded.
    #[error("decoding {service} response: {reason}")]
    Decode { service: &'static str, reason: String },
}

impl ClientError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Unavailable { .. })
    }

    pub(crate) fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        ClientError::Unavailable {
            service,
            reason: err.to_string(),
        }
    }

    /// Map a non-success HTTP status to the transient/permanent split.
    pub(crate) fn from_status(
        service: &'static str,
        status: reqwest::StatusCode,
        reason: String,
    ) -> Self {
        if status.is_server_error() {
            ClientError::Unavailable {
                service,
                reason: format!("status {status}: {reason}"),
            }
        } else {
            ClientError::Rejected {
                service,
                status: status.as_u16(),
                reason,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = ClientError::from_status(
            "storage",
            reqwest::StatusCode::BAD_GATEWAY,
            "upstream".to_owned(),
        );
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = ClientError::from_status(
            "storage",
            reqwest::StatusCode::NOT_FOUND,
            "no such blob".to_owned(),
        );
        assert!(!err.is_transient());
        assert!(matches!(err, ClientError::Rejected { status: 404, .. }));
    }
}
