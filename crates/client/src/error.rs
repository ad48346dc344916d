// Error taxonomy for the synchronization core.
//
// Transport failures are retryable; rejections (4xx) are surfaced verbatim
// and never retried; stream desynchronization is handled internally by a
// resnapshot; confirmation timeouts end in a reconciliation read.

use fieldsync_common::protocol::mutation::Txid;

use crate::adapter::MutationKind;

/// Failure of a single Network Adapter request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("{detail}")]
    Rejected { status: u16, detail: String },
    #[error("server error ({status}): {detail}")]
    Server { status: u16, detail: String },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl AdapterError {
    /// Classify an HTTP error status.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if (400..500).contains(&status) {
            Self::Rejected { status, detail }
        } else {
            Self::Server { status, detail }
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server { .. })
    }
}

/// Why a local mutation did not take effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("mutation already in flight for key {key}")]
    InFlight { key: String },
    /// The backend refused the write; `detail` is the server's message.
    #[error("{detail}")]
    Rejected { status: u16, detail: String },
    #[error("mutation could not be delivered: {0}")]
    Network(AdapterError),
    /// Confirmation never arrived and the server does not reflect the write.
    #[error("mutation lost for key {key} (txid {txid})")]
    Lost { key: String, txid: Txid },
    #[error("{table} does not support {operation}")]
    Unsupported { table: &'static str, operation: MutationKind },
    #[error("no row with key {key}")]
    NotFound { key: String },
    #[error("a row with key {key} already exists")]
    AlreadyExists { key: String },
    #[error("invalid change set: {0}")]
    InvalidPatch(String),
    #[error("collection is closed")]
    Closed,
}

impl From<AdapterError> for MutationError {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Rejected { status, detail } => Self::Rejected { status, detail },
            other => Self::Network(other),
        }
    }
}

/// Failure of the shape subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("shape request failed: {0}")]
    Transient(String),
    /// Terminates the subscription (e.g. authorization revoked).
    #[error("shape subscription rejected ({status}): {message}")]
    Permanent { status: u16, message: String },
    #[error("malformed shape response: {0}")]
    Protocol(String),
}

impl ShapeError {
    /// Classify an HTTP error status returned by the shape endpoint.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 401 | 403 | 404 => Self::Permanent { status, message },
            _ => Self::Transient(format!("HTTP {status}: {message}")),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Why a collection never became (or stopped being) live.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    #[error("subscription failed: {0}")]
    Failed(String),
    #[error("collection is closed")]
    Closed,
}
