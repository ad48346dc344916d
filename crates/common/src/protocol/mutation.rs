// Request/response bodies for the mutation endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned transaction identifier.
///
/// Correlates a mutation response with the change(s) it produced on the
/// shape stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Txid(pub i64);

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Successful mutation response: `{ "entity": <row>, "txid": <number> }`.
///
/// `entity` is null for deletes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationResponse<R> {
    pub entity: Option<R>,
    pub txid: Txid,
}

/// Error body returned with a 4xx/5xx status.
///
/// `detail` is usually a string, but validation failures may return a list
/// of field errors; those are rendered as compact JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub detail: serde_json::Value,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self { detail: serde_json::Value::String(detail.into()) }
    }

    /// Human-readable detail, surfaced verbatim to callers.
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}
