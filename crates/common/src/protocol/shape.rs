// Message types for the shape replication stream.
//
// A shape is a filtered, ordered view of one table. Each HTTP response
// carries a JSON array of messages plus two headers: the shape handle and
// the log offset reached after the batch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::mutation::Txid;

/// Response header carrying the server-assigned shape handle.
pub const HANDLE_HEADER: &str = "fieldsync-handle";
/// Response header carrying the log offset reached after a batch.
pub const OFFSET_HEADER: &str = "fieldsync-offset";

/// Path of the shape endpoint relative to the API base URL.
pub const SHAPE_PATH: &str = "v1/shape";

/// Position in the server's replication log.
///
/// Offsets are totally ordered; `BeforeStart` requests a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogOffset {
    #[default]
    BeforeStart,
    At {
        tx: u64,
        op: u64,
    },
}

impl LogOffset {
    pub const fn at(tx: u64, op: u64) -> Self {
        Self::At { tx, op }
    }
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeStart => f.write_str("-1"),
            Self::At { tx, op } => write!(f, "{tx}_{op}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid log offset: {0:?}")]
pub struct InvalidOffset(pub String);

impl FromStr for LogOffset {
    type Err = InvalidOffset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-1" {
            return Ok(Self::BeforeStart);
        }
        let (tx, op) = s.split_once('_').ok_or_else(|| InvalidOffset(s.to_string()))?;
        let tx = tx.parse().map_err(|_| InvalidOffset(s.to_string()))?;
        let op = op.parse().map_err(|_| InvalidOffset(s.to_string()))?;
        Ok(Self::At { tx, op })
    }
}

impl Serialize for LogOffset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogOffset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque server identifier for one materialized shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeHandle(pub String);

impl fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a shape response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ShapeMessage {
    Change(ChangeMessage),
    Control(ControlMessage),
}

/// A row-level change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeMessage {
    /// Primary key of the affected row.
    pub key: String,
    /// Full row for inserts/updates; at least the primary key for deletes.
    #[serde(default)]
    pub value: serde_json::Value,
    pub headers: ChangeHeaders,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeHeaders {
    pub operation: Operation,
    /// Transactions that produced this change, when it came from a mutation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub txids: Vec<Txid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    pub headers: ControlHeaders,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlHeaders {
    pub control: Control,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Control {
    /// The client has caught up with the log.
    UpToDate,
    /// The resume position is no longer valid; refetch from scratch.
    MustRefetch,
}

impl ShapeMessage {
    pub fn up_to_date() -> Self {
        Self::Control(ControlMessage { headers: ControlHeaders { control: Control::UpToDate } })
    }

    pub fn must_refetch() -> Self {
        Self::Control(ControlMessage { headers: ControlHeaders { control: Control::MustRefetch } })
    }

    pub fn change(
        key: impl Into<String>,
        operation: Operation,
        value: serde_json::Value,
        txids: Vec<Txid>,
    ) -> Self {
        Self::Change(ChangeMessage {
            key: key.into(),
            value,
            headers: ChangeHeaders { operation, txids },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offsets_are_totally_ordered() {
        assert!(LogOffset::BeforeStart < LogOffset::at(0, 0));
        assert!(LogOffset::at(1, 9) < LogOffset::at(2, 0));
        assert!(LogOffset::at(2, 0) < LogOffset::at(2, 1));
    }

    #[test]
    fn offset_parses_wire_format() {
        assert_eq!("-1".parse::<LogOffset>().unwrap(), LogOffset::BeforeStart);
        assert_eq!("1934_3".parse::<LogOffset>().unwrap(), LogOffset::at(1934, 3));
        assert_eq!(LogOffset::at(1934, 3).to_string(), "1934_3");
        assert!("1934".parse::<LogOffset>().is_err());
        assert!("a_b".parse::<LogOffset>().is_err());
    }

    #[test]
    fn change_message_decodes_with_txids() {
        let raw = json!([
            {
                "key": "E1",
                "value": {"entity_id": "E1", "status": "READY"},
                "headers": {"operation": "insert", "txids": [42]}
            },
            {"headers": {"control": "up-to-date"}}
        ]);
        let messages: Vec<ShapeMessage> = serde_json::from_value(raw).unwrap();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ShapeMessage::Change(change) => {
                assert_eq!(change.key, "E1");
                assert_eq!(change.headers.operation, Operation::Insert);
                assert_eq!(change.headers.txids, vec![Txid(42)]);
            }
            other => panic!("expected change, got {other:?}"),
        }
        assert_eq!(messages[1], ShapeMessage::up_to_date());
    }

    #[test]
    fn delete_without_txids_decodes() {
        let raw = json!({"key": "E2", "headers": {"operation": "delete"}});
        let message: ShapeMessage = serde_json::from_value(raw).unwrap();
        match message {
            ShapeMessage::Change(change) => {
                assert_eq!(change.headers.operation, Operation::Delete);
                assert!(change.headers.txids.is_empty());
                assert!(change.value.is_null());
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn must_refetch_uses_kebab_case() {
        let value = serde_json::to_value(ShapeMessage::must_refetch()).unwrap();
        assert_eq!(value, json!({"headers": {"control": "must-refetch"}}));
    }
}
