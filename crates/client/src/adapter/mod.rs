// Network Adapter: performs one mutation request against the backend.
//
// The adapter is the only component that talks to the mutation endpoints.
// It is abstracted behind `NetworkAdapter` so the reconciler can be driven
// by in-memory fakes in tests; `http::HttpNetworkAdapter` is the production
// implementation.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};

use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::types::Row;

use crate::error::AdapterError;

/// Kind of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write against one row.
///
/// Updates carry a partial change set (column name → new value) rather than
/// a full row.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<R> {
    Insert(R),
    Update { key: String, changes: Map<String, Value> },
    Delete { key: String },
}

impl<R: Row> Mutation<R> {
    pub fn key(&self) -> &str {
        match self {
            Self::Insert(row) => row.key(),
            Self::Update { key, .. } | Self::Delete { key } => key,
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Insert(_) => MutationKind::Insert,
            Self::Update { .. } => MutationKind::Update,
            Self::Delete { .. } => MutationKind::Delete,
        }
    }

    /// Whether `server` (the canonical row, if any) reflects this write.
    ///
    /// Inserts count as applied when the row exists, updates when every
    /// changed column holds the submitted value, deletes when the row is gone.
    /// Submitted values are compared in the row's own serialized form, so
    /// `555` matches an `osm_id` stored as `"555"`.
    pub fn is_reflected_by(&self, server: Option<&R>) -> bool {
        match self {
            Self::Insert(_) => server.is_some(),
            Self::Delete { .. } => server.is_none(),
            Self::Update { changes, .. } => {
                let Some(row) = server else {
                    return false;
                };
                let Ok(Value::Object(current)) = serde_json::to_value(row) else {
                    return false;
                };
                let Some(patched) = normalized_patch::<R>(&current, changes) else {
                    return false;
                };
                changes.keys().all(|column| current.get(column) == patched.get(column))
            }
        }
    }
}

/// `current` with `changes` applied, round-tripped through the row type.
fn normalized_patch<R: Row>(
    current: &Map<String, Value>,
    changes: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    let mut columns = current.clone();
    for (column, value) in changes {
        columns.insert(column.clone(), value.clone());
    }
    let row: R = serde_json::from_value(Value::Object(columns)).ok()?;
    match serde_json::to_value(row).ok()? {
        Value::Object(normalized) => Some(normalized),
        _ => None,
    }
}

/// Performs mutation requests for one table scoped to one project.
#[async_trait]
pub trait NetworkAdapter<R: Row>: Send + Sync {
    /// Submit one write. Returns the transaction id the server assigned.
    async fn submit(&self, mutation: &Mutation<R>) -> Result<Txid, AdapterError>;

    /// Point read of the canonical row, used for reconciliation.
    async fn fetch_row(&self, key: &str) -> Result<Option<R>, AdapterError>;

    /// Full current project state for seeding a new collection.
    async fn fetch_snapshot(&self) -> Result<Vec<R>, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::types::{Entity, EntityStatus};
    use serde_json::json;

    fn entity(status: EntityStatus) -> Entity {
        Entity {
            entity_id: "E1".into(),
            status,
            project_id: 7,
            task_id: 1,
            osm_id: "100".into(),
            submission_ids: vec![],
            geometry: None,
            created_by: None,
        }
    }

    fn status_change(status: &str) -> Mutation<Entity> {
        let mut changes = Map::new();
        changes.insert("status".into(), json!(status));
        Mutation::Update { key: "E1".into(), changes }
    }

    #[test]
    fn update_is_reflected_only_when_changed_columns_match() {
        let mutation = status_change("OPENED_IN_ODK");
        assert!(mutation.is_reflected_by(Some(&entity(EntityStatus::OpenedInOdk))));
        assert!(!mutation.is_reflected_by(Some(&entity(EntityStatus::Ready))));
        assert!(!mutation.is_reflected_by(None));
    }

    #[test]
    fn update_reflection_compares_normalized_values() {
        let mut changes = Map::new();
        changes.insert("osm_id".into(), json!(555));
        let mutation: Mutation<Entity> = Mutation::Update { key: "E1".into(), changes };

        let mut server = entity(EntityStatus::Ready);
        server.osm_id = "555".into();
        assert!(mutation.is_reflected_by(Some(&server)));
        assert!(!mutation.is_reflected_by(Some(&entity(EntityStatus::Ready))));

        let mut bad = Map::new();
        bad.insert("status".into(), json!("NOT_A_STATUS"));
        let invalid: Mutation<Entity> = Mutation::Update { key: "E1".into(), changes: bad };
        assert!(!invalid.is_reflected_by(Some(&entity(EntityStatus::Ready))));
    }

    #[test]
    fn insert_and_delete_reflection() {
        let insert = Mutation::Insert(entity(EntityStatus::Ready));
        assert!(insert.is_reflected_by(Some(&entity(EntityStatus::Validated))));
        assert!(!insert.is_reflected_by(None));

        let delete: Mutation<Entity> = Mutation::Delete { key: "E1".into() };
        assert!(delete.is_reflected_by(None));
        assert!(!delete.is_reflected_by(Some(&entity(EntityStatus::Ready))));
    }

    #[test]
    fn key_and_kind() {
        let insert = Mutation::Insert(entity(EntityStatus::Ready));
        assert_eq!(insert.key(), "E1");
        assert_eq!(insert.kind(), MutationKind::Insert);
        assert_eq!(status_change("READY").kind().to_string(), "update");
    }
}
