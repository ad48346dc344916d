// Property tests: the store converges to the authoritative stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{json, Map};

use fieldsync_client::adapter::{Mutation, NetworkAdapter};
use fieldsync_client::reconciler::Reconciler;
use fieldsync_client::shape::{ChangeOp, RemoteChange};
use fieldsync_client::store::CollectionStore;
use fieldsync_client::AdapterError;
use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::types::{Entity, EntityStatus};

const KEYS: [&str; 4] = ["E1", "E2", "E3", "E4"];

struct FailingAdapter;

#[async_trait]
impl NetworkAdapter<Entity> for FailingAdapter {
    async fn submit(&self, _mutation: &Mutation<Entity>) -> Result<Txid, AdapterError> {
        Err(AdapterError::from_status(422, "rejected"))
    }

    async fn fetch_row(&self, _key: &str) -> Result<Option<Entity>, AdapterError> {
        Ok(None)
    }

    async fn fetch_snapshot(&self) -> Result<Vec<Entity>, AdapterError> {
        Ok(vec![])
    }
}

fn entity(key: &str, status: EntityStatus, task_id: i64) -> Entity {
    Entity {
        entity_id: key.into(),
        status,
        project_id: 7,
        task_id,
        osm_id: "1".into(),
        submission_ids: vec![],
        geometry: None,
        created_by: None,
    }
}

fn remote_change() -> impl Strategy<Value = RemoteChange<Entity>> {
    (
        prop::sample::select(KEYS.to_vec()),
        prop::option::weighted(0.8, (prop::sample::select(EntityStatus::ALL.to_vec()), 0..5i64)),
        prop::collection::vec(1..1000i64, 0..2),
    )
        .prop_map(|(key, row, txids)| RemoteChange {
            key: key.to_string(),
            op: match row {
                Some((status, task_id)) => ChangeOp::Upsert(entity(key, status, task_id)),
                None => ChangeOp::Delete,
            },
            txids: txids.into_iter().map(Txid).collect(),
        })
}

/// Changes split into batches of arbitrary size.
fn batches() -> impl Strategy<Value = Vec<Vec<RemoteChange<Entity>>>> {
    prop::collection::vec(prop::collection::vec(remote_change(), 0..6), 0..12)
}

fn last_values(batches: &[Vec<RemoteChange<Entity>>]) -> BTreeMap<String, Entity> {
    let mut model = BTreeMap::new();
    for change in batches.iter().flatten() {
        match &change.op {
            ChangeOp::Upsert(row) => {
                model.insert(change.key.clone(), row.clone());
            }
            ChangeOp::Delete => {
                model.remove(&change.key);
            }
        }
    }
    model
}

fn reconciler() -> (Reconciler<Entity>, Arc<CollectionStore<Entity>>) {
    let store = Arc::new(CollectionStore::default());
    let reconciler =
        Reconciler::new(Arc::clone(&store), Arc::new(FailingAdapter), Duration::from_secs(30));
    (reconciler, store)
}

fn store_contents(store: &CollectionStore<Entity>) -> BTreeMap<String, Entity> {
    store.list().into_iter().map(|row| (row.entity_id.clone(), row)).collect()
}

proptest! {
    #[test]
    fn store_equals_last_remote_value(batches in batches()) {
        let (reconciler, store) = reconciler();

        for batch in batches.clone() {
            reconciler.apply_remote(batch);
        }

        prop_assert_eq!(store_contents(&store), last_values(&batches));
    }

    #[test]
    fn rolled_back_mutation_converges_to_stream(
        before in batches(),
        during in batches(),
        status in prop::sample::select(EntityStatus::ALL.to_vec()),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (reconciler, store) = reconciler();
        store.upsert(entity("E1", EntityStatus::Ready, 0));
        let mut all = vec![vec![RemoteChange {
            key: "E1".into(),
            op: ChangeOp::Upsert(entity("E1", EntityStatus::Ready, 0)),
            txids: vec![],
        }]];

        for batch in before.clone() {
            reconciler.apply_remote(batch);
        }
        all.extend(before);

        let mut changes = Map::new();
        changes.insert("status".into(), json!(status));
        let staged = match reconciler.stage(Mutation::Update { key: "E1".into(), changes }) {
            Ok(staged) => staged,
            // E1 was deleted by the stream; nothing to roll back.
            Err(_) => None,
        };

        for batch in during.clone() {
            reconciler.apply_remote(batch);
        }
        all.extend(during);

        if let Some(staged) = staged {
            let result = runtime.block_on(reconciler.submit(staged));
            prop_assert!(result.is_err());
        }

        prop_assert!(reconciler.pending().is_empty());
        prop_assert_eq!(store_contents(&store), last_values(&all));
    }
}
