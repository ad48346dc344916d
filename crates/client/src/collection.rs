// Collection: the live, optimistic replica of one table for one project.
//
// A collection owns its store and reconciler, and a driver task that pulls
// events from the shape subscription and funnels them through the
// reconciler. Local writes go through the same reconciler on the caller's
// task. Dropping the last handle aborts the driver.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use fieldsync_common::types::{Entity, EntityStatus, Row, TaskEvent};

use crate::adapter::{Mutation, NetworkAdapter};
use crate::error::{CollectionError, MutationError, ShapeError};
use crate::reconciler::{
    MutationOutcome, PendingMutationInfo, Reconciler, StagedMutation,
    DEFAULT_CONFIRMATION_TIMEOUT,
};
use crate::shape::{ReconnectPolicy, ResumePosition, ShapeEvent, ShapeSubscription, ShapeTransport};
use crate::store::{CollectionEvent, CollectionStore, DEFAULT_NOTIFICATION_CAPACITY};

// ── Options / status ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOptions {
    pub confirmation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Seed from the project snapshot endpoint before the shape snapshot.
    pub seed_from_snapshot: bool,
    pub notification_capacity: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            seed_from_snapshot: true,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

/// Connection status of a collection's subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStatus {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Failed(String),
    Closed,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed(_) => "failed",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
struct SyncState {
    status: CollectionStatus,
    /// Set once authoritative state has been received; never cleared.
    ready: bool,
    position: Option<ResumePosition>,
}

// ── Collection ──────────────────────────────────────────────────────

struct Shared<R: Row> {
    project_id: i64,
    store: Arc<CollectionStore<R>>,
    reconciler: Reconciler<R>,
    sync: watch::Sender<SyncState>,
}

/// Owns the driver task; aborts it when the last handle goes away.
struct Lifecycle {
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycle {
    fn take(&self) -> Option<JoinHandle<()>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(driver) = self.take() {
            driver.abort();
        }
    }
}

/// Cloneable handle to one live collection.
pub struct Collection<R: Row> {
    shared: Arc<Shared<R>>,
    lifecycle: Arc<Lifecycle>,
}

impl<R: Row> Clone for Collection<R> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), lifecycle: Arc::clone(&self.lifecycle) }
    }
}

impl<R: Row> Collection<R> {
    /// Create the collection and start its subscription on the current
    /// tokio runtime.
    ///
    /// With a resume position the stream continues from it; since the
    /// in-memory state of the prior session is gone, the collection is then
    /// always seeded from the snapshot endpoint.
    pub fn open(
        project_id: i64,
        adapter: Arc<dyn NetworkAdapter<R>>,
        transport: Arc<dyn ShapeTransport>,
        options: &CollectionOptions,
        resume: Option<ResumePosition>,
    ) -> Self {
        let store = Arc::new(CollectionStore::new(options.notification_capacity));
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&adapter),
            options.confirmation_timeout,
        );
        let (sync, _) = watch::channel(SyncState {
            status: CollectionStatus::Connecting,
            ready: false,
            position: resume.clone(),
        });
        let shared = Arc::new(Shared { project_id, store, reconciler, sync });

        let seed = options.seed_from_snapshot || resume.is_some();
        let subscription = match resume {
            Some(position) => ShapeSubscription::resume(transport, project_id, position),
            None => ShapeSubscription::new(transport, project_id),
        }
        .with_reconnect_policy(options.reconnect.clone());

        let span = info_span!("fieldsync.collection", table = R::TABLE, project_id);
        let driver = tokio::spawn(
            drive(Arc::clone(&shared), adapter, subscription, seed).instrument(span),
        );

        Self { shared, lifecycle: Arc::new(Lifecycle { driver: Mutex::new(Some(driver)) }) }
    }

    pub fn project_id(&self) -> i64 {
        self.shared.project_id
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<R> {
        self.shared.store.get(key)
    }

    pub fn list(&self) -> Vec<R> {
        self.shared.store.list()
    }

    pub fn len(&self) -> usize {
        self.shared.store.len()
    }

    pub fn store(&self) -> &Arc<CollectionStore<R>> {
        &self.shared.store
    }

    /// Row changes, confirmations, rollbacks and connection notices.
    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent<R>> {
        self.shared.store.subscribe()
    }

    pub fn status(&self) -> CollectionStatus {
        self.shared.sync.borrow().status.clone()
    }

    /// Last acknowledged stream position, for resuming in a later session.
    pub fn resume_position(&self) -> Option<ResumePosition> {
        self.shared.sync.borrow().position.clone()
    }

    pub fn pending(&self) -> Vec<PendingMutationInfo> {
        self.shared.reconciler.pending()
    }

    /// Resolves once authoritative state has been applied.
    pub async fn ready(&self) -> Result<(), CollectionError> {
        let mut sync = self.shared.sync.subscribe();
        let state = sync
            .wait_for(|state| {
                state.ready
                    || matches!(state.status, CollectionStatus::Failed(_) | CollectionStatus::Closed)
            })
            .await
            .map_err(|_| CollectionError::Closed)?;
        if state.ready && state.status != CollectionStatus::Closed {
            return Ok(());
        }
        match &state.status {
            CollectionStatus::Failed(message) => Err(CollectionError::Failed(message.clone())),
            _ => Err(CollectionError::Closed),
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Insert a row. An empty primary key is replaced by a fresh UUID.
    pub async fn insert(&self, row: R) -> Result<MutationOutcome, MutationError> {
        self.shared.reconciler.mutate(Mutation::Insert(row)).await
    }

    /// Patch the given columns of an existing row.
    pub async fn update(
        &self,
        key: &str,
        changes: Map<String, Value>,
    ) -> Result<MutationOutcome, MutationError> {
        self.shared
            .reconciler
            .mutate(Mutation::Update { key: key.to_string(), changes })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<MutationOutcome, MutationError> {
        self.shared.reconciler.mutate(Mutation::Delete { key: key.to_string() }).await
    }

    /// Apply a mutation locally without sending it yet.
    pub fn stage(&self, mutation: Mutation<R>) -> Result<Option<StagedMutation>, MutationError> {
        self.shared.reconciler.stage(mutation)
    }

    pub async fn submit(&self, staged: StagedMutation) -> Result<MutationOutcome, MutationError> {
        self.shared.reconciler.submit(staged).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Tear down the subscription and discard in-memory state. Waiting
    /// submitters resolve with `MutationError::Closed`.
    pub async fn close(&self) {
        if let Some(driver) = self.lifecycle.take() {
            driver.abort();
            let _ = driver.await;
        }
        self.shared.reconciler.close();
        self.shared.store.clear();
        self.shared.sync.send_modify(|state| state.status = CollectionStatus::Closed);
        info!(table = R::TABLE, project_id = self.shared.project_id, "collection closed");
    }
}

impl Collection<Entity> {
    /// Move an entity to a new lifecycle state.
    pub async fn set_status(
        &self,
        entity_id: &str,
        status: EntityStatus,
    ) -> Result<MutationOutcome, MutationError> {
        let mut changes = Map::new();
        changes.insert("status".to_string(), Value::String(status.as_str().to_string()));
        self.update(entity_id, changes).await
    }

    pub fn entities_for_task(&self, task_id: i64) -> Vec<Entity> {
        self.list().into_iter().filter(|entity| entity.task_id == task_id).collect()
    }
}

impl Collection<TaskEvent> {
    /// Events of one task, oldest first.
    pub fn history(&self, task_id: i64) -> Vec<TaskEvent> {
        let mut events: Vec<_> =
            self.list().into_iter().filter(|event| event.task_id == task_id).collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.event_id.cmp(&b.event_id)));
        events
    }
}

// ── Driver ──────────────────────────────────────────────────────────

async fn drive<R: Row>(
    shared: Arc<Shared<R>>,
    adapter: Arc<dyn NetworkAdapter<R>>,
    mut subscription: ShapeSubscription<R>,
    seed: bool,
) {
    if seed {
        match adapter.fetch_snapshot().await {
            Ok(rows) => {
                info!(rows = rows.len(), "seeded from project snapshot");
                shared.reconciler.seed(rows);
            }
            Err(error) => warn!(%error, "project snapshot unavailable, waiting for shape snapshot"),
        }
    }

    loop {
        match subscription.next_event().await {
            Ok(event) => {
                shared.apply(event);
                let position = subscription.resume_position();
                shared.sync.send_modify(|state| state.position = position);
            }
            Err(error) => {
                shared.fail(&error);
                return;
            }
        }
    }
}

impl<R: Row> Shared<R> {
    fn apply(&self, event: ShapeEvent<R>) {
        match event {
            ShapeEvent::Snapshot { rows, resync } => {
                self.reconciler.apply_snapshot(rows, resync);
                self.mark_live();
            }
            ShapeEvent::Changes(changes) => {
                self.reconciler.apply_remote(changes);
                self.mark_live();
            }
            ShapeEvent::UpToDate => self.mark_live(),
            ShapeEvent::Reconnecting { attempt, delay, reason } => {
                self.sync.send_modify(|state| {
                    state.status = CollectionStatus::Reconnecting { attempt };
                });
                self.store.notify(CollectionEvent::Reconnecting { attempt, delay, reason });
            }
        }
    }

    fn mark_live(&self) {
        self.sync.send_if_modified(|state| {
            let changed = !state.ready || state.status != CollectionStatus::Live;
            state.ready = true;
            state.status = CollectionStatus::Live;
            changed
        });
    }

    fn fail(&self, error: &ShapeError) {
        let message = error.to_string();
        self.sync.send_modify(|state| state.status = CollectionStatus::Failed(message.clone()));
        self.store.notify(CollectionEvent::SubscriptionFailed { message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use crate::shape::{ShapeBatch, ShapeRequest, ShapeResponse};
    use async_trait::async_trait;
    use fieldsync_common::protocol::mutation::Txid;
    use fieldsync_common::protocol::shape::{LogOffset, Operation, ShapeHandle, ShapeMessage};
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// Serves scripted batches, then long-polls until more are pushed.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<ShapeResponse, ShapeError>>>,
        pushed: Notify,
    }

    impl ScriptedTransport {
        fn push(&self, response: Result<ShapeResponse, ShapeError>) {
            self.responses.lock().unwrap().push_back(response);
            self.pushed.notify_one();
        }

        fn push_batch(&self, offset: LogOffset, messages: Vec<ShapeMessage>) {
            self.push(Ok(ShapeResponse::Batch(ShapeBatch {
                handle: ShapeHandle("h".into()),
                offset,
                messages,
            })));
        }
    }

    #[async_trait]
    impl ShapeTransport for ScriptedTransport {
        async fn fetch(&self, _request: &ShapeRequest) -> Result<ShapeResponse, ShapeError> {
            loop {
                if let Some(response) = self.responses.lock().unwrap().pop_front() {
                    return response;
                }
                self.pushed.notified().await;
            }
        }
    }

    struct StaticAdapter {
        txid: Txid,
        seed: Vec<Entity>,
    }

    #[async_trait]
    impl NetworkAdapter<Entity> for StaticAdapter {
        async fn submit(&self, _mutation: &Mutation<Entity>) -> Result<Txid, AdapterError> {
            Ok(self.txid)
        }

        async fn fetch_row(&self, _key: &str) -> Result<Option<Entity>, AdapterError> {
            Ok(None)
        }

        async fn fetch_snapshot(&self) -> Result<Vec<Entity>, AdapterError> {
            Ok(self.seed.clone())
        }
    }

    fn entity(id: &str, status: EntityStatus) -> Entity {
        Entity {
            entity_id: id.into(),
            status,
            project_id: 7,
            task_id: 3,
            osm_id: "1".into(),
            submission_ids: vec![],
            geometry: None,
            created_by: None,
        }
    }

    fn change(row: &Entity, operation: Operation, txids: Vec<Txid>) -> ShapeMessage {
        ShapeMessage::change(row.entity_id.clone(), operation, json!(row), txids)
    }

    fn open(
        transport: &Arc<ScriptedTransport>,
        adapter: StaticAdapter,
        options: CollectionOptions,
    ) -> Collection<Entity> {
        Collection::open(
            7,
            Arc::new(adapter),
            Arc::clone(transport) as Arc<dyn ShapeTransport>,
            &options,
            None,
        )
    }

    #[tokio::test]
    async fn shape_snapshot_replaces_seed_and_marks_ready() {
        let transport = Arc::new(ScriptedTransport::default());
        let adapter = StaticAdapter {
            txid: Txid(1),
            seed: vec![entity("stale", EntityStatus::Ready), entity("E1", EntityStatus::Ready)],
        };
        transport.push_batch(
            LogOffset::at(1, 0),
            vec![change(&entity("E1", EntityStatus::Validated), Operation::Insert, vec![]), ShapeMessage::up_to_date()],
        );

        let collection = open(&transport, adapter, CollectionOptions::default());
        collection.ready().await.unwrap();

        assert_eq!(collection.status(), CollectionStatus::Live);
        assert_eq!(collection.list(), vec![entity("E1", EntityStatus::Validated)]);
        assert_eq!(collection.resume_position().unwrap().offset, LogOffset::at(1, 0));
    }

    #[tokio::test]
    async fn set_status_confirms_through_the_stream() {
        let transport = Arc::new(ScriptedTransport::default());
        let adapter = StaticAdapter { txid: Txid(42), seed: vec![] };
        transport.push_batch(
            LogOffset::at(1, 0),
            vec![change(&entity("E2", EntityStatus::Ready), Operation::Insert, vec![]), ShapeMessage::up_to_date()],
        );
        let options = CollectionOptions { seed_from_snapshot: false, ..CollectionOptions::default() };
        let collection = open(&transport, adapter, options);
        collection.ready().await.unwrap();

        let writer = tokio::spawn({
            let collection = collection.clone();
            async move { collection.set_status("E2", EntityStatus::OpenedInOdk).await }
        });
        for _ in 0..1000 {
            if collection.pending().first().is_some_and(|info| info.txid.is_some()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(collection.get("E2").unwrap().status, EntityStatus::OpenedInOdk);

        transport.push_batch(
            LogOffset::at(2, 0),
            vec![change(&entity("E2", EntityStatus::OpenedInOdk), Operation::Update, vec![Txid(42)])],
        );

        let outcome = writer.await.unwrap().unwrap();
        assert_eq!(outcome, MutationOutcome::Confirmed { key: "E2".into(), txid: Txid(42) });
        assert!(collection.pending().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_fails_ready_and_notifies() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Err(ShapeError::from_status(401, "token expired")));
        let options = CollectionOptions { seed_from_snapshot: false, ..CollectionOptions::default() };
        let collection = open(&transport, StaticAdapter { txid: Txid(1), seed: vec![] }, options);
        let mut events = collection.subscribe();

        let error = collection.ready().await.unwrap_err();
        assert!(matches!(error, CollectionError::Failed(_)));
        assert!(matches!(collection.status(), CollectionStatus::Failed(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            CollectionEvent::SubscriptionFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_are_reported() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Err(ShapeError::Transient("reset".into())));
        let options = CollectionOptions { seed_from_snapshot: false, ..CollectionOptions::default() };
        let collection = open(&transport, StaticAdapter { txid: Txid(1), seed: vec![] }, options);
        let mut events = collection.subscribe();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, CollectionEvent::Reconnecting { attempt: 1, .. }));

        transport.push_batch(LogOffset::at(1, 0), vec![ShapeMessage::up_to_date()]);
        collection.ready().await.unwrap();
        assert_eq!(collection.status(), CollectionStatus::Live);
    }

    #[tokio::test]
    async fn close_discards_state_and_rejects_writes() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_batch(
            LogOffset::at(1, 0),
            vec![change(&entity("E1", EntityStatus::Ready), Operation::Insert, vec![]), ShapeMessage::up_to_date()],
        );
        let options = CollectionOptions { seed_from_snapshot: false, ..CollectionOptions::default() };
        let collection = open(&transport, StaticAdapter { txid: Txid(1), seed: vec![] }, options);
        collection.ready().await.unwrap();

        collection.close().await;

        assert_eq!(collection.status(), CollectionStatus::Closed);
        assert_eq!(collection.len(), 0);
        assert_eq!(collection.ready().await, Err(CollectionError::Closed));
        assert_eq!(
            collection.set_status("E1", EntityStatus::Validated).await,
            Err(MutationError::Closed)
        );
    }

    #[tokio::test]
    async fn task_history_is_chronological() {
        use chrono::{TimeZone, Utc};
        use fieldsync_common::types::{TaskEventKind, TaskStatus};

        let transport = Arc::new(ScriptedTransport::default());
        let collection: Collection<TaskEvent> = Collection::open(
            7,
            Arc::new(NoSeed),
            Arc::clone(&transport) as Arc<dyn ShapeTransport>,
            &CollectionOptions { seed_from_snapshot: false, ..CollectionOptions::default() },
            None,
        );
        let event = |id: &str, task_id: i64, minute: u32| TaskEvent {
            event_id: id.into(),
            event: TaskEventKind::Map,
            project_id: 7,
            task_id,
            comment: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            username: "mapper".into(),
            profile_img: None,
            status: TaskStatus::LockedForMapping,
        };
        collection.store().upsert(event("late", 1, 30));
        collection.store().upsert(event("early", 1, 5));
        collection.store().upsert(event("other", 2, 0));

        let ids: Vec<_> = collection.history(1).into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    struct NoSeed;

    #[async_trait]
    impl NetworkAdapter<TaskEvent> for NoSeed {
        async fn submit(&self, _mutation: &Mutation<TaskEvent>) -> Result<Txid, AdapterError> {
            Err(AdapterError::Transport("offline".into()))
        }

        async fn fetch_row(&self, _key: &str) -> Result<Option<TaskEvent>, AdapterError> {
            Ok(None)
        }

        async fn fetch_snapshot(&self) -> Result<Vec<TaskEvent>, AdapterError> {
            Ok(vec![])
        }
    }
}
