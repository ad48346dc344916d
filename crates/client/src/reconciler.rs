// Optimistic mutation queue and reconciler.
//
// Pending mutations flow through a state machine:
//   applied → awaiting_confirmation → confirmed      (happy path)
//   applied → rolled_back                            (adapter failure)
//   awaiting_confirmation → confirmed | rolled_back  (timeout + point read)
//
// At most one pending mutation exists per key. Each pending record keeps the
// latest authoritative value for its key (`base`); that is what the store
// converges to when the record retires, whether confirmed or rolled back.
//
// Lock order is reconciler state, then store. The state lock is never held
// across an await.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::types::Row;

use crate::adapter::{Mutation, MutationKind, NetworkAdapter};
use crate::error::MutationError;
use crate::shape::RemoteChange;
use crate::store::{CollectionEvent, CollectionStore, StoreWrite};

pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);
const OBSERVED_TXID_CAPACITY: usize = 4096;

// ── Types ───────────────────────────────────────────────────────────

/// Pending mutation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Optimistic value is live; request not yet answered.
    Applied,
    /// Server assigned a txid; waiting for it on the stream.
    AwaitingConfirmation,
    Confirmed,
    RolledBack,
}

impl MutationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
        }
    }
}

pub type MutationId = u64;

/// Terminal result of a successful `submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Confirmed { key: String, txid: Txid },
    /// A staged insert was cancelled by a delete before it was submitted.
    /// Nothing was sent to the server.
    Cancelled { key: String },
}

/// A mutation that has been applied locally but not yet submitted.
#[derive(Debug)]
pub struct StagedMutation {
    pub id: MutationId,
    pub key: String,
    pub kind: MutationKind,
    confirmation: oneshot::Receiver<Txid>,
}

/// Read-only view of a pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutationInfo {
    pub id: MutationId,
    pub key: String,
    pub kind: MutationKind,
    pub state: MutationState,
    pub submitted: bool,
    pub txid: Option<Txid>,
}

struct PendingMutation<R> {
    id: MutationId,
    mutation: Mutation<R>,
    state: MutationState,
    submitted: bool,
    /// Latest authoritative value for the key (rollback target).
    base: Option<R>,
    txid: Option<Txid>,
    resolve: Option<oneshot::Sender<Txid>>,
}

impl<R: Row> PendingMutation<R> {
    fn info(&self, key: &str) -> PendingMutationInfo {
        PendingMutationInfo {
            id: self.id,
            key: key.to_string(),
            kind: self.mutation.kind(),
            state: self.state,
            submitted: self.submitted,
            txid: self.txid,
        }
    }

    /// Retire as confirmed: wake the submitter and return the write that
    /// makes the store match the authoritative value.
    fn confirm(mut self, key: &str, txid: Txid) -> StoreWrite<R> {
        self.state = MutationState::Confirmed;
        if let Some(resolve) = self.resolve.take() {
            let _ = resolve.send(txid);
        }
        StoreWrite::restore(key, self.base)
    }
}

/// Txids seen on the stream for keys whose pending mutation had no txid yet.
///
/// Lets a confirmation that overtakes the HTTP response still match.
struct ObservedTxids {
    order: VecDeque<(String, Txid)>,
    seen: HashSet<(String, Txid)>,
    capacity: usize,
}

impl ObservedTxids {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), seen: HashSet::new(), capacity }
    }

    fn record(&mut self, key: &str, txid: Txid) {
        let entry = (key.to_string(), txid);
        if !self.seen.insert(entry.clone()) {
            return;
        }
        self.order.push_back(entry);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }

    fn contains(&self, key: &str, txid: Txid) -> bool {
        self.seen.contains(&(key.to_string(), txid))
    }
}

struct QueueState<R> {
    pending: HashMap<String, PendingMutation<R>>,
    observed: ObservedTxids,
    next_id: MutationId,
    closed: bool,
}

impl<R> QueueState<R> {
    fn take(&mut self, key: &str, id: MutationId) -> Option<PendingMutation<R>> {
        if self.pending.get(key).is_some_and(|pending| pending.id == id) {
            self.pending.remove(key)
        } else {
            None
        }
    }
}

// ── Reconciler ──────────────────────────────────────────────────────

/// Applies local writes optimistically and reconciles them against the
/// authoritative change stream.
pub struct Reconciler<R: Row> {
    store: Arc<CollectionStore<R>>,
    adapter: Arc<dyn NetworkAdapter<R>>,
    confirmation_timeout: Duration,
    state: Mutex<QueueState<R>>,
}

impl<R: Row> Reconciler<R> {
    pub fn new(
        store: Arc<CollectionStore<R>>,
        adapter: Arc<dyn NetworkAdapter<R>>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            adapter,
            confirmation_timeout,
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                observed: ObservedTxids::new(OBSERVED_TXID_CAPACITY),
                next_id: 1,
                closed: false,
            }),
        }
    }

    pub fn store(&self) -> &Arc<CollectionStore<R>> {
        &self.store
    }

    /// Stage and submit in one step.
    pub async fn mutate(&self, mutation: Mutation<R>) -> Result<MutationOutcome, MutationError> {
        let key = mutation.key().to_string();
        match self.stage(mutation)? {
            Some(staged) => self.submit(staged).await,
            None => Ok(MutationOutcome::Cancelled { key }),
        }
    }

    /// Reserve the key, record its rollback value and apply the optimistic
    /// write to the store.
    ///
    /// Returns `None` when the mutation is a delete that cancelled a staged,
    /// not yet submitted insert of the same key: the row is removed locally
    /// and nothing needs to be sent.
    pub fn stage(&self, mutation: Mutation<R>) -> Result<Option<StagedMutation>, MutationError> {
        let kind = mutation.kind();
        if !R::MUTABLE && kind != MutationKind::Insert {
            return Err(MutationError::Unsupported { table: R::TABLE, operation: kind });
        }

        let mut mutation = mutation;
        if let Mutation::Insert(row) = &mut mutation {
            if row.key().is_empty() {
                row.set_key(Uuid::new_v4().to_string());
            }
        }
        let key = mutation.key().to_string();

        let mut state = self.lock();
        if state.closed {
            return Err(MutationError::Closed);
        }

        if let Some(existing) = state.pending.get(&key) {
            let cancels_staged_insert = kind == MutationKind::Delete
                && existing.mutation.kind() == MutationKind::Insert
                && !existing.submitted;
            if !cancels_staged_insert {
                return Err(MutationError::InFlight { key });
            }
            if let Some(cancelled) = state.pending.remove(&key) {
                self.store.apply_batch(vec![StoreWrite::restore(&key, cancelled.base)]);
            }
            info!(table = R::TABLE, key = %key, "delete cancelled staged insert");
            return Ok(None);
        }

        let current = self.store.get(&key);
        let optimistic = match &mutation {
            Mutation::Insert(row) => {
                if current.is_some() {
                    return Err(MutationError::AlreadyExists { key });
                }
                StoreWrite::Upsert(row.clone())
            }
            Mutation::Update { changes, .. } => {
                let Some(current) = current.as_ref() else {
                    return Err(MutationError::NotFound { key });
                };
                StoreWrite::Upsert(apply_changes(current, changes)?)
            }
            Mutation::Delete { .. } => {
                if current.is_none() {
                    return Err(MutationError::NotFound { key });
                }
                StoreWrite::Delete(key.clone())
            }
        };

        let id = state.next_id;
        state.next_id += 1;
        let (resolve, confirmation) = oneshot::channel();
        state.pending.insert(
            key.clone(),
            PendingMutation {
                id,
                mutation,
                state: MutationState::Applied,
                submitted: false,
                base: current,
                txid: None,
                resolve: Some(resolve),
            },
        );
        self.store.apply_batch(vec![optimistic]);
        debug!(table = R::TABLE, key = %key, kind = %kind, id, "mutation staged");

        Ok(Some(StagedMutation { id, key, kind, confirmation }))
    }

    /// Send a staged mutation and wait until it is confirmed or rolled back.
    pub async fn submit(&self, staged: StagedMutation) -> Result<MutationOutcome, MutationError> {
        let StagedMutation { id, key, kind, mut confirmation } = staged;

        let mutation = {
            let mut state = self.lock();
            let closed = state.closed;
            match state.pending.get_mut(&key) {
                Some(pending) if pending.id == id => {
                    pending.submitted = true;
                    pending.mutation.clone()
                }
                _ if closed => return Err(MutationError::Closed),
                _ => return Ok(MutationOutcome::Cancelled { key }),
            }
        };

        let span = info_span!("fieldsync.reconciler.submit", table = R::TABLE, key = %key, kind = %kind, id);
        async {
            let txid = match self.adapter.submit(&mutation).await {
                Ok(txid) => txid,
                Err(error) => {
                    warn!(%error, "mutation failed, rolling back");
                    let error = MutationError::from(error);
                    self.roll_back(&key, id, &error);
                    return Err(error);
                }
            };

            if self.await_txid(&key, id, txid)? {
                return Ok(MutationOutcome::Confirmed { key: key.clone(), txid });
            }

            match tokio::time::timeout(self.confirmation_timeout, &mut confirmation).await {
                Ok(Ok(txid)) => Ok(MutationOutcome::Confirmed { key: key.clone(), txid }),
                Ok(Err(_)) => Err(MutationError::Closed),
                Err(_) => self.reconcile(&key, id, txid, &mutation, confirmation).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Record the server txid. Returns true if the stream already delivered it.
    fn await_txid(&self, key: &str, id: MutationId, txid: Txid) -> Result<bool, MutationError> {
        let mut state = self.lock();
        let already_observed = state.observed.contains(key, txid);
        let Some(pending) = state.pending.get_mut(key).filter(|pending| pending.id == id) else {
            return Err(MutationError::Closed);
        };
        pending.txid = Some(txid);
        pending.state = MutationState::AwaitingConfirmation;
        debug!(txid = %txid, "awaiting confirmation");

        if !already_observed {
            return Ok(false);
        }
        if let Some(pending) = state.take(key, id) {
            let write = pending.confirm(key, txid);
            self.store.apply_batch(vec![write]);
            self.store.notify(CollectionEvent::Confirmed { key: key.to_string(), txid });
        }
        debug!(txid = %txid, "confirmation had already arrived on the stream");
        Ok(true)
    }

    /// Confirmation timed out: consult the server's canonical row.
    async fn reconcile(
        &self,
        key: &str,
        id: MutationId,
        txid: Txid,
        mutation: &Mutation<R>,
        mut confirmation: oneshot::Receiver<Txid>,
    ) -> Result<MutationOutcome, MutationError> {
        info!(txid = %txid, "confirmation timed out, reading canonical row");
        let canonical = self.adapter.fetch_row(key).await;

        let mut state = self.lock();
        // Confirmations are sent under the state lock, so this cannot miss one.
        if let Ok(txid) = confirmation.try_recv() {
            return Ok(MutationOutcome::Confirmed { key: key.to_string(), txid });
        }
        let Some(mut pending) = state.take(key, id) else {
            return Err(MutationError::Closed);
        };

        match canonical {
            Ok(server) if mutation.is_reflected_by(server.as_ref()) => {
                info!(txid = %txid, "server reflects mutation, synthesizing confirmation");
                pending.base = server;
                let write = pending.confirm(key, txid);
                self.store.apply_batch(vec![write]);
                self.store.notify(CollectionEvent::Confirmed { key: key.to_string(), txid });
                Ok(MutationOutcome::Confirmed { key: key.to_string(), txid })
            }
            result => {
                // A row read from the server is newer than the recorded base.
                let revert_to = match result {
                    Ok(server) => server,
                    Err(error) => {
                        warn!(%error, "reconciliation read failed");
                        pending.base.take()
                    }
                };
                let error = MutationError::Lost { key: key.to_string(), txid };
                pending.state = MutationState::RolledBack;
                self.store.apply_batch(vec![StoreWrite::restore(key, revert_to)]);
                self.store.notify(CollectionEvent::RolledBack {
                    key: key.to_string(),
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    fn roll_back(&self, key: &str, id: MutationId, error: &MutationError) {
        let mut state = self.lock();
        let Some(mut pending) = state.take(key, id) else {
            return;
        };
        pending.state = MutationState::RolledBack;
        self.store.apply_batch(vec![StoreWrite::restore(key, pending.base)]);
        self.store.notify(CollectionEvent::RolledBack {
            key: key.to_string(),
            reason: error.to_string(),
        });
    }

    // ── Stream side ─────────────────────────────────────────────────

    /// Apply one batch of authoritative changes, in stream order.
    ///
    /// A change carrying the txid of the pending mutation for its key retires
    /// that mutation. Other changes to a pending key only move its rollback
    /// value; the optimistic value stays visible until the mutation resolves.
    pub fn apply_remote(&self, changes: Vec<RemoteChange<R>>) {
        let mut state = self.lock();
        let mut writes = Vec::with_capacity(changes.len());
        let mut confirmed = Vec::new();

        for change in changes {
            let RemoteChange { key, op, txids } = change;
            let Some(pending) = state.pending.get_mut(&key) else {
                writes.push(StoreWrite::restore(&key, op.into_row()));
                continue;
            };

            pending.base = op.into_row();
            let matched = pending.txid.filter(|txid| txids.contains(txid));
            match matched {
                Some(txid) => {
                    if let Some(pending) = state.pending.remove(&key) {
                        writes.push(pending.confirm(&key, txid));
                        confirmed.push((key, txid));
                    }
                }
                None => {
                    for txid in txids {
                        state.observed.record(&key, txid);
                    }
                }
            }
        }

        self.store.apply_batch(writes);
        for (key, txid) in confirmed {
            debug!(table = R::TABLE, key = %key, txid = %txid, "mutation confirmed");
            self.store.notify(CollectionEvent::Confirmed { key, txid });
        }
    }

    /// Replace authoritative state with a full snapshot.
    ///
    /// Rows without a pending mutation are replaced outright. Pending
    /// mutations are kept, their rollback value is taken from the snapshot,
    /// and those already answered by the server are confirmed if the
    /// snapshot reflects them.
    pub fn apply_snapshot(&self, rows: Vec<R>, resync: bool) {
        let mut state = self.lock();
        let incoming: BTreeMap<String, R> =
            rows.into_iter().map(|row| (row.key().to_string(), row)).collect();
        let row_count = incoming.len();
        let mut writes = Vec::new();
        let mut confirmed = Vec::new();

        for key in self.store.keys() {
            if !incoming.contains_key(&key) && !state.pending.contains_key(&key) {
                writes.push(StoreWrite::Delete(key));
            }
        }

        let pending_keys: Vec<String> = state.pending.keys().cloned().collect();
        for key in pending_keys {
            let Some(pending) = state.pending.get_mut(&key) else {
                continue;
            };
            pending.base = incoming.get(&key).cloned();
            let reflected = pending.state == MutationState::AwaitingConfirmation
                && pending.mutation.is_reflected_by(pending.base.as_ref());
            if !reflected {
                continue;
            }
            if let Some(pending) = state.pending.remove(&key) {
                if let Some(txid) = pending.txid {
                    writes.push(pending.confirm(&key, txid));
                    confirmed.push((key, txid));
                }
            }
        }

        for (key, row) in incoming {
            if !state.pending.contains_key(&key) {
                writes.push(StoreWrite::Upsert(row));
            }
        }

        self.store.apply_batch(writes);
        if resync {
            info!(table = R::TABLE, rows = row_count, "collection resynced from snapshot");
            self.store.notify(CollectionEvent::Resynced { rows: row_count });
        }
        for (key, txid) in confirmed {
            self.store.notify(CollectionEvent::Confirmed { key, txid });
        }
    }

    /// Provisional rows from the snapshot endpoint, applied before the shape
    /// snapshot arrives. Never touches pending keys.
    pub fn seed(&self, rows: Vec<R>) {
        let state = self.lock();
        let writes = rows
            .into_iter()
            .filter(|row| !state.pending.contains_key(row.key()))
            .map(StoreWrite::Upsert)
            .collect();
        self.store.apply_batch(writes);
    }

    // ── Introspection / lifecycle ───────────────────────────────────

    pub fn pending(&self) -> Vec<PendingMutationInfo> {
        let state = self.lock();
        let mut pending: Vec<_> =
            state.pending.iter().map(|(key, pending)| pending.info(key)).collect();
        pending.sort_by_key(|info| info.id);
        pending
    }

    pub fn pending_for(&self, key: &str) -> Option<PendingMutationInfo> {
        self.lock().pending.get(key).map(|pending| pending.info(key))
    }

    /// Stop accepting mutations and wake every waiting submitter with
    /// `MutationError::Closed`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.pending.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Merge a change set into a row. Only existing columns may be changed and
/// the primary key is immutable.
fn apply_changes<R: Row>(row: &R, changes: &Map<String, Value>) -> Result<R, MutationError> {
    if changes.is_empty() {
        return Err(MutationError::InvalidPatch("empty change set".to_string()));
    }
    if let Some(new_key) = changes.get(R::KEY_FIELD) {
        if new_key.as_str() != Some(row.key()) {
            return Err(MutationError::InvalidPatch(format!(
                "{} cannot be changed",
                R::KEY_FIELD
            )));
        }
    }

    let mut value =
        serde_json::to_value(row).map_err(|error| MutationError::InvalidPatch(error.to_string()))?;
    let Value::Object(columns) = &mut value else {
        return Err(MutationError::InvalidPatch("row is not an object".to_string()));
    };
    for (column, new_value) in changes {
        if !columns.contains_key(column) {
            return Err(MutationError::InvalidPatch(format!("unknown column {column}")));
        }
        columns.insert(column.clone(), new_value.clone());
    }
    serde_json::from_value(value).map_err(|error| MutationError::InvalidPatch(error.to_string()))
}
