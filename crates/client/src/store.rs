// Collection Store: in-memory keyed table of materialized rows.
//
// All writes, optimistic or confirmed, go through `upsert`/`delete`/
// `apply_batch`. A batch is applied under a single write lock so readers
// never observe it half-applied. The store knows nothing about optimism;
// the reconciler decides what to write.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;

use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::types::Row;

pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Row-level change delivered to listeners.
///
/// For `Removed`, `row` is the value that was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification<R> {
    pub key: String,
    pub kind: ChangeKind,
    pub row: R,
}

/// Everything a listener of a collection is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent<R> {
    Changed(ChangeNotification<R>),
    /// A pending mutation was matched by the server.
    Confirmed { key: String, txid: Txid },
    /// A pending mutation was reverted; `reason` is user-presentable.
    RolledBack { key: String, reason: String },
    /// The subscription lost its connection and will retry after `delay`.
    Reconnecting { attempt: u32, delay: Duration, reason: String },
    /// Authoritative state was replaced by a fresh snapshot.
    Resynced { rows: usize },
    /// The subscription terminated permanently.
    SubscriptionFailed { message: String },
}

/// A single write applied to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite<R> {
    Upsert(R),
    Delete(String),
}

impl<R: Row> StoreWrite<R> {
    /// Write that restores `value` for `key` (deleting when absent).
    pub fn restore(key: &str, value: Option<R>) -> Self {
        match value {
            Some(row) => Self::Upsert(row),
            None => Self::Delete(key.to_string()),
        }
    }
}

struct StoreInner<R> {
    rows: BTreeMap<String, R>,
    version: u64,
}

/// Materialized rows of one table for one project.
pub struct CollectionStore<R: Row> {
    inner: RwLock<StoreInner<R>>,
    events: broadcast::Sender<CollectionEvent<R>>,
}

impl<R: Row> CollectionStore<R> {
    pub fn new(notification_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(notification_capacity.max(1));
        Self { inner: RwLock::new(StoreInner { rows: BTreeMap::new(), version: 0 }), events }
    }

    pub fn get(&self, key: &str) -> Option<R> {
        self.read(|inner| inner.rows.get(key).cloned())
    }

    /// All rows ordered by key, taken from one consistent version.
    pub fn list(&self) -> Vec<R> {
        self.read(|inner| inner.rows.values().cloned().collect())
    }

    pub fn keys(&self) -> Vec<String> {
        self.read(|inner| inner.rows.keys().cloned().collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read(|inner| inner.rows.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.read(|inner| inner.rows.len())
    }

    /// Monotonic counter bumped by every write batch that changed something.
    pub fn version(&self) -> u64 {
        self.read(|inner| inner.version)
    }

    pub fn upsert(&self, row: R) -> Option<ChangeNotification<R>> {
        self.apply_batch(vec![StoreWrite::Upsert(row)]).pop()
    }

    pub fn delete(&self, key: &str) -> Option<ChangeNotification<R>> {
        self.apply_batch(vec![StoreWrite::Delete(key.to_string())]).pop()
    }

    /// Apply writes atomically, then notify listeners of the effective changes.
    ///
    /// Upserting an identical row or deleting an absent key is a no-op and
    /// produces no notification.
    pub fn apply_batch(&self, writes: Vec<StoreWrite<R>>) -> Vec<ChangeNotification<R>> {
        if writes.is_empty() {
            return Vec::new();
        }

        let changes = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut changes = Vec::with_capacity(writes.len());
            for write in writes {
                match write {
                    StoreWrite::Upsert(row) => {
                        let key = row.key().to_string();
                        match inner.rows.insert(key.clone(), row.clone()) {
                            None => changes.push(ChangeNotification {
                                key,
                                kind: ChangeKind::Added,
                                row,
                            }),
                            Some(previous) if previous != row => {
                                changes.push(ChangeNotification {
                                    key,
                                    kind: ChangeKind::Updated,
                                    row,
                                })
                            }
                            Some(_) => {}
                        }
                    }
                    StoreWrite::Delete(key) => {
                        if let Some(previous) = inner.rows.remove(&key) {
                            changes.push(ChangeNotification {
                                key,
                                kind: ChangeKind::Removed,
                                row: previous,
                            });
                        }
                    }
                }
            }
            if !changes.is_empty() {
                inner.version += 1;
            }
            changes
        };

        for change in &changes {
            self.notify(CollectionEvent::Changed(change.clone()));
        }
        changes
    }

    /// Drop every row without notifying. Used when the collection is closed.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.rows.clear();
        inner.version += 1;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent<R>> {
        self.events.subscribe()
    }

    /// Deliver a non-row event (rollback, reconnect, ...) to listeners.
    pub fn notify(&self, event: CollectionEvent<R>) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }

    fn read<T>(&self, f: impl FnOnce(&StoreInner<R>) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }
}

impl<R: Row> Default for CollectionStore<R> {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}
