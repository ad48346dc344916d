// Shape subscription client: snapshot + ordered live diffs for one table
// scoped to one project.
//
// The subscription is a pull-driven state machine. Each `next_event` call
// performs at most one successful fetch worth of progress and returns one of:
// a full snapshot (initial or after the server rejected our resume position),
// a batch of changes, an up-to-date marker, or a reconnect notice.
//
// Transport is abstracted via `ShapeTransport` for testability. The HTTP
// long-poll implementation lives in `http`.

pub mod http;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::protocol::shape::{
    ChangeMessage, Control, LogOffset, Operation, ShapeHandle, ShapeMessage,
};
use fieldsync_common::types::Row;

use crate::error::ShapeError;

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: u32::MAX, // retry indefinitely
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

/// Where a subscription can pick up after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePosition {
    pub handle: ShapeHandle,
    pub offset: LogOffset,
}

// ── Transport trait ─────────────────────────────────────────────────

/// One request against the shape endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub table: &'static str,
    /// Server-side filter, e.g. `project_id=7`.
    pub where_clause: String,
    pub offset: LogOffset,
    pub handle: Option<ShapeHandle>,
    /// Long-poll for new changes instead of returning immediately.
    pub live: bool,
}

/// A page of the log returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeBatch {
    pub handle: ShapeHandle,
    /// Log offset reached after this batch.
    pub offset: LogOffset,
    pub messages: Vec<ShapeMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeResponse {
    Batch(ShapeBatch),
    /// The resume position was rejected; start over from a snapshot.
    MustRefetch,
}

/// Abstraction over the shape endpoint.
#[async_trait]
pub trait ShapeTransport: Send + Sync {
    async fn fetch(&self, request: &ShapeRequest) -> Result<ShapeResponse, ShapeError>;
}

// ── Events ──────────────────────────────────────────────────────────

/// Authoritative change to one row.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp<R> {
    Upsert(R),
    Delete,
}

impl<R> ChangeOp<R> {
    /// The row after the change; `None` for deletes.
    pub fn into_row(self) -> Option<R> {
        match self {
            Self::Upsert(row) => Some(row),
            Self::Delete => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange<R> {
    pub key: String,
    pub op: ChangeOp<R>,
    /// Transactions that produced this change, when it came from a mutation.
    pub txids: Vec<Txid>,
}

/// What the subscription yields to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeEvent<R> {
    /// Every row matching the filter. `resync` is set when this replaces
    /// state after the server rejected the resume position.
    Snapshot { rows: Vec<R>, resync: bool },
    /// One batch of live changes, to be applied atomically and in order.
    Changes(Vec<RemoteChange<R>>),
    /// Caught up with the log; nothing new to apply.
    UpToDate,
    /// A fetch failed; the next call waits `delay` before retrying.
    Reconnecting { attempt: u32, delay: Duration, reason: String },
}

// ── Subscription ────────────────────────────────────────────────────

/// Subscription phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// Paging through a snapshot; nothing is delivered until it completes.
    Snapshotting,
    Live,
    Failed,
}

struct SnapshotBuffer<R> {
    rows: BTreeMap<String, R>,
    resync: bool,
}

/// Client side of one shape: `table` filtered to one project.
pub struct ShapeSubscription<R: Row> {
    transport: Arc<dyn ShapeTransport>,
    policy: ReconnectPolicy,
    project_id: i64,
    handle: Option<ShapeHandle>,
    offset: LogOffset,
    snapshot: Option<SnapshotBuffer<R>>,
    failure: Option<ShapeError>,
    consecutive_failures: u32,
    pending_delay: Option<Duration>,
    dropped_records: u64,
    _row: PhantomData<fn() -> R>,
}

impl<R: Row> ShapeSubscription<R> {
    /// Start from a full snapshot.
    pub fn new(transport: Arc<dyn ShapeTransport>, project_id: i64) -> Self {
        Self {
            transport,
            policy: ReconnectPolicy::default(),
            project_id,
            handle: None,
            offset: LogOffset::BeforeStart,
            snapshot: Some(SnapshotBuffer { rows: BTreeMap::new(), resync: false }),
            failure: None,
            consecutive_failures: 0,
            pending_delay: None,
            dropped_records: 0,
            _row: PhantomData,
        }
    }

    /// Resume live streaming from a position acknowledged in a prior session.
    pub fn resume(
        transport: Arc<dyn ShapeTransport>,
        project_id: i64,
        position: ResumePosition,
    ) -> Self {
        let mut subscription = Self::new(transport, project_id);
        subscription.handle = Some(position.handle);
        subscription.offset = position.offset;
        subscription.snapshot = None;
        subscription
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn phase(&self) -> SubscriptionPhase {
        if self.failure.is_some() {
            SubscriptionPhase::Failed
        } else if self.snapshot.is_some() {
            SubscriptionPhase::Snapshotting
        } else {
            SubscriptionPhase::Live
        }
    }

    /// Last acknowledged position, available once live.
    pub fn resume_position(&self) -> Option<ResumePosition> {
        if self.phase() != SubscriptionPhase::Live {
            return None;
        }
        self.handle
            .clone()
            .map(|handle| ResumePosition { handle, offset: self.offset })
    }

    pub fn offset(&self) -> LogOffset {
        self.offset
    }

    /// Records that could not be decoded into a row and were skipped.
    pub fn dropped_records(&self) -> u64 {
        self.dropped_records
    }

    /// Wait for the next event. A permanent error terminates the
    /// subscription; every later call returns the same error.
    pub async fn next_event(&mut self) -> Result<ShapeEvent<R>, ShapeError> {
        loop {
            if let Some(error) = &self.failure {
                return Err(error.clone());
            }
            if let Some(delay) = self.pending_delay.take() {
                tokio::time::sleep(delay).await;
            }

            let request = self.request();
            let span = info_span!(
                "fieldsync.shape.fetch",
                table = R::TABLE,
                project_id = self.project_id,
                offset = %request.offset,
                live = request.live
            );
            let response = self.transport.fetch(&request).instrument(span).await;

            match response {
                Ok(ShapeResponse::MustRefetch) => {
                    self.consecutive_failures = 0;
                    self.restart_snapshot();
                }
                Ok(ShapeResponse::Batch(batch)) => {
                    self.consecutive_failures = 0;
                    if let Some(event) = self.apply_batch(batch) {
                        return Ok(event);
                    }
                }
                Err(error) if error.is_permanent() => {
                    warn!(table = R::TABLE, project_id = self.project_id, %error, "subscription terminated");
                    self.failure = Some(error.clone());
                    return Err(error);
                }
                Err(error) => {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    if self.consecutive_failures >= self.policy.max_attempts {
                        warn!(table = R::TABLE, %error, "giving up after {} attempts", self.consecutive_failures);
                        self.failure = Some(error.clone());
                        return Err(error);
                    }
                    let delay = self.policy.delay(self.consecutive_failures);
                    self.pending_delay = Some(delay);
                    warn!(
                        table = R::TABLE,
                        project_id = self.project_id,
                        attempt = self.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "shape fetch failed, reconnecting"
                    );
                    return Ok(ShapeEvent::Reconnecting {
                        attempt: self.consecutive_failures,
                        delay,
                        reason: error.to_string(),
                    });
                }
            }
        }
    }

    fn request(&self) -> ShapeRequest {
        ShapeRequest {
            table: R::TABLE,
            where_clause: format!("project_id={}", self.project_id),
            offset: self.offset,
            handle: self.handle.clone(),
            live: self.snapshot.is_none(),
        }
    }

    fn restart_snapshot(&mut self) {
        info!(table = R::TABLE, project_id = self.project_id, "resume position rejected, resnapshotting");
        self.handle = None;
        self.offset = LogOffset::BeforeStart;
        self.snapshot = Some(SnapshotBuffer { rows: BTreeMap::new(), resync: true });
    }

    /// Fold one batch into the subscription. Returns the event to deliver,
    /// if any.
    fn apply_batch(&mut self, batch: ShapeBatch) -> Option<ShapeEvent<R>> {
        let ShapeBatch { handle, offset, messages } = batch;

        if self.snapshot.is_none() && self.handle.as_ref().is_some_and(|current| *current != handle) {
            warn!(table = R::TABLE, old = ?self.handle, new = %handle, "shape handle changed");
            self.restart_snapshot();
            return None;
        }

        // Changes at or below the acknowledged offset were already applied.
        let duplicate = self.offset != LogOffset::BeforeStart && offset <= self.offset;
        if duplicate {
            debug!(table = R::TABLE, offset = %offset, acked = %self.offset, "skipping replayed batch");
        }

        let mut changes = Vec::new();
        let mut up_to_date = false;
        for message in messages {
            match message {
                ShapeMessage::Control(control) => match control.headers.control {
                    Control::UpToDate => up_to_date = true,
                    Control::MustRefetch => {
                        self.restart_snapshot();
                        return None;
                    }
                },
                ShapeMessage::Change(change) if !duplicate => {
                    if let Some(change) = self.decode(change) {
                        changes.push(change);
                    }
                }
                ShapeMessage::Change(_) => {}
            }
        }

        self.handle = Some(handle);
        self.offset = self.offset.max(offset);

        let Some(snapshot) = self.snapshot.as_mut() else {
            if !changes.is_empty() {
                return Some(ShapeEvent::Changes(changes));
            }
            return up_to_date.then_some(ShapeEvent::UpToDate);
        };

        for change in changes {
            match change.op {
                ChangeOp::Upsert(row) => {
                    snapshot.rows.insert(change.key, row);
                }
                ChangeOp::Delete => {
                    snapshot.rows.remove(&change.key);
                }
            }
        }
        if !up_to_date {
            return None;
        }

        let snapshot = self.snapshot.take()?;
        let rows: Vec<R> = snapshot.rows.into_values().collect();
        info!(
            table = R::TABLE,
            project_id = self.project_id,
            rows = rows.len(),
            offset = %self.offset,
            "snapshot complete"
        );
        Some(ShapeEvent::Snapshot { rows, resync: snapshot.resync })
    }

    fn decode(&mut self, change: ChangeMessage) -> Option<RemoteChange<R>> {
        let ChangeMessage { key, value, headers } = change;
        let op = match headers.operation {
            Operation::Delete => ChangeOp::Delete,
            Operation::Insert | Operation::Update => match serde_json::from_value::<R>(value) {
                Ok(row) if row.key() == key => ChangeOp::Upsert(row),
                Ok(row) => {
                    warn!(table = R::TABLE, key = %key, row_key = %row.key(), "dropping record with mismatched key");
                    self.dropped_records += 1;
                    return None;
                }
                Err(error) => {
                    warn!(table = R::TABLE, key = %key, %error, "dropping malformed record");
                    self.dropped_records += 1;
                    return None;
                }
            },
        };
        Some(RemoteChange { key, op, txids: headers.txids })
    }
}
