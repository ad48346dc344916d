// `fieldsync watch`: follow a project's collection until interrupted.

use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::types::{Entity, Row, TaskEvent};
use fieldsync_client::{ChangeKind, Collection, CollectionEvent};

use crate::output::{self, OutputFormat};

use super::open_project;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Table {
    Entities,
    TaskEvents,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[arg(long)]
    project: i64,
    #[arg(long, value_enum, default_value = "entities")]
    table: Table,
    /// Force JSON output (one object per line).
    #[arg(long)]
    json: bool,
}

/// One line of watch output.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchLine<R> {
    Row { kind: &'static str, key: String, row: R },
    Confirmed { key: String, txid: Txid },
    RolledBack { key: String, reason: String },
    Reconnecting { attempt: u32, delay_ms: u64, reason: String },
    Resynced { rows: usize },
}

impl<R: Row> WatchLine<R> {
    /// `None` for events that end the watch.
    fn from_event(event: CollectionEvent<R>) -> Option<Self> {
        Some(match event {
            CollectionEvent::Changed(change) => Self::Row {
                kind: change_kind(change.kind),
                key: change.key,
                row: change.row,
            },
            CollectionEvent::Confirmed { key, txid } => Self::Confirmed { key, txid },
            CollectionEvent::RolledBack { key, reason } => Self::RolledBack { key, reason },
            CollectionEvent::Reconnecting { attempt, delay, reason } => {
                Self::Reconnecting { attempt, delay_ms: millis(delay), reason }
            }
            CollectionEvent::Resynced { rows } => Self::Resynced { rows },
            CollectionEvent::SubscriptionFailed { .. } => return None,
        })
    }
}

pub async fn run(args: WatchArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let result = watch(&args, format).await;
    if let Err(error) = &result {
        output::print_anyhow_error(format, error);
    }
    result
}

async fn watch(args: &WatchArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (registry, collections) = open_project(args.project).await?;
    let outcome = match args.table {
        Table::Entities => follow(&collections.entities, format, describe_entity).await,
        Table::TaskEvents => follow(&collections.task_events, format, describe_task_event).await,
    };
    registry.close_all().await;
    outcome
}

/// Print the current rows, then every event until Ctrl-C or a terminal
/// subscription failure.
async fn follow<R: Row>(
    collection: &Collection<R>,
    format: OutputFormat,
    describe: fn(&R) -> String,
) -> anyhow::Result<()> {
    let mut events = collection.subscribe();

    for row in collection.list() {
        let line = WatchLine::Row { kind: "snapshot", key: row.key().to_string(), row };
        output::print_output(format, &line, |line| render(line, describe))?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            received = events.recv() => match received {
                Ok(CollectionEvent::SubscriptionFailed { message }) => {
                    anyhow::bail!("{} subscription stopped: {message}", R::TABLE);
                }
                Ok(event) => {
                    if let Some(line) = WatchLine::from_event(event) {
                        output::print_output(format, &line, |line| render(line, describe))?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    output::print_warning(
                        format,
                        "LAGGED",
                        &format!("output fell behind; {skipped} events were skipped"),
                    );
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn render<R>(line: &WatchLine<R>, describe: fn(&R) -> String) -> String {
    match line {
        WatchLine::Row { kind, key, row } => format!("{:<8} {key}  {}", kind, describe(row)),
        WatchLine::Confirmed { key, txid } => format!("confirmed {key} (txid {txid})"),
        WatchLine::RolledBack { key, reason } => format!("reverted {key}: {reason}"),
        WatchLine::Reconnecting { attempt, delay_ms, reason } => {
            format!("reconnecting (attempt {attempt}, in {delay_ms}ms): {reason}")
        }
        WatchLine::Resynced { rows } => format!("resynced {rows} rows"),
    }
}

fn change_kind(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Added => "added",
        ChangeKind::Updated => "updated",
        ChangeKind::Removed => "removed",
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn describe_entity(entity: &Entity) -> String {
    format!("{} task {}", entity.status, entity.task_id)
}

fn describe_task_event(event: &TaskEvent) -> String {
    format!("{} task {} by {} -> {}", event.event, event.task_id, event.username, event.status)
}
