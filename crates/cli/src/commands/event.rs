// `fieldsync event`: record and review task activity.

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;

use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::types::{Row, TaskEvent, TaskEventKind, TaskStatus};
use fieldsync_client::MutationOutcome;

use crate::output::{self, OutputFormat};

use super::open_project;

#[derive(Subcommand)]
pub enum EventCommand {
    /// Record an event against a task
    Add(AddArgs),
    /// Show a task's events, oldest first
    History(HistoryArgs),
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    project: i64,
    #[arg(long)]
    task: i64,
    /// MAP, FINISH, VALIDATE, GOOD, BAD, COMMENT, ...
    #[arg(long)]
    event: TaskEventKind,
    #[arg(long)]
    username: String,
    #[arg(long)]
    comment: Option<String>,
    /// Resulting task status. Derived from the event and the task's
    /// history when omitted.
    #[arg(long)]
    status: Option<TaskStatus>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    project: i64,
    #[arg(long)]
    task: i64,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
pub struct RecordedEvent {
    #[serde(flatten)]
    pub event: TaskEvent,
    pub txid: Txid,
}

pub async fn run(cmd: EventCommand) -> anyhow::Result<()> {
    match cmd {
        EventCommand::Add(args) => add(args).await,
        EventCommand::History(args) => history(args).await,
    }
}

async fn add(args: AddArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match record_event(args).await {
        Ok(recorded) => {
            output::print_output(format, &recorded, format_recorded)?;
            Ok(())
        }
        Err(error) => {
            output::print_anyhow_error(format, &error);
            Err(error)
        }
    }
}

async fn record_event(args: AddArgs) -> anyhow::Result<RecordedEvent> {
    let (registry, collections) = open_project(args.project).await?;
    let current = current_status(&collections.task_events.history(args.task));
    let event = TaskEvent {
        event_id: String::new(),
        event: args.event,
        project_id: args.project,
        task_id: args.task,
        comment: args.comment,
        created_at: Utc::now(),
        username: args.username,
        profile_img: None,
        status: args.status.unwrap_or_else(|| args.event.resulting_status(current)),
    };

    let outcome = collections.task_events.insert(event.clone()).await;
    let result = match outcome.with_context(|| format!("failed to record {} on task {}", args.event, args.task)) {
        Ok(MutationOutcome::Confirmed { key, txid }) => {
            let stored = collections.task_events.get(&key).unwrap_or_else(|| {
                let mut event = event;
                event.set_key(key);
                event
            });
            Ok(RecordedEvent { event: stored, txid })
        }
        Ok(MutationOutcome::Cancelled { key }) => {
            Err(anyhow::anyhow!("event {key} was cancelled before submission"))
        }
        Err(error) => Err(error),
    };
    registry.close_all().await;
    result
}

async fn history(args: HistoryArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match fetch_history(&args).await {
        Ok(events) => {
            output::print_output(format, &events, |events| format_history(events))?;
            Ok(())
        }
        Err(error) => {
            output::print_anyhow_error(format, &error);
            Err(error)
        }
    }
}

async fn fetch_history(args: &HistoryArgs) -> anyhow::Result<Vec<TaskEvent>> {
    let (registry, collections) = open_project(args.project).await?;
    let events = collections.task_events.history(args.task);
    registry.close_all().await;
    Ok(events)
}

/// Status a task is in after its recorded history.
fn current_status(history: &[TaskEvent]) -> TaskStatus {
    history.last().map_or(TaskStatus::UnlockedToMap, |event| event.status)
}

fn format_event(event: &TaskEvent) -> String {
    let mut line = format!(
        "{}  {:<9} {:<22} {}",
        event.created_at.format("%Y-%m-%d %H:%M"),
        event.event.as_str(),
        event.status.as_str(),
        event.username
    );
    if let Some(comment) = event.comment.as_deref().filter(|comment| !comment.is_empty()) {
        line.push_str(&format!("  \"{comment}\""));
    }
    line
}

fn format_history(events: &[TaskEvent]) -> String {
    if events.is_empty() {
        return "No events.".to_string();
    }
    events.iter().map(format_event).collect::<Vec<_>>().join("\n")
}

fn format_recorded(recorded: &RecordedEvent) -> String {
    format!("{} (txid {})", format_event(&recorded.event), recorded.txid)
}
