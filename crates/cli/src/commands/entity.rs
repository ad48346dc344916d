// `fieldsync entity`: list entities and move them through their lifecycle.

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::Serialize;

use fieldsync_common::protocol::mutation::Txid;
use fieldsync_common::types::{Entity, EntityStatus};
use fieldsync_client::MutationOutcome;

use crate::output::{self, OutputFormat};

use super::open_project;

#[derive(Subcommand)]
pub enum EntityCommand {
    /// List a project's entities
    List(ListArgs),
    /// Set the lifecycle status of one entity
    SetStatus(SetStatusArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    project: i64,
    /// Only entities of this task.
    #[arg(long)]
    task: Option<i64>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SetStatusArgs {
    #[arg(long)]
    project: i64,
    #[arg(long)]
    entity: String,
    /// READY, OPENED_IN_ODK, SURVEY_SUBMITTED, VALIDATED or MARKED_BAD.
    #[arg(long)]
    status: EntityStatus,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusChange {
    pub entity_id: String,
    pub previous: Option<EntityStatus>,
    pub status: EntityStatus,
    pub txid: Txid,
}

pub async fn run(cmd: EntityCommand) -> anyhow::Result<()> {
    match cmd {
        EntityCommand::List(args) => list(args).await,
        EntityCommand::SetStatus(args) => set_status(args).await,
    }
}

async fn list(args: ListArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match fetch_entities(&args).await {
        Ok(entities) => {
            output::print_output(format, &entities, |entities| format_entities(entities))?;
            Ok(())
        }
        Err(error) => {
            output::print_anyhow_error(format, &error);
            Err(error)
        }
    }
}

async fn fetch_entities(args: &ListArgs) -> anyhow::Result<Vec<Entity>> {
    let (registry, collections) = open_project(args.project).await?;
    let entities = match args.task {
        Some(task_id) => collections.entities.entities_for_task(task_id),
        None => collections.entities.list(),
    };
    registry.close_all().await;
    Ok(entities)
}

async fn set_status(args: SetStatusArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match apply_status(&args).await {
        Ok(change) => {
            output::print_output(format, &change, format_status_change)?;
            Ok(())
        }
        Err(error) => {
            output::print_anyhow_error(format, &error);
            Err(error)
        }
    }
}

async fn apply_status(args: &SetStatusArgs) -> anyhow::Result<StatusChange> {
    let (registry, collections) = open_project(args.project).await?;
    let previous = collections.entities.get(&args.entity).map(|entity| entity.status);
    let outcome = collections.entities.set_status(&args.entity, args.status).await;
    registry.close_all().await;

    match outcome.with_context(|| format!("failed to set status of {}", args.entity))? {
        MutationOutcome::Confirmed { key, txid } => {
            Ok(StatusChange { entity_id: key, previous, status: args.status, txid })
        }
        MutationOutcome::Cancelled { key } => {
            anyhow::bail!("update of {key} was cancelled before submission")
        }
    }
}

fn format_entities(entities: &[Entity]) -> String {
    if entities.is_empty() {
        return "No entities.".to_string();
    }
    let width = entities.iter().map(|entity| entity.entity_id.len()).max().unwrap_or(0);
    entities
        .iter()
        .map(|entity| {
            format!(
                "{:<width$}  {:<16}  task {}  osm {}",
                entity.entity_id, entity.status.as_str(), entity.task_id, entity.osm_id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_status_change(change: &StatusChange) -> String {
    match change.previous {
        Some(previous) if previous != change.status => format!(
            "{}: {} -> {} (txid {})",
            change.entity_id, previous, change.status, change.txid
        ),
        _ => format!("{}: {} (txid {})", change.entity_id, change.status, change.txid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, status: EntityStatus, task_id: i64) -> Entity {
        Entity {
            entity_id: id.into(),
            status,
            project_id: 7,
            task_id,
            osm_id: "-101".into(),
            submission_ids: vec![],
            geometry: None,
            created_by: None,
        }
    }

    #[test]
    fn entities_are_aligned_one_per_line() {
        let text = format_entities(&[
            entity("E1", EntityStatus::Ready, 3),
            entity("E100", EntityStatus::SurveySubmitted, 4),
        ]);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("E1    READY"));
        assert!(lines[1].contains("SURVEY_SUBMITTED"));
        assert!(lines[1].contains("task 4"));
    }

    #[test]
    fn empty_listing() {
        assert_eq!(format_entities(&[]), "No entities.");
    }

    #[test]
    fn status_change_shows_transition() {
        let change = StatusChange {
            entity_id: "E1".into(),
            previous: Some(EntityStatus::Ready),
            status: EntityStatus::OpenedInOdk,
            txid: Txid(42),
        };
        assert_eq!(format_status_change(&change), "E1: READY -> OPENED_IN_ODK (txid 42)");

        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["status"], "OPENED_IN_ODK");
        assert_eq!(json["txid"], 42);
    }
}
