// CLI subcommand dispatch.

use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use tracing::debug;

use fieldsync_client::backend::{Backend, HttpBackend};
use fieldsync_client::config::ClientConfig;
use fieldsync_client::{CollectionRegistry, ProjectCollections};

pub mod config;
pub mod entity;
pub mod event;
pub mod watch;

#[derive(Subcommand)]
pub enum Command {
    /// Stream a project's changes as they arrive
    Watch(watch::WatchArgs),
    /// Read and update map entities
    #[command(subcommand)]
    Entity(entity::EntityCommand),
    /// Record task activity
    #[command(subcommand)]
    Event(event::EventCommand),
    /// Inspect client configuration
    #[command(subcommand)]
    Config(config::ConfigCommand),
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Watch(args) => watch::run(args).await,
        Command::Entity(cmd) => entity::run(cmd).await,
        Command::Event(cmd) => event::run(cmd).await,
        Command::Config(cmd) => config::run(cmd),
    }
}

/// Open a project's collections against the configured API and wait for
/// their initial snapshot.
pub(crate) async fn open_project(
    project_id: i64,
) -> anyhow::Result<(CollectionRegistry, ProjectCollections)> {
    let config = ClientConfig::load();
    let backend = HttpBackend::from_config(&config).context("failed to configure API access")?;
    debug!(project_id, api_url = %backend.api_url(), "opening project");
    let registry =
        CollectionRegistry::new(Arc::new(backend) as Arc<dyn Backend>, config.collection_options());
    let collections = registry.open(project_id);
    collections
        .ready()
        .await
        .with_context(|| format!("project {project_id} did not finish syncing"))?;
    Ok((registry, collections))
}
