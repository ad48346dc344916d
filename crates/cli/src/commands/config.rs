// `fieldsync config`: show the effective client configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::Serialize;

use fieldsync_client::config::{self, auth_token_from_env, ClientConfig, SyncConfig, TOKEN_ENV};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show(ShowArgs),
    /// Print the config file location
    Path(PathArgs),
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Read this file instead of `~/.fieldsync/config.toml`.
    #[arg(long)]
    file: Option<PathBuf>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct PathArgs {
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub source: Option<PathBuf>,
    pub api_url: String,
    pub api_url_valid: bool,
    /// Whether a token is set; the token itself is never printed.
    pub token_set: bool,
    pub sync: SyncConfig,
}

pub fn run(cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show(args) => show(args),
        ConfigCommand::Path(args) => path(args),
    }
}

fn show(args: ShowArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let report = match args.file.as_deref() {
        Some(file) => load_report(file),
        None => Ok(default_report()),
    };
    match report {
        Ok(report) => {
            if !report.api_url_valid {
                output::print_warning(
                    format,
                    "CONFIG_INVALID",
                    &format!("api_url `{}` must use https unless it is a loopback host", report.api_url),
                );
            }
            output::print_output(format, &report, format_report)?;
            Ok(())
        }
        Err(error) => {
            output::print_anyhow_error(format, &error);
            Err(error)
        }
    }
}

fn path(args: PathArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let path = config::config_path().context("could not determine home directory")?;
    output::print_output(format, &serde_json::json!({ "path": path }), |_| path.display().to_string())?;
    Ok(())
}

/// Report for the default location; a missing or unreadable file yields
/// the defaults.
fn default_report() -> ConfigReport {
    let source = config::config_path().filter(|path| path.exists());
    report(ClientConfig::load(), source, auth_token_from_env().is_some())
}

fn load_report(file: &Path) -> anyhow::Result<ConfigReport> {
    let loaded = ClientConfig::load_from(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    Ok(report(loaded, Some(file.to_path_buf()), auth_token_from_env().is_some()))
}

fn report(config: ClientConfig, source: Option<PathBuf>, token_set: bool) -> ConfigReport {
    ConfigReport {
        source,
        api_url_valid: config.api_url().is_ok(),
        api_url: config.api_url,
        token_set,
        sync: config.sync,
    }
}

fn format_report(report: &ConfigReport) -> String {
    let sync = &report.sync;
    let source = report
        .source
        .as_ref()
        .map_or_else(|| "defaults".to_string(), |path| path.display().to_string());
    let attempts = sync
        .reconnect_max_attempts
        .map_or_else(|| "unlimited".to_string(), |attempts| attempts.to_string());
    let token = if report.token_set { "set" } else { "not set" };
    [
        format!("source:                {source}"),
        format!("api_url:               {}", report.api_url),
        format!("{TOKEN_ENV}:       {token}"),
        format!("confirmation timeout:  {}ms", sync.confirmation_timeout_ms),
        format!(
            "reconnect backoff:     {}ms .. {}ms, {attempts} attempts",
            sync.reconnect_base_delay_ms, sync.reconnect_max_delay_ms
        ),
        format!("request timeout:       {}ms", sync.request_timeout_ms),
        format!("seed from snapshot:    {}", sync.seed_from_snapshot),
        format!("notification capacity: {}", sync.notification_capacity),
    ]
    .join("\n")
}
