// Rendering of command results and diagnostics.
//
// Rows and events go to stdout, errors and warnings to stderr. A terminal
// gets aligned text; anything else (or `--json`) gets one JSON object per
// line so `fieldsync watch` output can be piped into other tools.

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

use fieldsync_client::config::{ConfigError, TOKEN_ENV};
use fieldsync_client::MutationError;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// Newline-delimited JSON.
    Json,
}

impl OutputFormat {
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

pub fn print_output<T, F>(format: OutputFormat, value: &T, render: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, render)
}

/// Emit one result line: `render(value)` for humans, `value` as JSON otherwise.
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    render: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    if format == OutputFormat::Human {
        return writeln!(writer, "{}", render(value));
    }
    serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
    writeln!(writer)
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(format, "error", ANSI_RED, code, message);
}

pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(format, "warning", ANSI_YELLOW, code, message);
}

/// Stderr output is best effort; a closed stderr must not fail the command.
fn print_diagnostic(format: OutputFormat, label: &str, color: &str, code: &str, message: &str) {
    let is_tty = io::stderr().is_terminal();
    let mut stderr = io::stderr().lock();
    let _ = match format {
        OutputFormat::Human => {
            writeln!(stderr, "{}", render_human_stderr_line(label, message, is_tty, color))
        }
        OutputFormat::Json => {
            let body = serde_json::json!({ (label): { "code": code, "message": message } });
            writeln!(stderr, "{body}")
        }
    };
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");

    for cause in error.chain() {
        if let Some(mutation) = cause.downcast_ref::<MutationError>() {
            return match mutation {
                MutationError::Rejected { detail, .. } => {
                    ("MUTATION_REJECTED", format!("The server rejected the change: {detail}"))
                }
                MutationError::InFlight { key } => (
                    "MUTATION_IN_FLIGHT",
                    format!("A change to {key} is still waiting for the server. Try again shortly."),
                ),
                MutationError::Lost { key, .. } => (
                    "MUTATION_LOST",
                    format!("The change to {key} was not applied by the server and has been reverted."),
                ),
                MutationError::NotFound { key } => {
                    ("NOT_FOUND", format!("No row {key} in this project. Run: fieldsync watch"))
                }
                MutationError::Network(_) => ("NETWORK_ERROR", network_hint(&message)),
                _ => ("MUTATION_FAILED", message),
            };
        }
        if let Some(ConfigError::InvalidUrl { .. }) = cause.downcast_ref::<ConfigError>() {
            return (
                "CONFIG_INVALID",
                format!("{message}. Check api_url with: fieldsync config show"),
            );
        }
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("(401)") || lower.contains("(403)") || lower.contains("unauthorized") {
        return (
            "AUTH_FAILURE",
            format!("Authentication failed. Set a valid token in {TOKEN_ENV}."),
        );
    }
    if lower.contains("network error") || lower.contains("timed out") {
        return ("NETWORK_ERROR", network_hint(&message));
    }

    ("SYNC_ERROR", message)
}

fn network_hint(message: &str) -> String {
    format!("Could not reach the API ({message}). Check api_url with: fieldsync config show")
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}
