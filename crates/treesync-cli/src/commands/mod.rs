//! Subcommands and the plumbing they share

pub mod client;
pub mod manifest;
pub mod serve;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use treesync_core::config::Config;

use crate::output::OutputFormatter;

/// Splits a comma-separated `--ignore` value into patterns.
pub(crate) fn parse_ignore_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Reports every validation problem in the given config sections and fails
/// if there were any.
pub(crate) fn check_config(
    config: &Config,
    sections: &[&str],
    formatter: &dyn OutputFormatter,
) -> Result<()> {
    let errors: Vec<_> = config
        .validate()
        .into_iter()
        .filter(|e| {
            sections
                .iter()
                .any(|s| e.field.split('.').next() == Some(*s))
        })
        .collect();

    if errors.is_empty() {
        return Ok(());
    }
    for error in &errors {
        formatter.problem(&error.to_string());
    }
    bail!("Invalid configuration ({} problem(s))", errors.len())
}

/// Returns a token that is cancelled on SIGINT or SIGTERM.
pub(crate) fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });
    token
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}
