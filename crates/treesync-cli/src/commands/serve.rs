//! Serve command - Run the sync server
//!
//! Provides the `treesync serve` CLI command which:
//! 1. Merges command-line flags over the loaded configuration
//! 2. Validates the server and logging sections
//! 3. Runs the server until SIGINT/SIGTERM

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use treesync_core::config::Config;
use treesync_sync::server::Server;

use super::{check_config, parse_ignore_list, shutdown_token};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory to serve
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Comma-separated ignore patterns (replaces the configured list)
    #[arg(short, long)]
    pub ignore: Option<String>,

    /// Address to bind
    #[arg(long)]
    pub bind: Option<String>,
}

impl ServeCommand {
    /// Overrides configuration values with the flags that were given.
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.dir {
            config.server.directory = dir.clone();
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(list) = &self.ignore {
            config.ignore = parse_ignore_list(list);
        }
    }

    pub async fn execute(&self, mut config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        self.apply(&mut config);
        check_config(&config, &["server", "logging"], &*formatter)?;

        info!(
            address = %config.server.listen_address(),
            directory = %config.server.directory.display(),
            ignore = ?config.ignore,
            "Starting sync server"
        );

        let server = Server::new(config.server.clone(), config.ignorer());
        server
            .run(shutdown_token())
            .await
            .context("Sync server failed")?;

        formatter.done("Sync server stopped");
        Ok(())
    }
}
