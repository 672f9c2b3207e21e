//! Client command - Mirror a served directory
//!
//! Provides the `treesync client` CLI command which:
//! 1. Merges command-line flags over the loaded configuration
//! 2. Validates the client and logging sections
//! 3. Runs the client (reconnecting as needed) until SIGINT/SIGTERM

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use tracing::info;
use treesync_core::config::Config;
use treesync_sync::client::{Client, ClientOptions};

use super::{check_config, parse_ignore_list, shutdown_token};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct ClientCommand {
    /// Server address (host:port, ws://, wss://, http:// or https://)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Local directory to keep in sync
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Comma-separated ignore patterns (replaces the configured list)
    #[arg(short, long)]
    pub ignore: Option<String>,

    /// Delete local files the server does not have (`--delete=false` keeps them)
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub delete: Option<bool>,

    /// Report what the initial sync would change without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

impl ClientCommand {
    /// Overrides configuration values with the flags that were given.
    pub fn apply(&self, config: &mut Config) {
        if let Some(server) = &self.server {
            config.client.server = server.clone();
        }
        if let Some(dir) = &self.dir {
            config.client.directory = dir.clone();
        }
        if let Some(list) = &self.ignore {
            config.ignore = parse_ignore_list(list);
        }
        if let Some(delete) = self.delete {
            config.client.delete = delete;
        }
        if self.dry_run {
            config.client.dry_run = true;
        }
    }

    pub async fn execute(&self, mut config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        self.apply(&mut config);
        check_config(&config, &["client", "logging"], &*formatter)?;

        let options =
            ClientOptions::from_config(&config.client).context("Invalid server address")?;

        info!(
            server = %options.endpoint,
            directory = %options.directory.display(),
            delete = options.delete,
            dry_run = options.dry_run,
            ignore = ?config.ignore,
            "Starting sync client"
        );

        let client = Client::new(options, config.ignorer());
        client
            .run(shutdown_token())
            .await
            .context("Sync client failed")?;

        formatter.done("Sync client stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        cmd: ClientCommand,
    }

    fn parse(args: &[&str]) -> ClientCommand {
        let mut argv = vec!["client"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().cmd
    }

    #[test]
    fn test_delete_flag_forms() {
        assert_eq!(parse(&[]).delete, None);
        assert_eq!(parse(&["--delete"]).delete, Some(true));
        assert_eq!(parse(&["--delete=false"]).delete, Some(false));
        assert_eq!(parse(&["--delete=true"]).delete, Some(true));
    }

    #[test]
    fn test_flags_override_config() {
        let cmd = parse(&[
            "--server",
            "https://sync.example.com",
            "--dir",
            "/home/me/tree",
            "--delete=false",
            "--dry-run",
        ]);
        let mut config = Config::default();

        cmd.apply(&mut config);

        assert_eq!(config.client.server, "https://sync.example.com");
        assert_eq!(config.client.directory, PathBuf::from("/home/me/tree"));
        assert!(!config.client.delete);
        assert!(config.client.dry_run);

        let options = ClientOptions::from_config(&config.client).unwrap();
        assert_eq!(options.endpoint, "wss://sync.example.com/sync");
    }

    #[test]
    fn test_dry_run_from_config_is_kept() {
        let cmd = parse(&[]);
        let mut config = Config::default();
        config.client.dry_run = true;

        cmd.apply(&mut config);
        assert!(config.client.dry_run);
        assert!(config.client.delete);
    }
}
