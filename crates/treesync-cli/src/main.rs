//! treesync CLI - Keep a directory tree mirrored between machines
//!
//! Provides commands for:
//! - Serving a directory to sync clients (`serve`)
//! - Mirroring a served directory locally (`client`)
//! - Printing the manifest of a directory (`manifest`)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use treesync_core::config::{Config, LoggingConfig};

mod commands;
mod output;

use commands::{client::ClientCommand, manifest::ManifestCommand, serve::ServeCommand};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "treesync", version, about = "Live directory synchronization")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve a directory to sync clients
    Serve(ServeCommand),
    /// Mirror a served directory and push local changes back
    Client(ClientCommand),
    /// Print the manifest of a directory
    Manifest(ManifestCommand),
}

/// Loads the config file named on the command line, or the default one.
///
/// An explicitly named file must exist; the default location may be absent.
fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::load(std::path::Path::new(path))
            .with_context(|| format!("Failed to load config file {path}")),
        None => Ok(Config::load_or_default(&Config::default_path())),
    }
}

/// `RUST_LOG` wins, then `-v`/`-vv`, then the configured level.
fn log_filter(verbose: u8, logging: &LoggingConfig) -> EnvFilter {
    let level = match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_tracing(verbose: u8, logging: &LoggingConfig) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, logging))
        .with_target(false);

    if logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(cli.verbose, &config.logging);

    let format = OutputFormat::from_json_flag(cli.json);

    match cli.command {
        Commands::Serve(cmd) => cmd.execute(config, format).await,
        Commands::Client(cmd) => cmd.execute(config, format).await,
        Commands::Manifest(cmd) => cmd.execute(config, format).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["treesync", "serve", "-vv", "--json", "--port", "9000"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
        match cli.command {
            Commands::Serve(cmd) => assert_eq!(cmd.port, Some(9000)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["treesync"]).is_err());
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(load_config(missing.to_str()).is_err());
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  port: 9999\nignore:\n  - .git\n").unwrap();

        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.ignore, vec![".git".to_string()]);
    }
}
