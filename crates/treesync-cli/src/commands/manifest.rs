//! Manifest command - Print what a directory looks like to the sync engine
//!
//! Lists every file that would be synchronized with its content hash, plus
//! any entries that could not be read. Comparing the output of two machines
//! shows exactly which paths diverge.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use treesync_core::config::Config;
use treesync_core::{build_manifest, ManifestScan, PathIgnorer};

use super::parse_ignore_list;
use crate::output::{get_formatter, OutputFormat, OutputFormatter};

#[derive(Debug, Args)]
pub struct ManifestCommand {
    /// Directory to scan (defaults to the configured server directory)
    pub dir: Option<PathBuf>,

    /// Comma-separated ignore patterns (replaces the configured list)
    #[arg(short, long)]
    pub ignore: Option<String>,
}

impl ManifestCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        let dir = self
            .dir
            .clone()
            .unwrap_or_else(|| config.server.directory.clone());
        let ignorer = match &self.ignore {
            Some(list) => PathIgnorer::new(parse_ignore_list(list)),
            None => config.ignorer(),
        };

        let scan_dir = dir.clone();
        let scan = tokio::task::spawn_blocking(move || build_manifest(&scan_dir, &ignorer))
            .await?
            .with_context(|| format!("Failed to scan {}", dir.display()))?;

        match format {
            OutputFormat::Json => formatter.document(&manifest_json(&dir, &scan)),
            OutputFormat::Human => print_human(&*formatter, &dir, &scan),
        }
        Ok(())
    }
}

fn manifest_json(dir: &std::path::Path, scan: &ManifestScan) -> serde_json::Value {
    serde_json::json!({
        "directory": dir.display().to_string(),
        "files": scan.manifest,
        "errors": scan.errors,
    })
}

fn print_human(formatter: &dyn OutputFormatter, dir: &std::path::Path, scan: &ManifestScan) {
    for (path, hash) in scan.manifest.iter() {
        formatter.manifest_entry(path, hash);
    }
    for error in &scan.errors {
        formatter.skipped(&error.to_string());
    }
    formatter.done(&format!(
        "{} file(s) in {}, {} unreadable",
        scan.manifest.len(),
        dir.display(),
        scan.errors.len()
    ));
}
