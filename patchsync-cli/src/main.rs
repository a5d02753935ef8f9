//! patchsync CLI - reconcile an installation directory against a manifest.

mod commands;
mod error;
mod progress;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::commands::sync::SyncArgs;
use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "patchsync")]
#[command(version, about = "Manifest-driven content synchronization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, repair and verify every file in a manifest
    Sync {
        #[command(flatten)]
        common: CommonArgs,

        /// Base URL that remote paths are resolved against
        #[arg(long)]
        base_url: Option<String>,

        /// Number of worker threads
        #[arg(long)]
        workers: Option<usize>,

        /// Download retries per file content
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Check the installation and repair from local copies without downloading
    Verify {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show the default configuration file path
    ConfigPath,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// JSON manifest describing the expected files
    #[arg(short, long)]
    manifest: PathBuf,

    /// Installation directory to reconcile
    #[arg(short, long)]
    install_dir: PathBuf,

    /// Config file (defaults to the per-user config path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Suppress progress bar and summary
    #[arg(short, long)]
    quiet: bool,
}

impl CommonArgs {
    fn into_sync_args(self) -> SyncArgs {
        SyncArgs {
            manifest: self.manifest,
            install_dir: self.install_dir,
            config: self.config,
            verbose: self.verbose,
            quiet: self.quiet,
            ..Default::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn dispatch(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Sync {
            common,
            base_url,
            workers,
            retries,
        } => commands::sync::run(SyncArgs {
            base_url,
            workers,
            retries,
            ..common.into_sync_args()
        }),
        Commands::Verify { common } => commands::sync::run(SyncArgs {
            verify_only: true,
            ..common.into_sync_args()
        }),
        Commands::ConfigPath => {
            match patchsync::config::default_config_path() {
                Some(path) => println!("{}", path.display()),
                None => println!("(no config directory on this platform)"),
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync() {
        let cli = Cli::parse_from([
            "patchsync",
            "sync",
            "-m",
            "manifest.json",
            "-i",
            "/opt/game",
            "--workers",
            "3",
        ]);
        match cli.command {
            Commands::Sync {
                common, workers, ..
            } => {
                assert_eq!(common.manifest, PathBuf::from("manifest.json"));
                assert_eq!(workers, Some(3));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_verify_requires_install_dir() {
        let result = Cli::try_parse_from(["patchsync", "verify", "-m", "manifest.json"]);
        assert!(result.is_err());
    }
}
