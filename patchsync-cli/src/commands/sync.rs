//! `sync` and `verify` commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use patchsync::config::default_config_path;
use patchsync::progress::ProgressMonitor;
use patchsync::{
    init_logging, CancellationFlag, ConfigFile, LogConfig, Manifest, SyncConfig, SyncReport,
    Synchronizer,
};

use crate::error::CliError;
use crate::progress::BarMonitor;

/// Arguments shared by `sync` and `verify`.
#[derive(Debug, Clone, Default)]
pub struct SyncArgs {
    pub manifest: PathBuf,
    pub install_dir: PathBuf,
    pub base_url: Option<String>,
    pub workers: Option<usize>,
    pub retries: Option<u32>,
    pub config: Option<PathBuf>,
    pub verbose: bool,
    pub quiet: bool,
    pub verify_only: bool,
}

/// Run a synchronization (or verification) and print a summary.
pub fn run(args: SyncArgs) -> Result<(), CliError> {
    let file = load_config_file(args.config.as_deref())?;
    let log_config = log_config(&file.logging, args.verbose);
    let _logging = init_logging(&log_config)?;

    let config = resolve_config(file.sync, &args);
    let manifest = Manifest::load(&args.manifest).map_err(CliError::Manifest)?;

    let cancel = CancellationFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, finishing in-flight work...");
        handler_flag.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    if !args.quiet {
        let mode = if config.verify_only { "Verifying" } else { "Synchronizing" };
        println!(
            "{} {} files into {}",
            mode,
            manifest.len(),
            config.install_dir.display()
        );
    }

    let monitor: Arc<dyn ProgressMonitor> = if args.quiet {
        Arc::new(BarMonitor::hidden())
    } else {
        Arc::new(BarMonitor::new(manifest.total_size()))
    };

    tracing::debug!(
        workers = config.worker_count,
        retries = config.retries,
        base_url = config.base_url.as_deref().unwrap_or("-"),
        "Resolved configuration"
    );
    let synchronizer = Synchronizer::over_http(config, cancel)?;
    let report = synchronizer.run(&manifest, Some(monitor))?;

    if !args.quiet {
        print_report(&report);
    }
    Ok(())
}

fn load_config_file(explicit: Option<&Path>) -> Result<ConfigFile, CliError> {
    if let Some(path) = explicit {
        return ConfigFile::load(path).map_err(|e| CliError::Config(e.to_string()));
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            ConfigFile::load(&path).map_err(|e| CliError::Config(e.to_string()))
        }
        _ => Ok(ConfigFile::default()),
    }
}

fn log_config(base: &LogConfig, verbose: bool) -> LogConfig {
    if verbose {
        base.clone().with_level("debug")
    } else {
        base.clone()
    }
}

/// Command-line flags take precedence over the config file.
fn resolve_config(base: SyncConfig, args: &SyncArgs) -> SyncConfig {
    let verify_only = args.verify_only || base.verify_only;
    let mut config = base
        .with_install_dir(&args.install_dir)
        .with_verify_only(verify_only);
    if let Some(url) = &args.base_url {
        config = config.with_base_url(url.clone());
    }
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(retries) = args.retries {
        config = config.with_retries(retries);
    }
    config
}

fn print_report(report: &SyncReport) {
    println!();
    println!("Bundles:     {}/{} verified", report.validated_bundles, report.bundles);
    println!("Files:       {}", report.files);
    println!("Downloads:   {}", report.downloads);
    println!("Local fixes: {}", report.copies);
    println!(
        "Transferred: {}",
        indicatif::HumanBytes(report.bytes_transferred)
    );
    println!("Elapsed:     {:.1}s", report.elapsed.as_secs_f64());
}
