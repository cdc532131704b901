//! Run AppCache updates against a live manifest.
//!
//! Registers one host, starts an update for the manifest URL and prints
//! every event the host receives, then the stored cache.
//!
//! ## Usage
//!
//! ```bash
//! # Install a cache, then check it again
//! appcache-update https://example.com/app.manifest --runs 2
//!
//! # Add a master entry and use a tuned config
//! appcache-update https://example.com/app.manifest \
//!     --master https://example.com/index.html --config update.json
//!
//! # Print the effective update config
//! appcache-update https://example.com/app.manifest --print-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rustkit_appcache::{
    AppCache, AppCacheEvent, AppCacheService, EventKind, MemoryStorage, UpdateConfig,
    UpdateOutcome,
};
use rustkit_common::{init_logging, LogConfig, LogFormat};
use rustkit_net::{LoaderConfig, ResourceLoader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "appcache-update")]
#[command(about = "Run AppCache updates against a live manifest")]
struct Cli {
    /// Manifest URL
    manifest: Url,
    /// Page URL to add as a master entry
    #[arg(short, long)]
    master: Option<Url>,
    /// JSON update config
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of consecutive updates to run
    #[arg(short, long, default_value = "1")]
    runs: u32,
    /// User agent sent with every request
    #[arg(long)]
    user_agent: Option<String>,
    /// Log output format
    #[arg(long, value_enum, default_value = "compact")]
    log_format: CliLogFormat,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
    /// Print the effective update config and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Compact => LogFormat::Compact,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log.with_format(cli.log_format.into()));

    let config = match cli.config {
        Some(ref path) => UpdateConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => UpdateConfig::default(),
    };
    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let mut loader_config = LoaderConfig::default();
    if let Some(agent) = cli.user_agent {
        loader_config.user_agent = agent;
    }
    let loader = ResourceLoader::new(loader_config)?;
    let service = AppCacheService::new(Arc::new(MemoryStorage::new()), Arc::new(loader), config);
    let (host, mut events) = service.register_host().await;

    let mut failed = false;
    for run in 1..=cli.runs.max(1) {
        info!(run, manifest_url = %cli.manifest, "Starting update");
        let master = if run == 1 { cli.master.clone() } else { None };
        let handle = service.start_update(host, &cli.manifest, master).await?;

        let outcome = tokio::select! {
            outcome = drive(&handle, &mut events) => outcome,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling update");
                handle.cancel();
                handle.wait().await
            }
        };
        while let Ok(event) = events.try_recv() {
            print_event(&event);
        }
        println!("run {}: {:?}", run, outcome);

        if matches!(outcome, UpdateOutcome::Failed(_) | UpdateOutcome::Cancelled) {
            failed = true;
            break;
        }
    }

    if let Some(cache) = service.newest_cache(&cli.manifest).await? {
        print_cache(&cache);
    }
    service.shutdown().await;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Print events until the job finishes.
async fn drive(
    handle: &rustkit_appcache::UpdateHandle,
    events: &mut mpsc::UnboundedReceiver<AppCacheEvent>,
) -> UpdateOutcome {
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            outcome = handle.wait() => return outcome,
        }
    }
}

fn print_event(event: &AppCacheEvent) {
    match event.kind {
        EventKind::Progress {
            ref url,
            completed,
            total,
        } => match url {
            Some(url) => println!("  progress {}/{} {}", completed, total, url),
            None => println!("  progress {}/{}", completed, total),
        },
        EventKind::Error(ref failure) => {
            let resource = failure
                .resource_url
                .as_ref()
                .map(|u| u.to_string())
                .unwrap_or_default();
            println!("  error {} {}", failure, resource);
        }
        ref kind => println!("  {}", kind.name()),
    }
}

fn print_cache(cache: &AppCache) {
    println!(
        "cache {} ({} entries, {} bytes)",
        cache.id(),
        cache.entry_count(),
        cache.total_size()
    );
    let mut entries: Vec<_> = cache.entries().collect();
    entries.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
    for entry in entries {
        println!("  {:>8} {:?} {}", entry.response_size, entry.types, entry.url);
    }
}
