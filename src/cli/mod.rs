//! CLI mode for fetcher: list platforms, fetch listings, download files.

mod progress;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::export_catalog_for;
use crate::{
    AppConfig, DownloadProgress, Error, Fetcher, ListingEntry, PathConfig, ProgressPoller,
    ProgressStatus, clean_display_name, format_bytes,
};

use progress::{BarProgress, BatchBar, print_batch_summary, print_catalog, print_listing_summary};

const DEFAULT_POLL_WAIT_SECS: u64 = 3600;

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Platforms,
    List { platform: String, refresh: bool },
    Download { platform: String, reference: String },
    Bulk { platform: String, references: Vec<String> },
    Poll { max_wait: Duration },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    command: Command,
    config_path: Option<PathBuf>,
    parallelism: Option<usize>,
}

fn print_usage() {
    eprintln!("Usage: fetcher [OPTIONS] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  platforms                         Show configured platforms");
    eprintln!("  list <platform> [--refresh]       Print the listing document for a platform");
    eprintln!("  download <platform> <reference>   Download one file");
    eprintln!("  bulk <platform> <reference>...    Download files one after another");
    eprintln!("  poll [--max-wait <secs>]          Follow the progress file until it finishes");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>     Config file (default: $FETCHER_CONFIG or the user config dir)");
    eprintln!("  -p, --parallel <N>      Parallel chunks per file (default: 4)");
    eprintln!("  -h, --help              Show this help");
    eprintln!();
    eprintln!("Set RUST_LOG=debug for verbose logs.");
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> crate::Result<CliArgs> {
    let mut config_path = None;
    let mut parallelism = None;
    let mut refresh = false;
    let mut max_wait = Duration::from_secs(DEFAULT_POLL_WAIT_SECS);
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| Error::Config(format!("{arg} requires a value")))?;
                config_path = Some(PathBuf::from(value));
            }
            "-p" | "--parallel" => {
                let value = args
                    .next()
                    .and_then(|v| v.parse::<usize>().ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(|| Error::Config(format!("{arg} requires a positive number")))?;
                parallelism = Some(value);
            }
            "--max-wait" => {
                let secs = args
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| Error::Config(format!("{arg} requires seconds")))?;
                max_wait = Duration::from_secs(secs);
            }
            "-r" | "--refresh" => refresh = true,
            "-h" | "--help" => {
                return Ok(CliArgs {
                    command: Command::Help,
                    config_path,
                    parallelism,
                });
            }
            other if other.starts_with('-') => {
                return Err(Error::Config(format!("Unknown option: {other}")));
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None => Command::Help,
        Some("platforms") => Command::Platforms,
        Some("list") => Command::List {
            platform: positional
                .next()
                .ok_or_else(|| Error::Config("list requires a platform".to_string()))?,
            refresh,
        },
        Some("download") => {
            let platform = positional
                .next()
                .ok_or_else(|| Error::Config("download requires a platform".to_string()))?;
            let reference = positional
                .next()
                .ok_or_else(|| Error::Config("download requires a file reference".to_string()))?;
            Command::Download {
                platform,
                reference,
            }
        }
        Some("bulk") => {
            let platform = positional
                .next()
                .ok_or_else(|| Error::Config("bulk requires a platform".to_string()))?;
            let references: Vec<String> = positional.by_ref().collect();
            if references.is_empty() {
                return Err(Error::Config("bulk requires at least one file reference".to_string()));
            }
            Command::Bulk {
                platform,
                references,
            }
        }
        Some("poll") => Command::Poll { max_wait },
        Some(other) => return Err(Error::Config(format!("Unknown command: {other}"))),
    };

    Ok(CliArgs {
        command,
        config_path,
        parallelism,
    })
}

/// Builds a listing entry from a reference typed on the command line.
fn entry_for(reference: &str, config: &AppConfig) -> ListingEntry {
    let name = reference.rsplit('/').next().unwrap_or(reference);
    ListingEntry::new(clean_display_name(name, &config.listing.extensions), reference)
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl-C, cancelling");
            token.cancel();
        }
    });
}

/// Applies command-line overrides to a loaded configuration.
fn with_overrides(loaded: crate::Result<AppConfig>, parallelism: Option<usize>) -> crate::Result<AppConfig> {
    let mut config = loaded?;
    if let Some(parallelism) = parallelism {
        config.download = config.download.with_parallelism(parallelism);
    }
    Ok(config)
}

/// Runs the CLI with arguments from the environment.
///
/// # Errors
///
/// Returns an error for bad arguments, unreadable configuration, or a
/// failed download. Listing failures are reported in the listing document.
pub async fn run() -> crate::Result<()> {
    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            print_usage();
            return Err(e);
        }
    };

    let loaded = match &args.config_path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    match args.command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Platforms => {
            let ipc_dir = loaded
                .as_ref()
                .map_or_else(|_| PathConfig::default().ipc_dir, |c| c.paths.ipc_dir.clone());
            let catalog = export_catalog_for(&ipc_dir, &loaded).await?;
            print_catalog(&catalog);
            Ok(())
        }
        Command::List { platform, refresh } => {
            let fetcher = Fetcher::new(with_overrides(loaded, args.parallelism)?)?;
            let doc = fetcher.publish_listing(&platform, refresh).await?;
            print_listing_summary(&doc);
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
        Command::Download {
            platform,
            reference,
        } => {
            let config = with_overrides(loaded, args.parallelism)?;
            let entry = entry_for(&reference, &config);
            let fetcher = Fetcher::new(config)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let bars: Arc<dyn DownloadProgress> = Arc::new(BarProgress::new());
            let outcome = fetcher
                .download(&platform, &entry, Some(bars), &cancel)
                .await?;
            log::info!(
                "Saved {} ({})",
                outcome.path.display(),
                format_bytes(outcome.total_bytes)
            );
            Ok(())
        }
        Command::Bulk {
            platform,
            references,
        } => {
            let config = with_overrides(loaded, args.parallelism)?;
            let entries: Vec<ListingEntry> = references.iter().map(|r| entry_for(r, &config)).collect();
            let fetcher = Fetcher::new(config)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let bar = BatchBar::new(entries.len());
            let batch = fetcher.bulk(&platform, entries, &bar, &cancel).await;
            bar.finish();
            print_batch_summary(&batch);
            Ok(())
        }
        Command::Poll { max_wait } => {
            let config = with_overrides(loaded, args.parallelism)?;
            let poller = ProgressPoller::new(config.paths.ipc_dir.join(crate::PROGRESS_FILE))
                .with_max_wait(max_wait);
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let record = poller
                .wait(&cancel, |record| {
                    eprintln!(
                        "{:?} {}% ({})",
                        record.status,
                        record.percent,
                        format_bytes(record.downloaded_bytes)
                    );
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&record.to_document())?);
            if record.status == ProgressStatus::Error {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
