//! Progress bars and summaries for CLI downloads.

use std::sync::Mutex;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    BulkBatch, BulkProgress, DownloadProgress, FileStats, ItemResult, ItemStatus, ListingDocument,
    PlatformCatalog, ProgressRecord, ProgressStatus, format_bytes, format_duration,
};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates a progress bar for a single file download.
pub fn make_progress_bar(size: u64, name: &str) -> ProgressBar {
    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
        )
        .expect("progress template is valid")
        .progress_chars("━━╌"),
    );
    bar.set_message(name.to_string());
    bar
}

/// Creates a spinner for a download of unknown size.
pub fn make_spinner(name: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {bytes} @ {bytes_per_sec} - {msg}")
            .expect("spinner template is valid"),
    );
    bar.set_message(name.to_string());
    bar
}

/// Creates a bar counting finished items of a batch.
pub fn make_batch_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("Batch [{bar:40.green/white}] {pos}/{len} - {msg}")
            .expect("template valid")
            .progress_chars("━━╌"),
    );
    bar
}

/// Drives one indicatif bar from engine progress records.
#[derive(Default)]
pub struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    pub const fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl DownloadProgress for BarProgress {
    fn on_record(&self, name: &str, record: &ProgressRecord) {
        let mut slot = self
            .bar
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match record.status {
            ProgressStatus::Starting => {}
            ProgressStatus::Downloading => {
                let bar = slot.get_or_insert_with(|| {
                    let bar = match record.total_bytes {
                        Some(total) => make_progress_bar(total, name),
                        None => make_spinner(name),
                    };
                    bar.enable_steady_tick(std::time::Duration::from_millis(250));
                    bar
                });
                bar.set_position(record.downloaded_bytes);
            }
            ProgressStatus::Success => {
                if let Some(bar) = slot.take() {
                    bar.finish_and_clear();
                }
            }
            ProgressStatus::Error => {
                if let Some(bar) = slot.take() {
                    bar.abandon();
                }
                eprintln!(
                    "{} {name}: {}",
                    style("✗").red().bold(),
                    record.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    fn on_file_complete(&self, name: &str, stats: &FileStats) {
        println!(
            "{} {name} - {} in {} ({}/s avg, {}/s peak)",
            style("✓").green().bold(),
            format_bytes(stats.size),
            format_duration(stats.elapsed),
            format_bytes(stats.average_speed),
            format_bytes(stats.peak_speed),
        );
    }
}

/// Renders a batch as a single bar plus one line per finished item.
pub struct BatchBar {
    bar: ProgressBar,
}

impl BatchBar {
    pub fn new(total: usize) -> Self {
        Self {
            bar: make_batch_bar(total as u64),
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BulkProgress for BatchBar {
    fn on_batch(&self, batch: &BulkBatch) {
        if let Some(current) = batch.current() {
            self.bar.set_message(current.display_name.clone());
        }
    }

    fn on_item(&self, batch: &BulkBatch, result: &ItemResult) {
        self.bar.set_position(batch.finished_count() as u64);
        let line = match result.status {
            ItemStatus::Success => format!("{} {}", style("✓").green().bold(), result.name),
            ItemStatus::Error => format!(
                "{} {}: {}",
                style("✗").red().bold(),
                result.name,
                result.error.as_deref().unwrap_or("unknown error")
            ),
        };
        self.bar.println(line);
    }
}

/// Prints the configured platforms.
pub fn print_catalog(catalog: &PlatformCatalog) {
    println!("{SEPARATOR}");
    println!("{:<24} folder", "platform");
    println!("{SEPARATOR}");
    for entry in &catalog.platforms {
        println!("{:<24} {}", entry.name, entry.folder);
    }
    println!("{SEPARATOR}");
}

/// Prints a human-readable summary of a listing document to stderr.
pub fn print_listing_summary(doc: &ListingDocument) {
    match &doc.error {
        Some(error) => eprintln!("{} {error}", style("Listing failed:").red().bold()),
        None => eprintln!(
            "{} file(s){}",
            doc.files.len(),
            if doc.cached == Some(true) { " (cached)" } else { "" }
        ),
    }
}

/// Prints a summary of a finished batch.
pub fn print_batch_summary(batch: &BulkBatch) {
    println!("\n{SEPARATOR}");
    println!("Bulk Download Summary");
    println!("{SEPARATOR}");
    println!("  Files requested:   {}", batch.items.len());
    println!("  Succeeded:         {}", style(batch.success_count).green());
    println!("  Failed:            {}", style(batch.failed_count).red());
    println!("  State:             {:?}", batch.state);
    println!("{SEPARATOR}");
}
