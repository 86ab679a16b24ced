//! fetcher - listing and downloading files from remote ROM sources.
//!
//! This library lists downloadable files from plain HTML directory indexes
//! and GitHub repository trees, caches those listings, and downloads files
//! with parallel range requests. Every outcome is also published as small
//! JSON documents so that a separate front-end can poll them.
//!
//! # Example
//!
//! ```no_run
//! use fetcher::{AppConfig, Fetcher};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> fetcher::Result<()> {
//! let fetcher = Fetcher::new(AppConfig::load()?)?;
//!
//! // List a platform, from cache when fresh
//! let listing = fetcher.list("pico-8", false).await?;
//!
//! // Download the first entry into <storage_root>/<folder>/
//! if let Some(entry) = listing.entries.first() {
//!     let outcome = fetcher
//!         .download("pico-8", entry, None, &CancellationToken::new())
//!         .await?;
//!     println!("Saved {}", outcome.path.display());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod bulk;
pub mod cache;
pub mod config;
pub mod controller;
pub mod download;
pub mod error;
pub mod format;
pub mod fs;
pub mod listing;
pub mod platform;
pub mod progress;
pub mod resolve;
pub mod session;
pub mod source;
pub mod stats;
pub mod transport;

#[cfg(feature = "cli")]
pub mod cli;

// Re-export main types for convenience
pub use bulk::{
    BulkBatch, BulkOrchestrator, BulkProgress, BulkState, BulkStatus, ItemDownloader, ItemResult,
    ItemStatus, NoBulkProgress,
};
pub use cache::{CacheRecord, ListingCache};
pub use config::{AppConfig, DownloadConfig, ListingConfig, PathConfig, RetryPolicy};
pub use controller::{Controller, Effect, Event, Screen};
pub use download::{
    ChunkRange, ChunkState, DownloadOutcome, DownloadProgress, Downloader, NoProgress, plan_chunks,
};
pub use error::{Error, Result};
pub use format::{format_bytes, format_duration};
pub use fs::{FileSystem, TokioFileSystem};
pub use listing::{Lister, Listing, ListingOrigin};
pub use platform::{PlatformCatalog, PlatformSource, SourceKind};
pub use progress::{
    LISTING_FILE, ListingDocument, ListingPoll, PROGRESS_FILE, ProgressFile, ProgressPoller,
    ProgressRecord, ProgressStatus,
};
pub use resolve::{local_filename, resolve};
pub use session::Fetcher;
pub use source::{ListingEntry, clean_display_name};
pub use stats::FileStats;
pub use transport::{ReqwestTransport, Transport};

#[doc(hidden)]
pub use transport::{Failure, MemoryTransport};
