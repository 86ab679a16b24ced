//! The engine facade used by front-ends.
//!
//! A [`Fetcher`] owns the configuration and the shared transport, and turns
//! "list this platform" or "download this entry" requests into engine calls
//! whose outcomes are always published through the progress protocol files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bulk::{BulkBatch, BulkOrchestrator, BulkProgress, ItemDownloader};
use crate::cache::ListingCache;
use crate::config::AppConfig;
use crate::download::{DownloadOutcome, DownloadProgress, Downloader};
use crate::error::{Error, Result};
use crate::fs::write_atomic;
use crate::listing::{Lister, Listing};
use crate::platform::{PlatformCatalog, PlatformSource};
use crate::progress::{
    Completion, LISTING_FILE, ListingDocument, PROGRESS_FILE, ProgressFile, ProgressFileReporter,
    ProgressRecord,
};
use crate::resolve::{local_filename, resolve};
use crate::source::ListingEntry;
use crate::stats::FileStats;
use crate::transport::{ReqwestTransport, Transport};

/// Catalog document written by [`Fetcher::export_catalog`].
pub const CATALOG_FILE: &str = "platforms.json";

/// Writes the catalog for a configuration that may have failed to load.
///
/// A failed load still produces a document: the hardcoded default catalog.
///
/// # Errors
///
/// Returns an error only if the document cannot be written.
pub async fn export_catalog_for(ipc_dir: &Path, config: &Result<AppConfig>) -> Result<PlatformCatalog> {
    let catalog = match config {
        Ok(config) => PlatformCatalog::generate(Ok(&config.platforms)),
        Err(e) => PlatformCatalog::generate(Err(Error::Config(e.to_string()))),
    };
    write_catalog(ipc_dir, &catalog).await?;
    Ok(catalog)
}

async fn write_catalog(ipc_dir: &Path, catalog: &PlatformCatalog) -> Result<()> {
    let json = serde_json::to_vec_pretty(catalog)?;
    write_atomic(&ipc_dir.join(CATALOG_FILE), &json).await?;
    Ok(())
}

/// Where one entry comes from and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub url: String,
    pub path: PathBuf,
    pub completion: Completion,
}

/// Forwards progress to several sinks.
struct Fanout(Vec<Arc<dyn DownloadProgress>>);

impl DownloadProgress for Fanout {
    fn on_record(&self, name: &str, record: &ProgressRecord) {
        for sink in &self.0 {
            sink.on_record(name, record);
        }
    }

    fn on_file_complete(&self, name: &str, stats: &FileStats) {
        for sink in &self.0 {
            sink.on_file_complete(name, stats);
        }
    }
}

/// Listing, download, and bulk operations over the configured platforms.
pub struct Fetcher {
    config: AppConfig,
    lister: Lister,
    downloader: Downloader,
    listing_lock: Mutex<()>,
    job_lock: Mutex<()>,
}

impl Fetcher {
    /// Creates a fetcher talking HTTP with the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config.http)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Creates a fetcher over an arbitrary transport.
    #[must_use]
    pub fn with_transport(config: AppConfig, transport: Arc<dyn Transport>) -> Self {
        let lister = Lister::new(
            Arc::clone(&transport),
            ListingCache::new(&config.paths.cache_dir),
            config.listing.clone(),
        );
        let downloader = Downloader::new(transport, config.download.clone());
        Self {
            config,
            lister,
            downloader,
            listing_lock: Mutex::new(()),
            job_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn platforms(&self) -> &[PlatformSource] {
        &self.config.platforms
    }

    /// Path of the single-download progress document.
    #[must_use]
    pub fn progress_path(&self) -> PathBuf {
        self.config.paths.ipc_dir.join(PROGRESS_FILE)
    }

    /// Path of the listing document.
    #[must_use]
    pub fn listing_path(&self) -> PathBuf {
        self.config.paths.ipc_dir.join(LISTING_FILE)
    }

    /// Writes the platform catalog to the IPC directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn export_catalog(&self) -> Result<PlatformCatalog> {
        let catalog = PlatformCatalog::generate(Ok(self.platforms()));
        write_catalog(&self.config.paths.ipc_dir, &catalog).await?;
        Ok(catalog)
    }

    /// Lists a platform, from cache when fresh unless `refresh` is set.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnknownPlatform`] or the listing error.
    pub async fn list(&self, platform_id: &str, refresh: bool) -> Result<Listing> {
        let platform = self.config.platform(platform_id)?;
        let _guard = self.listing_lock.lock().await;
        if refresh {
            self.lister.refresh(platform).await
        } else {
            self.lister.list(platform).await
        }
    }

    /// Runs a listing request and publishes its outcome as the listing
    /// document. Failures become an empty listing with an `error` field.
    ///
    /// # Errors
    ///
    /// Returns an error only if the document itself cannot be written.
    pub async fn publish_listing(&self, platform_id: &str, refresh: bool) -> Result<ListingDocument> {
        let path = self.listing_path();
        ListingDocument::loading(platform_id).write(&path).await?;

        let doc = match self.list(platform_id, refresh).await {
            Ok(listing) => {
                let platform = self.config.platform(platform_id)?;
                ListingDocument::from_listing(platform, &listing)
            }
            Err(e) => ListingDocument::failure(platform_id, e.to_string()),
        };
        doc.write(&path).await?;
        Ok(doc)
    }

    /// Resolves where `entry` of `platform_id` is fetched from and stored.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnknownPlatform`] or a resolution error.
    pub fn target(&self, platform_id: &str, entry: &ListingEntry) -> Result<DownloadTarget> {
        let platform = self.config.platform(platform_id)?;
        let url = resolve(platform, entry)?;
        let filename = local_filename(entry);
        let path = self
            .config
            .paths
            .storage_root
            .join(&platform.destination_folder)
            .join(&filename);
        Ok(DownloadTarget {
            url,
            completion: Completion {
                file: path.clone(),
                platform: platform.id.clone(),
                folder: platform.destination_folder.clone(),
                filename,
            },
            path,
        })
    }

    /// Downloads one entry into `<storage_root>/<folder>/<filename>`.
    ///
    /// The progress document receives a terminal record whatever happens.
    /// Only one download runs at a time; concurrent callers wait their turn.
    ///
    /// # Errors
    ///
    /// Returns the lookup, resolution, or download error that ended the job.
    pub async fn download(
        &self,
        platform_id: &str,
        entry: &ListingEntry,
        observer: Option<Arc<dyn DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let _job = self.job_lock.lock().await;
        let mut file = ProgressFile::new(self.progress_path());
        file.begin().await?;

        let target = match self.target(platform_id, entry) {
            Ok(target) => target,
            Err(e) => {
                log::error!("Cannot download {}: {e}", entry.reference);
                file.write(&ProgressRecord::failed(e.to_string(), 0, None))
                    .await?;
                return Err(e);
            }
        };
        log::info!("Downloading {} to {}", target.url, target.path.display());

        let (reporter, writer) = ProgressFileReporter::spawn(file, Some(target.completion));
        let reporter: Arc<dyn DownloadProgress> = Arc::new(reporter);
        let progress: Arc<dyn DownloadProgress> = match observer {
            Some(observer) => Arc::new(Fanout(vec![reporter, observer])),
            None => reporter,
        };

        let result = self
            .downloader
            .download(&target.url, &target.path, None, &progress, cancel)
            .await;

        drop(progress);
        if let Err(e) = writer.await {
            log::warn!("Progress writer stopped early: {e}");
        }
        result
    }

    /// Downloads `entries` one after another, publishing batch status.
    pub async fn bulk(
        &self,
        platform_id: &str,
        entries: Vec<ListingEntry>,
        progress: &dyn BulkProgress,
        cancel: &CancellationToken,
    ) -> BulkBatch {
        BulkOrchestrator::new(self.config.bulk.clone())
            .with_ipc_dir(&self.config.paths.ipc_dir)
            .run(self, platform_id, entries, progress, cancel)
            .await
    }
}

#[async_trait]
impl ItemDownloader for Fetcher {
    async fn download_item(&self, platform_id: &str, entry: &ListingEntry) -> Result<PathBuf> {
        // Bulk cancellation never interrupts the item in flight.
        let outcome = self
            .download(platform_id, entry, None, &CancellationToken::new())
            .await?;
        Ok(outcome.path)
    }
}
