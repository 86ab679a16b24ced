//! Configuration types for listing and download operations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::platform::{PlatformSource, default_folder, default_platforms};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "FETCHER_CONFIG";

/// Retry budget applied to each chunk (and each probe) independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before `attempt` (1-based). The first attempt never waits.
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Configuration for download operations.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Number of parallel byte-range chunks per file.
    pub parallelism: usize,
    /// Files smaller than this are fetched as a single chunk.
    pub min_chunk_bytes: u64,
    /// Minimum spacing between progress emissions.
    pub progress_interval: Duration,
    /// Whether to remove the `.part` file when a download fails.
    pub cleanup_on_error: bool,
    /// Per-chunk retry policy.
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            min_chunk_bytes: 5 * 1024 * 1024,
            progress_interval: Duration::from_millis(200),
            cleanup_on_error: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of parallel chunks per file.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the chunking threshold in bytes.
    #[must_use]
    pub const fn with_min_chunk_bytes(mut self, bytes: u64) -> Self {
        self.min_chunk_bytes = bytes;
        self
    }

    /// Sets the progress emission interval.
    #[must_use]
    pub const fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets whether to clean up `.part` files on download error.
    #[must_use]
    pub const fn with_cleanup_on_error(mut self, cleanup: bool) -> Self {
        self.cleanup_on_error = cleanup;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for listing and caching.
#[derive(Debug, Clone)]
pub struct ListingConfig {
    /// Maximum age at which a cached listing is still trusted.
    pub ttl: Duration,
    /// Serve an expired cache record when the remote fetch fails.
    pub allow_stale_fallback: bool,
    /// Descend one level into GitHub subfolders.
    pub recurse_subfolders: bool,
    /// Extensions accepted from HTML indexes (without the leading dot).
    pub extensions: Vec<String>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            allow_stale_fallback: true,
            recurse_subfolders: false,
            extensions: ["zip", "p8.png", "rom", "bin", "cue", "iso", "7z"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for any single read while a response is streaming.
    pub read_timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            user_agent: format!("fetcher/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Path configuration for downloads, protocol files and the listing cache.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Root under which `<platform_folder>/<filename>` is written.
    pub storage_root: PathBuf,
    /// Directory holding the progress, listing and bulk protocol files.
    pub ipc_dir: PathBuf,
    /// Directory holding one cache record per platform.
    pub cache_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            storage_root: PathBuf::from("/storage/roms"),
            ipc_dir: tmp.join("fetcher"),
            cache_dir: tmp.join("file_cache"),
        }
    }
}

/// Bulk batch settings.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Pause between one item's terminal state and the next item's start.
    pub pacing_delay: Duration,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            pacing_delay: Duration::from_millis(500),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub download: DownloadConfig,
    pub listing: ListingConfig,
    pub http: HttpConfig,
    pub paths: PathConfig,
    pub bulk: BulkConfig,
    /// Static platform table, immutable for the process lifetime.
    pub platforms: Vec<PlatformSource>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            listing: ListingConfig::default(),
            http: HttpConfig::default(),
            paths: PathConfig::default(),
            bulk: BulkConfig::default(),
            platforms: default_platforms(),
        }
    }
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location (`<config_dir>/fetcher/config.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fetcher")
            .join("config.toml")
    }

    /// Loads configuration from `$FETCHER_CONFIG` or the default location.
    ///
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV).map_or_else(Self::default_path, PathBuf::from);
        Self::load_from(&path)
    }

    /// Loads configuration from a specific file; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                log::info!("Loaded config from {}", path.display());
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(format!("{}: {e}", path.display()))),
        }
    }

    /// Parses a TOML document; every field is optional.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on malformed TOML.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        Ok(file.into_config())
    }

    /// Looks up a platform by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPlatform`] if no platform has this id.
    pub fn platform(&self, id: &str) -> Result<&PlatformSource> {
        self.platforms
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::UnknownPlatform(id.to_string()))
    }
}

// ============================================================================
// On-disk schema
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    download: DownloadSection,
    listing: ListingSection,
    http: HttpSection,
    paths: PathsSection,
    bulk: BulkSection,
    platforms: Option<Vec<PlatformSection>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DownloadSection {
    parallelism: Option<usize>,
    min_chunk_bytes: Option<u64>,
    progress_interval_ms: Option<u64>,
    cleanup_on_error: Option<bool>,
    max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListingSection {
    ttl_secs: Option<u64>,
    allow_stale_fallback: Option<bool>,
    recurse_subfolders: Option<bool>,
    extensions: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpSection {
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PathsSection {
    storage_root: Option<PathBuf>,
    ipc_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BulkSection {
    pacing_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PlatformSection {
    id: String,
    source_url: String,
    display_name: Option<String>,
    destination_folder: Option<String>,
}

impl ConfigFile {
    fn into_config(self) -> AppConfig {
        let mut config = AppConfig::default();

        let d = self.download;
        let download = &mut config.download;
        if let Some(v) = d.parallelism {
            download.parallelism = v.max(1);
        }
        if let Some(v) = d.min_chunk_bytes {
            download.min_chunk_bytes = v;
        }
        if let Some(v) = d.progress_interval_ms {
            download.progress_interval = Duration::from_millis(v);
        }
        if let Some(v) = d.cleanup_on_error {
            download.cleanup_on_error = v;
        }
        if let Some(v) = d.max_attempts {
            download.retry.max_attempts = v.max(1);
        }
        if let Some(v) = d.retry_base_delay_ms {
            download.retry.base_delay = Duration::from_millis(v);
        }

        let l = self.listing;
        if let Some(v) = l.ttl_secs {
            config.listing.ttl = Duration::from_secs(v);
        }
        if let Some(v) = l.allow_stale_fallback {
            config.listing.allow_stale_fallback = v;
        }
        if let Some(v) = l.recurse_subfolders {
            config.listing.recurse_subfolders = v;
        }
        if let Some(v) = l.extensions {
            config.listing.extensions = v;
        }

        let h = self.http;
        if let Some(v) = h.connect_timeout_secs {
            config.http.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = h.read_timeout_secs {
            config.http.read_timeout = Duration::from_secs(v);
        }
        if let Some(v) = h.user_agent {
            config.http.user_agent = v;
        }

        let p = self.paths;
        if let Some(v) = p.storage_root {
            config.paths.storage_root = v;
        }
        if let Some(v) = p.ipc_dir {
            config.paths.ipc_dir = v;
        }
        if let Some(v) = p.cache_dir {
            config.paths.cache_dir = v;
        }

        if let Some(v) = self.bulk.pacing_delay_ms {
            config.bulk.pacing_delay = Duration::from_millis(v);
        }

        if let Some(platforms) = self.platforms {
            config.platforms = platforms
                .into_iter()
                .map(|p| PlatformSource {
                    display_name: p.display_name.unwrap_or_else(|| p.id.clone()),
                    destination_folder: p
                        .destination_folder
                        .unwrap_or_else(|| default_folder(&p.id)),
                    source_url: p.source_url,
                    id: p.id,
                })
                .collect();
        }

        config
    }
}
