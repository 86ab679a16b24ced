//! File-based progress protocol.
//!
//! Engine jobs publish their state as small JSON documents in a well-known
//! directory so an external poller can follow them without sharing memory.
//! Every document is replaced atomically: a reader sees either the previous
//! document or the next one, never a torn write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::download::DownloadProgress;
use crate::error::{Error, Result};
use crate::format::{from_mb, to_mb};
use crate::fs::write_atomic;
use crate::listing::Listing;
use crate::platform::{PlatformSource, SourceKind};
use crate::stats::FileStats;

/// Progress document for the current single-file download.
pub const PROGRESS_FILE: &str = "file_download_progress.json";
/// Listing document for the most recent listing request.
pub const LISTING_FILE: &str = "file_listing.json";

/// Lifecycle of one download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Starting,
    Downloading,
    Success,
    Error,
}

impl ProgressStatus {
    /// `Success` and `Error` end a job.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "downloading" => Some(Self::Downloading),
            "success" | "completed" | "complete" => Some(Self::Success),
            "error" | "failed" => Some(Self::Error),
            _ => None,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Where a finished download landed, attached to the success document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub file: PathBuf,
    pub platform: String,
    pub folder: String,
    pub filename: String,
}

/// A snapshot of one job's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub status: ProgressStatus,
    /// 0..=100; exactly 100 on success.
    pub percent: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Present iff `status` is `Error`.
    pub error: Option<String>,
    pub completion: Option<Completion>,
}

#[allow(clippy::cast_possible_truncation)]
fn percent_of(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            (u128::from(downloaded.min(total)) * 100 / u128::from(total)) as u8
        }
        _ => 0,
    }
}

impl ProgressRecord {
    #[must_use]
    pub const fn starting(total_bytes: Option<u64>) -> Self {
        Self {
            status: ProgressStatus::Starting,
            percent: 0,
            downloaded_bytes: 0,
            total_bytes,
            error: None,
            completion: None,
        }
    }

    #[must_use]
    pub fn downloading(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            status: ProgressStatus::Downloading,
            percent: percent_of(downloaded_bytes, total_bytes),
            downloaded_bytes,
            total_bytes,
            error: None,
            completion: None,
        }
    }

    #[must_use]
    pub const fn success(size: u64) -> Self {
        Self {
            status: ProgressStatus::Success,
            percent: 100,
            downloaded_bytes: size,
            total_bytes: Some(size),
            error: None,
            completion: None,
        }
    }

    pub fn failed(message: impl Into<String>, downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            status: ProgressStatus::Error,
            percent: percent_of(downloaded_bytes, total_bytes),
            downloaded_bytes,
            total_bytes,
            error: Some(message.into()),
            completion: None,
        }
    }

    #[must_use]
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Wire form of this record.
    #[must_use]
    pub fn to_document(&self) -> ProgressDocument {
        let mut doc = ProgressDocument {
            status: Some(self.status.as_str().to_string()),
            percent: Some(u32::from(self.percent)),
            ..ProgressDocument::default()
        };
        if self.status != ProgressStatus::Starting {
            doc.downloaded_mb = Some(to_mb(self.downloaded_bytes));
            doc.downloaded_bytes = Some(self.downloaded_bytes);
            doc.total_mb = self.total_bytes.map(to_mb);
            doc.total_bytes = self.total_bytes;
        }
        if self.status == ProgressStatus::Success {
            doc.size_mb = Some(to_mb(self.downloaded_bytes));
            if let Some(c) = &self.completion {
                doc.message = Some(format!("Downloaded {}", c.filename));
                doc.file = Some(c.file.display().to_string());
                doc.platform = Some(c.platform.clone());
                doc.folder = Some(c.folder.clone());
                doc.filename = Some(c.filename.clone());
            }
        }
        doc.error.clone_from(&self.error);
        doc
    }
}

/// The JSON document exchanged through the progress file.
///
/// Every field is optional so that documents from older or foreign writers
/// still decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ProgressDocument {
    /// Interprets the document. A bare `error` field with no status counts
    /// as an error; a document with neither is not a progress record.
    #[must_use]
    pub fn into_record(self) -> Option<ProgressRecord> {
        let status = match self.status.as_deref().and_then(ProgressStatus::parse) {
            Some(status) => status,
            None if self.error.is_some() => ProgressStatus::Error,
            None => return None,
        };
        let total_bytes = self.total_bytes.or_else(|| self.total_mb.map(from_mb));
        let downloaded_bytes = self
            .downloaded_bytes
            .or_else(|| self.downloaded_mb.or(self.size_mb).map(from_mb))
            .unwrap_or(0);
        #[allow(clippy::cast_possible_truncation)]
        let percent = match status {
            ProgressStatus::Success => 100,
            _ => self.percent.map_or_else(
                || percent_of(downloaded_bytes, total_bytes),
                |p| p.min(100) as u8,
            ),
        };
        let completion = match (self.file, self.filename) {
            (Some(file), Some(filename)) if status == ProgressStatus::Success => Some(Completion {
                file: PathBuf::from(file),
                platform: self.platform.unwrap_or_default(),
                folder: self.folder.unwrap_or_default(),
                filename,
            }),
            _ => None,
        };
        let error = match status {
            ProgressStatus::Error => Some(self.error.unwrap_or_else(|| "Unknown error".to_string())),
            _ => None,
        };
        Some(ProgressRecord {
            status,
            percent,
            downloaded_bytes,
            total_bytes,
            error,
            completion,
        })
    }
}

/// Reads the progress file at `path`.
///
/// Returns `Ok(None)` when no job has written yet or the content is not a
/// progress document.
///
/// # Errors
///
/// Returns [`Error::Filesystem`] if the file exists but cannot be read.
pub async fn read_progress(path: &Path) -> Result<Option<ProgressRecord>> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::filesystem(path, e)),
    };
    match serde_json::from_slice::<ProgressDocument>(&contents) {
        Ok(doc) => Ok(doc.into_record()),
        Err(e) => {
            log::debug!("Ignoring unparsable progress file {}: {e}", path.display());
            Ok(None)
        }
    }
}

/// Writer side of the progress file for one job at a time.
///
/// Once a terminal record is written, later records are dropped until
/// [`ProgressFile::begin`] starts the next job.
#[derive(Debug)]
pub struct ProgressFile {
    path: PathBuf,
    finished: bool,
}

impl ProgressFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            finished: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a new job by writing a `starting` record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Filesystem`] if the document cannot be written.
    pub async fn begin(&mut self) -> Result<()> {
        self.finished = false;
        self.write(&ProgressRecord::starting(None)).await.map(|_| ())
    }

    /// Publishes `record`. Returns `false` when it was dropped because the
    /// job already ended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Filesystem`] if the document cannot be written.
    pub async fn write(&mut self, record: &ProgressRecord) -> Result<bool> {
        if self.finished {
            log::debug!(
                "Dropping {:?} record after terminal status in {}",
                record.status,
                self.path.display()
            );
            return Ok(false);
        }
        let json = serde_json::to_vec(&record.to_document())?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| Error::filesystem(&self.path, e))?;
        self.finished = record.status.is_terminal();
        Ok(true)
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Forwards engine progress to a [`ProgressFile`] from a background writer.
///
/// The engine calls back synchronously; records are queued in order and the
/// writer task persists them. Drop the reporter and await the handle to
/// flush the terminal record.
pub struct ProgressFileReporter {
    tx: mpsc::UnboundedSender<ProgressRecord>,
    completion: Option<Completion>,
}

impl ProgressFileReporter {
    /// Spawns the writer task. `completion` decorates the success record.
    #[must_use]
    pub fn spawn(mut file: ProgressFile, completion: Option<Completion>) -> (Self, JoinHandle<ProgressFile>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressRecord>();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = file.write(&record).await {
                    log::warn!("Could not publish progress: {e}");
                }
            }
            file
        });
        (Self { tx, completion }, handle)
    }
}

impl DownloadProgress for ProgressFileReporter {
    fn on_record(&self, _name: &str, record: &ProgressRecord) {
        let record = match (&self.completion, record.status) {
            (Some(completion), ProgressStatus::Success) => {
                record.clone().with_completion(completion.clone())
            }
            _ => record.clone(),
        };
        let _ = self.tx.send(record);
    }

    fn on_file_complete(&self, name: &str, stats: &FileStats) {
        log::info!(
            "Downloaded {name}: {} in {}",
            crate::format::format_bytes(stats.size),
            crate::format::format_duration(stats.elapsed)
        );
    }
}

/// Follows a progress file until its job ends.
///
/// The polling interval starts at `interval` and doubles while the document
/// is unchanged, up to `max_interval`. Any change resets it.
#[derive(Debug, Clone)]
pub struct ProgressPoller {
    path: PathBuf,
    interval: Duration,
    max_interval: Duration,
    max_wait: Duration,
}

impl ProgressPoller {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(3600),
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Polls until a terminal record appears and returns it. `on_update` sees
    /// each distinct record observed along the way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires, [`Error::Timeout`]
    /// once `max_wait` elapses, or a read error from the progress file.
    pub async fn wait<F>(&self, cancel: &CancellationToken, mut on_update: F) -> Result<ProgressRecord>
    where
        F: FnMut(&ProgressRecord),
    {
        let started = Instant::now();
        let mut interval = self.interval;
        let mut last: Option<ProgressRecord> = None;

        loop {
            if let Some(record) = read_progress(&self.path).await? {
                if last.as_ref() == Some(&record) {
                    interval = (interval * 2).min(self.max_interval);
                } else {
                    on_update(&record);
                    interval = self.interval;
                    if record.status.is_terminal() {
                        return Ok(record);
                    }
                    last = Some(record);
                }
            } else {
                interval = (interval * 2).min(self.max_interval);
            }

            if started.elapsed() >= self.max_wait {
                return Err(Error::Timeout(format!(
                    "no terminal status in {} after {:?}",
                    self.path.display(),
                    self.max_wait
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// One file in the listing document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFile {
    pub name: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// The JSON document answering a listing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDocument {
    #[serde(default)]
    pub files: Vec<ListingFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const LISTING_LOADING: &str = "loading";
const LISTING_SUCCESS: &str = "success";

impl ListingDocument {
    /// Marker written while a listing request is in flight.
    #[must_use]
    pub fn loading(platform: &str) -> Self {
        Self {
            platform: Some(platform.to_string()),
            status: Some(LISTING_LOADING.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_listing(platform: &PlatformSource, listing: &Listing) -> Self {
        let github = matches!(
            platform.kind(),
            Ok(SourceKind::GithubTree { .. } | SourceKind::GithubBlob { .. })
        );
        let files: Vec<ListingFile> = listing
            .entries
            .iter()
            .map(|e| ListingFile {
                name: e.display_name.clone(),
                filename: e.reference.clone(),
                path: github.then(|| e.reference.clone()),
            })
            .collect();
        Self {
            count: Some(files.len()),
            files,
            platform: Some(platform.id.clone()),
            status: Some(LISTING_SUCCESS.to_string()),
            cached: Some(listing.is_cached()),
            error: None,
        }
    }

    /// An empty listing carrying `message`.
    pub fn failure(platform: &str, message: impl Into<String>) -> Self {
        Self {
            platform: Some(platform.to_string()),
            count: Some(0),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Writes the document atomically to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Filesystem`] if the document cannot be written.
    pub async fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        write_atomic(path, &json)
            .await
            .map_err(|e| Error::filesystem(path, e))
    }
}

/// State of the listing document as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingPoll {
    NotReady,
    Ready(ListingDocument),
    Failed(String),
}

/// Reads the listing document at `path`.
///
/// # Errors
///
/// Returns [`Error::Filesystem`] if the file exists but cannot be read.
pub async fn read_listing(path: &Path) -> Result<ListingPoll> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ListingPoll::NotReady),
        Err(e) => return Err(Error::filesystem(path, e)),
    };
    let Ok(doc) = serde_json::from_slice::<ListingDocument>(&contents) else {
        return Ok(ListingPoll::NotReady);
    };
    if let Some(error) = doc.error {
        return Ok(ListingPoll::Failed(error));
    }
    if doc.status.as_deref() == Some(LISTING_LOADING) {
        return Ok(ListingPoll::NotReady);
    }
    Ok(ListingPoll::Ready(doc))
}
