//! Sequential batch downloads with aggregate status.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::BulkConfig;
use crate::error::{Error, Result};
use crate::fs::write_atomic;
use crate::source::ListingEntry;

/// Aggregate batch status document.
pub const BULK_STATUS_FILE: &str = "bulk_status.json";
/// Directory holding one result document per finished item.
pub const BULK_ITEMS_DIR: &str = "bulk_items";

/// Downloads a single batch item to completion.
#[async_trait]
pub trait ItemDownloader: Send + Sync {
    /// Returns the local path of the downloaded file.
    async fn download_item(&self, platform_id: &str, entry: &ListingEntry) -> Result<PathBuf>;
}

/// Receives a batch snapshot after every transition.
pub trait BulkProgress: Send + Sync {
    fn on_batch(&self, _batch: &BulkBatch) {}

    fn on_item(&self, _batch: &BulkBatch, _result: &ItemResult) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBulkProgress;

impl BulkProgress for NoBulkProgress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkState {
    NotStarted,
    Running,
    Completed,
    Cancelled,
}

/// Progress of one batch.
///
/// `index` is the 1-based position of the item in flight (0 before the
/// first item starts) and never decreases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkBatch {
    pub items: Vec<ListingEntry>,
    pub index: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub state: BulkState,
}

impl BulkBatch {
    #[must_use]
    pub const fn new(items: Vec<ListingEntry>) -> Self {
        Self {
            items,
            index: 0,
            success_count: 0,
            failed_count: 0,
            state: BulkState::NotStarted,
        }
    }

    /// The entry currently in flight, if any.
    #[must_use]
    pub fn current(&self) -> Option<&ListingEntry> {
        self.index.checked_sub(1).and_then(|i| self.items.get(i))
    }

    #[must_use]
    pub const fn finished_count(&self) -> usize {
        self.success_count + self.failed_count
    }

    /// Wire form of the batch.
    #[must_use]
    pub fn to_status(&self) -> BulkStatus {
        BulkStatus {
            state: self.state,
            index: self.index,
            total: self.items.len(),
            success_count: self.success_count,
            failed_count: self.failed_count,
            current: self.current().map(|e| e.display_name.clone()),
        }
    }
}

/// The JSON document describing a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkStatus {
    pub state: BulkState,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Error,
}

/// Outcome of one batch item, written as its own document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub status: ItemStatus,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Path of the result document for the 1-based item `index`.
#[must_use]
pub fn item_result_path(ipc_dir: &Path, index: usize) -> PathBuf {
    ipc_dir.join(BULK_ITEMS_DIR).join(format!("item_{index}.json"))
}

/// Reads and deletes the result document for item `index`.
///
/// Returns `Ok(None)` while the item has not finished.
///
/// # Errors
///
/// Returns [`Error::Filesystem`] if the document exists but cannot be read
/// or removed, or [`Error::Json`] if it does not decode.
pub async fn take_item_result(ipc_dir: &Path, index: usize) -> Result<Option<ItemResult>> {
    let path = item_result_path(ipc_dir, index);
    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::filesystem(path, e)),
    };
    let result = serde_json::from_slice(&contents)?;
    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| Error::filesystem(&path, e))?;
    Ok(Some(result))
}

/// Reads the batch status document in `ipc_dir`, if any.
///
/// # Errors
///
/// Returns [`Error::Filesystem`] if the file exists but cannot be read.
pub async fn read_status(ipc_dir: &Path) -> Result<Option<BulkStatus>> {
    let path = ipc_dir.join(BULK_STATUS_FILE);
    match tokio::fs::read(&path).await {
        Ok(contents) => Ok(serde_json::from_slice(&contents).ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::filesystem(path, e)),
    }
}

/// Runs batches one item at a time.
#[derive(Debug, Clone)]
pub struct BulkOrchestrator {
    config: BulkConfig,
    ipc_dir: Option<PathBuf>,
}

impl BulkOrchestrator {
    #[must_use]
    pub const fn new(config: BulkConfig) -> Self {
        Self {
            config,
            ipc_dir: None,
        }
    }

    /// Publishes the status and item documents under `dir`.
    #[must_use]
    pub fn with_ipc_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ipc_dir = Some(dir.into());
        self
    }

    async fn publish(&self, batch: &BulkBatch, progress: &dyn BulkProgress) {
        progress.on_batch(batch);
        let Some(dir) = &self.ipc_dir else { return };
        let path = dir.join(BULK_STATUS_FILE);
        let written = match serde_json::to_vec(&batch.to_status()) {
            Ok(json) => write_atomic(&path, &json).await.map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            log::warn!("Could not publish bulk status to {}: {e}", path.display());
        }
    }

    async fn publish_item(&self, result: &ItemResult) {
        let Some(dir) = &self.ipc_dir else { return };
        let path = item_result_path(dir, result.index);
        let written = match serde_json::to_vec(result) {
            Ok(json) => write_atomic(&path, &json).await.map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            log::warn!("Could not publish item result to {}: {e}", path.display());
        }
    }

    /// Downloads `items` of `platform_id` in order.
    ///
    /// Item failures are counted and the batch moves on. Cancellation is
    /// checked before each item and during the pacing delay; the item in
    /// flight always runs to its own end.
    pub async fn run(
        &self,
        downloader: &dyn ItemDownloader,
        platform_id: &str,
        items: Vec<ListingEntry>,
        progress: &dyn BulkProgress,
        cancel: &CancellationToken,
    ) -> BulkBatch {
        let mut batch = BulkBatch::new(items);
        let total = batch.items.len();
        batch.state = BulkState::Running;
        log::info!("Starting bulk download of {total} file(s) for {platform_id}");
        self.publish(&batch, progress).await;

        for position in 0..total {
            if position > 0 && !self.config.pacing_delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(self.config.pacing_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                log::info!("Bulk download cancelled after {} of {total}", batch.finished_count());
                batch.state = BulkState::Cancelled;
                self.publish(&batch, progress).await;
                return batch;
            }

            batch.index = position + 1;
            self.publish(&batch, progress).await;

            let entry = batch.items[position].clone();
            log::info!("[{}/{total}] {}", batch.index, entry.display_name);
            let result = match downloader.download_item(platform_id, &entry).await {
                Ok(path) => {
                    batch.success_count += 1;
                    ItemResult {
                        status: ItemStatus::Success,
                        index: batch.index,
                        name: entry.display_name.clone(),
                        file: Some(path.display().to_string()),
                        error: None,
                    }
                }
                Err(e) => {
                    log::warn!("Bulk item {} failed: {e}", entry.display_name);
                    batch.failed_count += 1;
                    ItemResult {
                        status: ItemStatus::Error,
                        index: batch.index,
                        name: entry.display_name.clone(),
                        file: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            self.publish_item(&result).await;
            progress.on_item(&batch, &result);
        }

        batch.state = BulkState::Completed;
        log::info!(
            "Bulk download finished: {} succeeded, {} failed",
            batch.success_count,
            batch.failed_count
        );
        self.publish(&batch, progress).await;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fails the items whose display names are listed.
    struct Scripted {
        failing: HashSet<String>,
        seen: Mutex<Vec<String>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl Scripted {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(ToString::to_string).collect(),
                seen: Mutex::new(Vec::new()),
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl ItemDownloader for Scripted {
        async fn download_item(&self, _platform_id: &str, entry: &ListingEntry) -> Result<PathBuf> {
            let count = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(entry.display_name.clone());
                seen.len()
            };
            if let Some((after, token)) = &self.cancel_after
                && count == *after
            {
                token.cancel();
            }
            if self.failing.contains(&entry.display_name) {
                Err(Error::Status {
                    url: entry.reference.clone(),
                    status: 404,
                })
            } else {
                Ok(PathBuf::from(&entry.reference))
            }
        }
    }

    #[derive(Default)]
    struct Snapshots(Mutex<Vec<BulkBatch>>);

    impl BulkProgress for Snapshots {
        fn on_batch(&self, batch: &BulkBatch) {
            self.0.lock().unwrap().push(batch.clone());
        }
    }

    fn items(names: &[&str]) -> Vec<ListingEntry> {
        names
            .iter()
            .map(|n| ListingEntry::new(*n, format!("{n}.zip")))
            .collect()
    }

    fn orchestrator() -> BulkOrchestrator {
        BulkOrchestrator::new(BulkConfig {
            pacing_delay: Duration::from_millis(500),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn batch_counts_every_item_and_survives_failures() {
        let downloader = Scripted::new(&["b", "d"]);
        let snapshots = Snapshots::default();

        let batch = orchestrator()
            .run(
                &downloader,
                "gb",
                items(&["a", "b", "c", "d", "e"]),
                &snapshots,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.state, BulkState::Completed);
        assert_eq!(batch.index, 5);
        assert_eq!(batch.success_count, 3);
        assert_eq!(batch.failed_count, 2);
        assert_eq!(batch.finished_count(), 5);
        assert_eq!(downloader.seen.lock().unwrap().len(), 5);

        let snapshots = snapshots.0.lock().unwrap();
        for pair in snapshots.windows(2) {
            assert!(pair[0].index <= pair[1].index);
        }
        for snap in snapshots.iter() {
            assert!(snap.index <= snap.items.len() + 1);
            assert!(snap.finished_count() <= snap.index);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_next_item() {
        let cancel = CancellationToken::new();
        let mut downloader = Scripted::new(&[]);
        downloader.cancel_after = Some((2, cancel.clone()));

        let batch = orchestrator()
            .run(&downloader, "gb", items(&["a", "b", "c", "d"]), &NoBulkProgress, &cancel)
            .await;

        // The item in flight when cancel fired still completes.
        assert_eq!(batch.state, BulkState::Cancelled);
        assert_eq!(batch.success_count, 2);
        assert_eq!(batch.index, 2);
        assert_eq!(*downloader.seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let batch = orchestrator()
            .run(&Scripted::new(&[]), "gb", Vec::new(), &NoBulkProgress, &CancellationToken::new())
            .await;
        assert_eq!(batch.state, BulkState::Completed);
        assert_eq!(batch.index, 0);
        assert!(batch.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn status_and_item_documents_are_published() {
        let dir = TempDir::new().unwrap();
        let bulk = orchestrator().with_ipc_dir(dir.path());

        bulk.run(
            &Scripted::new(&["b"]),
            "gb",
            items(&["a", "b"]),
            &NoBulkProgress,
            &CancellationToken::new(),
        )
        .await;

        let status = read_status(dir.path()).await.unwrap().unwrap();
        assert_eq!(status.state, BulkState::Completed);
        assert_eq!(status.total, 2);
        assert_eq!(status.index, 2);
        assert_eq!(status.success_count, 1);
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.current.as_deref(), Some("b"));

        let first = take_item_result(dir.path(), 1).await.unwrap().unwrap();
        assert_eq!(first.status, ItemStatus::Success);
        assert_eq!(first.file.as_deref(), Some("a.zip"));
        let second = take_item_result(dir.path(), 2).await.unwrap().unwrap();
        assert_eq!(second.status, ItemStatus::Error);
        assert!(second.error.unwrap().contains("404"));

        // Consumed on read.
        assert!(take_item_result(dir.path(), 1).await.unwrap().is_none());
        assert!(!item_result_path(dir.path(), 2).exists());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn completed_batch_accounts_for_every_item(outcomes in proptest::collection::vec(any::<bool>(), 0..20)) {
                let names: Vec<String> = (0..outcomes.len()).map(|i| format!("item{i}")).collect();
                let failing: Vec<&str> = names
                    .iter()
                    .zip(&outcomes)
                    .filter(|(_, ok)| !**ok)
                    .map(|(n, _)| n.as_str())
                    .collect();
                let downloader = Scripted::new(&failing);
                let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
                let bulk = BulkOrchestrator::new(BulkConfig { pacing_delay: Duration::ZERO });

                let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
                let batch = runtime.block_on(bulk.run(
                    &downloader,
                    "gb",
                    items(&name_refs),
                    &NoBulkProgress,
                    &CancellationToken::new(),
                ));

                prop_assert_eq!(batch.state, BulkState::Completed);
                prop_assert_eq!(batch.index, outcomes.len());
                prop_assert_eq!(batch.success_count + batch.failed_count, outcomes.len());
                prop_assert_eq!(batch.failed_count, failing.len());
            }
        }
    }
}
