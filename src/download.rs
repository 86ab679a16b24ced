//! Parallel chunked download engine.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{StreamExt, stream};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::fs::{FileSystem, TokioFileSystem, part_path};
use crate::progress::ProgressRecord;
use crate::stats::{DownloadStatsTracker, FileStats};
use crate::transport::{ByteRange, Probe, Transport};

/// Trait for receiving download progress updates.
///
/// For one download the engine reports a `starting` record first, then
/// `downloading` records whose byte count never decreases, and exactly one
/// terminal record last. All methods have default no-op implementations.
pub trait DownloadProgress: Send + Sync {
    /// Called on every state change and at a bounded rate while bytes flow.
    fn on_record(&self, _name: &str, _record: &ProgressRecord) {}

    /// Called after the terminal success record with transfer statistics.
    fn on_file_complete(&self, _name: &str, _stats: &FileStats) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl DownloadProgress for NoProgress {}

/// Lifecycle of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// A contiguous byte range of the remote file fetched by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    /// Inclusive; `None` means "until the body ends".
    pub end: Option<u64>,
    pub state: ChunkState,
    pub attempt_count: u32,
}

impl ChunkRange {
    const fn new(index: usize, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            start,
            end,
            state: ChunkState::Pending,
            attempt_count: 0,
        }
    }

    /// Number of bytes the chunk covers, if bounded.
    #[must_use]
    pub fn byte_len(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.start)
    }
}

/// Splits a file of `total` bytes into at most `parallelism` near-equal,
/// contiguous, non-overlapping chunks of at least `min_chunk_bytes` each.
///
/// Unknown or zero sizes yield a single unbounded chunk.
#[must_use]
pub fn plan_chunks(total: Option<u64>, parallelism: usize, min_chunk_bytes: u64) -> Vec<ChunkRange> {
    let total = match total {
        Some(total) if total > 0 => total,
        _ => return vec![ChunkRange::new(0, 0, None)],
    };
    let by_size = (total / min_chunk_bytes.max(1)).max(1);
    let count = (parallelism.max(1) as u64).min(by_size);
    let base = total / count;
    let remainder = total % count;

    let mut chunks = Vec::new();
    let mut start = 0;
    for index in 0..count {
        let len = base + u64::from(index < remainder);
        #[allow(clippy::cast_possible_truncation)]
        chunks.push(ChunkRange::new(index as usize, start, Some(start + len - 1)));
        start += len;
    }
    chunks
}

/// Result of a successful download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub chunks: Vec<ChunkRange>,
    pub stats: FileStats,
}

/// Shared per-download state handed to chunk workers.
struct Transfer<'a> {
    url: &'a str,
    part: &'a Path,
    accepts_ranges: bool,
    chunked: bool,
    received: &'a AtomicU64,
    cancel: &'a CancellationToken,
}

/// Publishes `downloading` records whenever the byte count reaches a new high.
struct Sampler<'a> {
    received: &'a AtomicU64,
    high_water: &'a AtomicU64,
    tracker: &'a DownloadStatsTracker,
    name: &'a str,
    progress: &'a Arc<dyn DownloadProgress>,
    total: Option<u64>,
}

impl Sampler<'_> {
    fn sample(&self) {
        let now = self.received.load(Ordering::Relaxed);
        let previous = self.high_water.fetch_max(now, Ordering::Relaxed);
        if now > previous {
            self.tracker.record_total(now);
            self.progress
                .on_record(self.name, &ProgressRecord::downloading(now, self.total));
        }
    }
}

/// Folds the per-chunk results of one pass.
///
/// The first real failure wins over the cancellations it caused in sibling
/// workers.
fn settle(results: Vec<Result<ChunkRange>>) -> Result<Vec<ChunkRange>> {
    let mut done = Vec::with_capacity(results.len());
    let mut cancelled = false;
    for result in results {
        match result {
            Ok(chunk) => done.push(chunk),
            Err(Error::Cancelled) => cancelled = true,
            Err(e) => return Err(e),
        }
    }
    if cancelled {
        return Err(Error::Cancelled);
    }
    done.sort_by_key(|c| c.index);
    Ok(done)
}

/// Downloads remote files to local paths using parallel range requests.
pub struct Downloader<F: FileSystem = TokioFileSystem> {
    transport: Arc<dyn Transport>,
    config: DownloadConfig,
    fs: F,
}

impl Downloader<TokioFileSystem> {
    /// Creates a new downloader with the default file system.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: DownloadConfig) -> Self {
        Self {
            transport,
            config,
            fs: TokioFileSystem,
        }
    }
}

impl<F: FileSystem> Downloader<F> {
    /// Creates a new downloader with a custom file system implementation.
    #[must_use]
    pub fn with_fs(transport: Arc<dyn Transport>, config: DownloadConfig, fs: F) -> Self {
        Self {
            transport,
            config,
            fs,
        }
    }

    /// Returns a reference to the download configuration.
    #[must_use]
    pub const fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Ensures the parent directory exists for a file path.
    async fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.fs
                .create_dir_all(parent)
                .await
                .map_err(|e| Error::filesystem(parent, e))?;
        }
        Ok(())
    }

    /// Sleeps for the backoff preceding `attempt`, returning early on cancel.
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        let delay = self.config.retry.delay_before(attempt);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<Probe> {
        let mut attempt = 1;
        loop {
            self.backoff(attempt, cancel).await?;
            match self.transport.probe(url).await {
                Ok(probe) => return Ok(probe),
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_attempts => {
                    log::warn!("Probe of {url} failed (attempt {attempt}): {e}");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Streams one attempt of `chunk` into the part file, counting bytes
    /// into `written`.
    async fn fetch_attempt(&self, t: &Transfer<'_>, chunk: &ChunkRange, written: &mut u64) -> Result<()> {
        let offset = chunk.start + *written;
        let range = (t.chunked || *written > 0).then_some(ByteRange {
            start: offset,
            end: chunk.end,
        });
        let mut body = self.transport.get_range(t.url, range).await?;

        let mut file = self
            .fs
            .open_write(t.part)
            .await
            .map_err(|e| Error::filesystem(t.part, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::filesystem(t.part, e))?;

        while let Some(piece) = body.next().await {
            let mut piece = piece?;
            if let Some(len) = chunk.byte_len() {
                let remaining = len.saturating_sub(*written);
                if remaining == 0 {
                    break;
                }
                #[allow(clippy::cast_possible_truncation)]
                piece.truncate(remaining.min(piece.len() as u64) as usize);
            }
            file.write_all(&piece)
                .await
                .map_err(|e| Error::filesystem(t.part, e))?;
            let n = piece.len() as u64;
            *written += n;
            t.received.fetch_add(n, Ordering::Relaxed);
        }
        file.flush().await.map_err(|e| Error::filesystem(t.part, e))?;

        match chunk.byte_len() {
            Some(len) if *written < len => Err(Error::SourceUnreachable {
                url: t.url.to_string(),
                reason: format!("body ended after {} of {len} bytes", *written),
            }),
            _ => Ok(()),
        }
    }

    /// Fetches one chunk, retrying transient failures within the retry budget.
    ///
    /// Retries resume after the bytes already written when the server honours
    /// ranges and restart the chunk otherwise.
    async fn fetch_chunk(&self, t: &Transfer<'_>, mut chunk: ChunkRange) -> Result<ChunkRange> {
        let mut written = 0u64;
        loop {
            let attempt = chunk.attempt_count + 1;
            self.backoff(attempt, t.cancel).await?;
            chunk.attempt_count = attempt;
            chunk.state = ChunkState::InFlight;

            if written > 0 && !t.accepts_ranges {
                t.received.fetch_sub(written, Ordering::Relaxed);
                written = 0;
            }

            match self.fetch_attempt(t, &chunk, &mut written).await {
                Ok(()) => {
                    chunk.state = ChunkState::Done;
                    log::debug!(
                        "Chunk {} of {} done after {attempt} attempt(s)",
                        chunk.index,
                        t.url
                    );
                    return Ok(chunk);
                }
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_attempts => {
                    log::warn!(
                        "Chunk {} of {} failed (attempt {attempt}), retrying: {e}",
                        chunk.index,
                        t.url
                    );
                }
                Err(e @ Error::RangeIgnored { .. }) => {
                    chunk.state = ChunkState::Failed;
                    log::debug!("Chunk {} of {}: {e}", chunk.index, t.url);
                    return Err(e);
                }
                Err(e) => {
                    chunk.state = ChunkState::Failed;
                    log::error!("Chunk {} of {} failed: {e}", chunk.index, t.url);
                    return Err(e);
                }
            }
        }
    }

    /// Runs every chunk of one pass and publishes progress while they run.
    ///
    /// A failing worker stops its siblings through `t.cancel`; they give up at
    /// their next attempt boundary.
    async fn fetch_chunks(
        &self,
        t: &Transfer<'_>,
        chunks: Vec<ChunkRange>,
        sampler: &Sampler<'_>,
    ) -> Result<Vec<ChunkRange>> {
        let workers = chunks.len();
        let fetch_all = stream::iter(chunks)
            .map(move |chunk| async move {
                let result = self.fetch_chunk(t, chunk).await;
                if result.is_err() {
                    t.cancel.cancel();
                }
                result
            })
            .buffer_unordered(workers)
            .collect::<Vec<_>>();
        tokio::pin!(fetch_all);

        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let results = loop {
            tokio::select! {
                results = &mut fetch_all => break results,
                _ = ticker.tick() => sampler.sample(),
            }
        };
        sampler.sample();
        settle(results)
    }

    /// Downloads `url` to `dest`.
    ///
    /// Bytes are written to `{dest}.part` and renamed into place only once
    /// every chunk has completed. `parallelism` overrides the configured
    /// worker count for this file.
    ///
    /// If the server advertised range support but then ignores an offset
    /// range, the part file is discarded and the file is fetched again as a
    /// single stream.
    ///
    /// Cancellation is checked before every attempt. Attempts already in
    /// flight run to completion, so a download whose last attempt finishes
    /// after `cancel` fires still succeeds.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, the last error of a chunk whose
    /// retry budget ran out, [`Error::Filesystem`] for local write failures,
    /// or [`Error::Cancelled`].
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        parallelism: Option<usize>,
        progress: &Arc<dyn DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let name = dest
            .file_name()
            .map_or_else(|| dest.display().to_string(), |n| n.to_string_lossy().into_owned());
        let part = part_path(dest);
        let received = AtomicU64::new(0);
        let high_water = AtomicU64::new(0);
        let tracker = DownloadStatsTracker::new();
        let mut total = None;

        progress.on_record(&name, &ProgressRecord::starting(None));

        let result = self
            .run(
                url,
                dest,
                &part,
                parallelism.unwrap_or(self.config.parallelism),
                &received,
                &high_water,
                &mut total,
                &tracker,
                &name,
                progress,
                cancel,
            )
            .await;

        match result {
            Ok(chunks) => {
                let size = received.load(Ordering::Relaxed);
                let stats = tracker.finish(size);
                log::info!("Downloaded {url} to {} ({size} bytes)", dest.display());
                progress.on_record(&name, &ProgressRecord::success(size));
                progress.on_file_complete(&name, &stats);
                Ok(DownloadOutcome {
                    path: dest.to_path_buf(),
                    total_bytes: size,
                    chunks,
                    stats,
                })
            }
            Err(e) => {
                if self.config.cleanup_on_error
                    && let Err(rm) = self.fs.remove_file(&part).await
                    && rm.kind() != std::io::ErrorKind::NotFound
                {
                    log::warn!("Could not remove {}: {rm}", part.display());
                }
                log::error!("Download of {url} failed: {e}");
                let downloaded = high_water.load(Ordering::Relaxed);
                progress.on_record(&name, &ProgressRecord::failed(e.to_string(), downloaded, total));
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        url: &str,
        dest: &Path,
        part: &Path,
        parallelism: usize,
        received: &AtomicU64,
        high_water: &AtomicU64,
        total: &mut Option<u64>,
        tracker: &DownloadStatsTracker,
        name: &str,
        progress: &Arc<dyn DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkRange>> {
        self.ensure_parent_dir(dest).await?;
        let probe = self.probe(url, cancel).await?;
        *total = probe.total_bytes;

        let workers = if probe.accepts_ranges { parallelism } else { 1 };
        let chunks = plan_chunks(probe.total_bytes, workers, self.config.min_chunk_bytes);
        let chunked = chunks.len() > 1;
        log::info!(
            "Downloading {url} ({} bytes, {} chunk(s), ranges: {})",
            probe.total_bytes.map_or_else(|| "unknown".to_string(), |t| t.to_string()),
            chunks.len(),
            probe.accepts_ranges
        );

        self.fs
            .create_file(part, probe.total_bytes.unwrap_or(0))
            .await
            .map_err(|e| Error::filesystem(part, e))?;
        progress.on_record(name, &ProgressRecord::downloading(0, probe.total_bytes));

        let sampler = Sampler {
            received,
            high_water,
            tracker,
            name,
            progress,
            total: probe.total_bytes,
        };
        let stop = cancel.child_token();
        let transfer = Transfer {
            url,
            part,
            accepts_ranges: probe.accepts_ranges,
            chunked,
            received,
            cancel: &stop,
        };

        let done = match self.fetch_chunks(&transfer, chunks, &sampler).await {
            Err(Error::RangeIgnored { .. }) if probe.accepts_ranges => {
                log::warn!("{url} ignored a range request, downloading it as a single stream");
                received.store(0, Ordering::Relaxed);
                self.fs
                    .create_file(part, probe.total_bytes.unwrap_or(0))
                    .await
                    .map_err(|e| Error::filesystem(part, e))?;
                let stop = cancel.child_token();
                let single = Transfer {
                    accepts_ranges: false,
                    chunked: false,
                    cancel: &stop,
                    ..transfer
                };
                let chunks = plan_chunks(probe.total_bytes, 1, self.config.min_chunk_bytes);
                self.fetch_chunks(&single, chunks, &sampler).await?
            }
            other => other?,
        };

        let size = received.load(Ordering::Relaxed);
        if let Some(expected) = probe.total_bytes
            && size != expected
        {
            return Err(Error::SourceUnreachable {
                url: url.to_string(),
                reason: format!("received {size} of {expected} bytes"),
            });
        }

        self.fs
            .rename_file(part, dest)
            .await
            .map_err(|e| Error::filesystem(dest, e))?;
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::progress::ProgressStatus;
    use crate::transport::{Failure, MemoryTransport};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const URL: &str = "https://example.com/roms/game.zip";

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn config() -> DownloadConfig {
        DownloadConfig::default()
            .with_min_chunk_bytes(1024)
            .with_progress_interval(Duration::from_millis(1))
    }

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<ProgressRecord>>,
    }

    impl DownloadProgress for Recorder {
        fn on_record(&self, _name: &str, record: &ProgressRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
    }

    fn no_progress() -> Arc<dyn DownloadProgress> {
        Arc::new(NoProgress)
    }

    #[test]
    fn plan_splits_evenly() {
        let chunks = plan_chunks(Some(10), 3, 1);
        let bounds: Vec<_> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(bounds, vec![(0, Some(3)), (4, Some(6)), (7, Some(9))]);
        assert!(chunks.iter().all(|c| c.state == ChunkState::Pending));
    }

    #[test]
    fn plan_respects_minimum_chunk_size() {
        assert_eq!(plan_chunks(Some(10 * 1024), 8, 5 * 1024).len(), 2);
        assert_eq!(plan_chunks(Some(100), 8, 5 * 1024).len(), 1);
        assert_eq!(plan_chunks(None, 8, 1), vec![ChunkRange::new(0, 0, None)]);
        assert_eq!(plan_chunks(Some(0), 8, 1), vec![ChunkRange::new(0, 0, None)]);
    }

    #[tokio::test]
    async fn parallel_and_serial_downloads_are_identical() {
        let dir = TempDir::new().unwrap();
        let data = body(100_000);
        let transport = Arc::new(MemoryTransport::new().with_file(URL, data.clone(), true));
        let downloader = Downloader::new(transport.clone(), config());
        let cancel = CancellationToken::new();

        let serial = dir.path().join("serial/game.zip");
        let parallel = dir.path().join("parallel/game.zip");
        downloader
            .download(URL, &serial, Some(1), &no_progress(), &cancel)
            .await
            .unwrap();
        let outcome = downloader
            .download(URL, &parallel, Some(8), &no_progress(), &cancel)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&serial).unwrap(), data);
        assert_eq!(std::fs::read(&parallel).unwrap(), data);
        assert_eq!(outcome.total_bytes, 100_000);
        assert_eq!(outcome.chunks.len(), 8);
        assert!(outcome.chunks.iter().all(|c| c.state == ChunkState::Done));
        assert!(!part_path(&parallel).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let dir = TempDir::new().unwrap();
        let data = body(4096);
        let transport = Arc::new(
            MemoryTransport::new()
                .with_file(URL, data.clone(), true)
                .fail_next(URL, Failure::Status(503))
                .fail_next(URL, Failure::Unreachable),
        );
        let downloader = Downloader::new(transport, config());
        let dest = dir.path().join("game.zip");

        let outcome = downloader
            .download(URL, &dest, Some(1), &no_progress(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.chunks[0].attempt_count, 3);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_chunk_resumes_from_last_byte() {
        let dir = TempDir::new().unwrap();
        let data = body(8192);
        let transport = Arc::new(
            MemoryTransport::new()
                .with_file(URL, data.clone(), true)
                .fail_next(URL, Failure::Reset),
        );
        let downloader = Downloader::new(transport.clone(), config());
        let dest = dir.path().join("game.zip");

        downloader
            .download(URL, &dest, Some(1), &no_progress(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        let ranges = transport.ranges_requested(URL);
        // probe, full request, resumed request
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[1], None);
        assert_eq!(ranges[2], Some(ByteRange { start: 4096, end: Some(8191) }));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_download_without_ranges_restarts() {
        let dir = TempDir::new().unwrap();
        let data = body(8192);
        let transport = Arc::new(
            MemoryTransport::new()
                .with_file(URL, data.clone(), false)
                .fail_next(URL, Failure::Reset),
        );
        let downloader = Downloader::new(transport.clone(), config());
        let dest = dir.path().join("game.zip");

        downloader
            .download(URL, &dest, Some(4), &no_progress(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(transport.ranges_requested(URL)[1..], [None, None]);
    }

    #[tokio::test]
    async fn not_found_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let downloader = Downloader::new(transport.clone(), config());
        let dest = dir.path().join("missing.zip");
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn DownloadProgress> = recorder.clone();

        let err = downloader
            .download(URL, &dest, None, &progress, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Status { status: 404, .. }));
        assert_eq!(transport.request_count(URL), 1);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        let records = recorder.records.lock().unwrap();
        assert_eq!(records.last().unwrap().status, ProgressStatus::Error);
        assert!(records.last().unwrap().error.as_deref().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn chunk_level_not_found_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(
            MemoryTransport::new()
                .with_file(URL, body(512), true)
                .fail_next(URL, Failure::Status(404)),
        );
        let dest = dir.path().join("game.zip");
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn DownloadProgress> = recorder.clone();

        let err = Downloader::new(transport.clone(), config())
            .download(URL, &dest, None, &progress, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Status { status: 404, .. }));
        // probe plus a single body request
        assert_eq!(transport.request_count(URL), 2);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        assert_eq!(
            recorder.records.lock().unwrap().last().unwrap().status,
            ProgressStatus::Error
        );
    }

    #[tokio::test]
    async fn ignored_ranges_fall_back_to_single_stream() {
        let dir = TempDir::new().unwrap();
        let data = body(64 * 1024);
        let transport = Arc::new(MemoryTransport::new().with_file_ignoring_ranges(URL, data.clone()));
        let dest = dir.path().join("game.zip");
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn DownloadProgress> = recorder.clone();

        let outcome = Downloader::new(transport, config())
            .download(URL, &dest, Some(4), &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.total_bytes, 64 * 1024);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!part_path(&dest).exists());
        let records = recorder.records.lock().unwrap();
        assert_eq!(records.last().unwrap().status, ProgressStatus::Success);
        for pair in records.windows(2) {
            assert!(pair[0].downloaded_bytes <= pair[1].downloaded_bytes);
        }
    }

    /// Cancels `token` as each body request goes out.
    struct CancelOnFetch {
        inner: MemoryTransport,
        token: CancellationToken,
    }

    #[async_trait::async_trait]
    impl Transport for CancelOnFetch {
        async fn get_text(&self, url: &str) -> Result<String> {
            self.inner.get_text(url).await
        }

        async fn probe(&self, url: &str) -> Result<Probe> {
            self.inner.probe(url).await
        }

        async fn get_range(
            &self,
            url: &str,
            range: Option<ByteRange>,
        ) -> Result<crate::transport::BodyStream> {
            self.token.cancel();
            self.inner.get_range(url, range).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_in_flight_at_cancel_completes() {
        let dir = TempDir::new().unwrap();
        let data = body(512);
        let cancel = CancellationToken::new();
        let transport = Arc::new(CancelOnFetch {
            inner: MemoryTransport::new().with_file(URL, data.clone(), true),
            token: cancel.clone(),
        });
        let dest = dir.path().join("game.zip");

        let outcome = Downloader::new(transport, config())
            .download(URL, &dest, None, &no_progress(), &cancel)
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(outcome.total_bytes, 512);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_before_next_attempt() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let transport = Arc::new(CancelOnFetch {
            inner: MemoryTransport::new()
                .with_file(URL, body(512), true)
                .fail_next(URL, Failure::Reset),
            token: cancel.clone(),
        });
        let dest = dir.path().join("game.zip");

        let err = Downloader::new(transport.clone(), config())
            .download(URL, &dest, None, &no_progress(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        // probe plus the interrupted attempt; no retry is sent
        assert_eq!(transport.inner.request_count(URL), 2);
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_and_respect_cleanup_setting() {
        let dir = TempDir::new().unwrap();
        let make = || {
            Arc::new(
                MemoryTransport::new()
                    .with_file(URL, body(2048), true)
                    .fail_next(URL, Failure::Status(503))
                    .fail_next(URL, Failure::Status(503))
                    .fail_next(URL, Failure::Status(503)),
            )
        };

        let dest = dir.path().join("a.zip");
        let err = Downloader::new(make(), config())
            .download(URL, &dest, Some(1), &no_progress(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status { status: 503, .. }));
        assert!(!part_path(&dest).exists());

        let dest = dir.path().join("b.zip");
        let keep = config()
            .with_cleanup_on_error(false)
            .with_retry(RetryPolicy::default());
        Downloader::new(make(), keep)
            .download(URL, &dest, Some(1), &no_progress(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(part_path(&dest).exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn progress_is_monotonic_with_one_terminal_record() {
        let dir = TempDir::new().unwrap();
        let data = body(300_000);
        let transport = Arc::new(MemoryTransport::new().with_file(URL, data, true));
        let downloader = Downloader::new(transport, config());
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn DownloadProgress> = recorder.clone();

        downloader
            .download(URL, &dir.path().join("game.zip"), Some(4), &progress, &CancellationToken::new())
            .await
            .unwrap();

        let records = recorder.records.lock().unwrap();
        assert_eq!(records.first().unwrap().status, ProgressStatus::Starting);
        let last = records.last().unwrap();
        assert_eq!(last.status, ProgressStatus::Success);
        assert_eq!(last.percent, 100);
        assert_eq!(last.downloaded_bytes, 300_000);
        assert_eq!(records.iter().filter(|r| r.status.is_terminal()).count(), 1);
        for pair in records.windows(2) {
            assert!(pair[0].downloaded_bytes <= pair[1].downloaded_bytes);
            assert!(pair[0].percent <= pair[1].percent);
        }
    }

    #[tokio::test]
    async fn unsized_body_downloads_in_one_chunk() {
        let dir = TempDir::new().unwrap();
        let data = body(50_000);
        let transport = Arc::new(MemoryTransport::new().with_unsized_file(URL, data.clone()));
        let dest = dir.path().join("game.zip");

        let outcome = Downloader::new(transport, config())
            .download(URL, &dest, Some(8), &no_progress(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.total_bytes, 50_000);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new().with_file(URL, body(4096), true));
        let dest = dir.path().join("game.zip");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn DownloadProgress> = recorder.clone();

        let err = Downloader::new(transport, config())
            .download(URL, &dest, None, &progress, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        assert_eq!(
            recorder.records.lock().unwrap().last().unwrap().status,
            ProgressStatus::Error
        );
    }

    #[tokio::test]
    async fn unwritable_destination_is_filesystem_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let transport = Arc::new(MemoryTransport::new().with_file(URL, body(10), true));

        let err = Downloader::new(transport.clone(), config())
            .download(URL, &blocker.join("game.zip"), None, &no_progress(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Filesystem { .. }));
        assert_eq!(transport.request_count(URL), 0);
    }

    /// Delegates to the real file system but refuses the final rename.
    struct NoRename;

    #[async_trait::async_trait]
    impl FileSystem for NoRename {
        async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
            TokioFileSystem.create_dir_all(path).await
        }

        async fn create_file(&self, path: &Path, size: u64) -> std::io::Result<()> {
            TokioFileSystem.create_file(path, size).await
        }

        async fn open_write(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
            TokioFileSystem.open_write(path).await
        }

        async fn rename_file(&self, _from: &Path, _to: &Path) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"))
        }

        async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
            TokioFileSystem.remove_file(path).await
        }
    }

    #[tokio::test]
    async fn failed_rename_removes_part_file() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new().with_file(URL, body(4096), true));
        let dest = dir.path().join("game.zip");

        let err = Downloader::with_fs(transport, config(), NoRename)
            .download(URL, &dest, None, &no_progress(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Filesystem { ref path, .. } if path == &dest));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chunks_are_contiguous_and_cover_the_file(
                total in 1u64..10_000_000,
                parallelism in 1usize..32,
                min_chunk in 1u64..100_000,
            ) {
                let chunks = plan_chunks(Some(total), parallelism, min_chunk);
                prop_assert!(!chunks.is_empty());
                prop_assert!(chunks.len() <= parallelism);
                prop_assert_eq!(chunks[0].start, 0);
                prop_assert_eq!(chunks.last().unwrap().end, Some(total - 1));
                for pair in chunks.windows(2) {
                    prop_assert_eq!(pair[0].end.unwrap() + 1, pair[1].start);
                }
                let sizes: Vec<u64> = chunks.iter().filter_map(ChunkRange::byte_len).collect();
                let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
                prop_assert!(max - min <= 1);
                if chunks.len() > 1 {
                    prop_assert!(*min >= min_chunk);
                }
            }
        }
    }
}
