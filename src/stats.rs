//! Transfer statistics for a single file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics for a completed file download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    /// Bytes written to the destination.
    pub size: u64,
    /// Time taken to download the file.
    pub elapsed: Duration,
    /// Average download speed in bytes per second.
    pub average_speed: u64,
    /// Peak sampled download speed in bytes per second.
    pub peak_speed: u64,
}

/// Tracks speed while a download is running.
///
/// Fed from the progress sampler, so `record_total` always sees a
/// non-decreasing byte count.
pub struct DownloadStatsTracker {
    start_time: Instant,
    last_sample: std::sync::Mutex<(Instant, u64)>,
    peak_speed: AtomicU64,
}

impl Default for DownloadStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadStatsTracker {
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_sample: std::sync::Mutex::new((now, 0)),
            peak_speed: AtomicU64::new(0),
        }
    }

    /// Records the cumulative byte count and returns the speed since the
    /// previous sample in bytes per second.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn record_total(&self, total: u64) -> u64 {
        let now = Instant::now();
        let mut last = self
            .last_sample
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (then, previous) = *last;
        let secs = now.duration_since(then).as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        let speed = (total.saturating_sub(previous) as f64 / secs) as u64;
        *last = (now, total);
        self.peak_speed.fetch_max(speed, Ordering::Relaxed);
        speed
    }

    /// Returns the elapsed time since the download started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns the peak speed recorded.
    #[must_use]
    pub fn peak_speed(&self) -> u64 {
        self.peak_speed.load(Ordering::Relaxed)
    }

    /// Builds final statistics for a file of `size` bytes.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn finish(&self, size: u64) -> FileStats {
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        let average_speed = if secs > 0.0 {
            (size as f64 / secs) as u64
        } else {
            0
        };
        FileStats {
            size,
            elapsed,
            average_speed,
            peak_speed: self.peak_speed().max(average_speed),
        }
    }
}
