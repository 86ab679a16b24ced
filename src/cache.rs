//! Time-bounded persistence of normalised listings, one record per platform.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fs::write_atomic;
use crate::source::ListingEntry;

/// A stored listing and when it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub platform_id: String,
    pub entries: Vec<ListingEntry>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheRecord {
    /// Age of the record at `now`; records from the future have age zero.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// A record is expired once its age strictly exceeds `ttl`.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > ttl
    }
}

/// Listing cache rooted at a directory on the local filesystem.
///
/// Keys are platform identifiers, not URLs. Staleness is the caller's call:
/// [`ListingCache::get`] returns whatever is stored.
#[derive(Debug, Clone)]
pub struct ListingCache {
    dir: PathBuf,
}

impl ListingCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `platform_id`.
    #[must_use]
    pub fn record_path(&self, platform_id: &str) -> PathBuf {
        let safe: String = platform_id
            .chars()
            .map(|c| if c == ' ' || c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Returns the stored record, or `None` when it is absent or unreadable.
    pub async fn get(&self, platform_id: &str) -> Option<CacheRecord> {
        let path = self.record_path(platform_id);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Ignoring unreadable cache record {}: {e}", path.display());
                return None;
            }
        };

        match serde_json::from_slice::<CacheRecord>(&contents) {
            Ok(record) if record.platform_id == platform_id => Some(record),
            Ok(record) => {
                log::warn!(
                    "Cache record {} belongs to {}, ignoring",
                    path.display(),
                    record.platform_id
                );
                None
            }
            Err(e) => {
                log::warn!("Ignoring corrupt cache record {}: {e}", path.display());
                None
            }
        }
    }

    /// Stores `entries` for `platform_id`, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub async fn put(&self, platform_id: &str, entries: &[ListingEntry]) -> Result<CacheRecord> {
        self.put_at(platform_id, entries, Utc::now()).await
    }

    /// Stores `entries` for `platform_id` with an explicit fetch time.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub async fn put_at(
        &self,
        platform_id: &str,
        entries: &[ListingEntry],
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheRecord> {
        let record = CacheRecord {
            platform_id: platform_id.to_string(),
            entries: entries.to_vec(),
            fetched_at,
        };
        let json = serde_json::to_vec(&record)?;
        write_atomic(&self.record_path(platform_id), &json).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn entries() -> Vec<ListingEntry> {
        vec![
            ListingEntry::new("romnix", "pico-8/romnix.p8.png"),
            ListingEntry::new("celeste", "pico-8/celeste.p8.png"),
        ]
    }

    #[tokio::test]
    async fn put_then_get_round_trips_with_zero_age() {
        let dir = TempDir::new().unwrap();
        let cache = ListingCache::new(dir.path());

        cache.put("pico-8", &entries()).await.unwrap();
        let record = cache.get("pico-8").await.unwrap();

        assert_eq!(record.entries, entries());
        assert!(record.age(Utc::now()) < Duration::from_secs(5));
        assert!(!record.is_expired(Duration::from_secs(3600), Utc::now()));
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = ListingCache::new(dir.path().join("never-created"));
        assert!(cache.get("pico-8").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_record_is_treated_as_missing() {
        let dir = TempDir::new().unwrap();
        let cache = ListingCache::new(dir.path());
        std::fs::write(cache.record_path("pico-8"), b"{\"platform_id\": \"pico-8\", \"entr").unwrap();

        assert!(cache.get("pico-8").await.is_none());

        // The next successful refresh heals the record.
        cache.put("pico-8", &entries()).await.unwrap();
        assert!(cache.get("pico-8").await.is_some());
    }

    #[tokio::test]
    async fn records_are_keyed_by_platform() {
        let dir = TempDir::new().unwrap();
        let cache = ListingCache::new(dir.path());
        cache.put("pico-8", &entries()).await.unwrap();

        assert!(cache.get("gameboy").await.is_none());
        assert_eq!(
            cache.record_path("Game Boy/Color"),
            dir.path().join("Game_Boy_Color.json")
        );
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let t0 = Utc::now();
        let record = CacheRecord {
            platform_id: "pico-8".to_string(),
            entries: vec![],
            fetched_at: t0,
        };
        let ttl = Duration::from_secs(3600);

        assert!(!record.is_expired(ttl, t0 + TimeDelta::seconds(3599)));
        assert!(!record.is_expired(ttl, t0 + TimeDelta::seconds(3600)));
        assert!(record.is_expired(ttl, t0 + TimeDelta::seconds(3601)));
        assert_eq!(record.age(t0 - TimeDelta::seconds(10)), Duration::ZERO);
    }
}
