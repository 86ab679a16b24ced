//! Cache-then-fetch listing orchestration.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::cache::ListingCache;
use crate::config::ListingConfig;
use crate::error::Result;
use crate::platform::PlatformSource;
use crate::source::{ListingEntry, fetch_listing};
use crate::transport::Transport;

/// Where a returned listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrigin {
    /// Fetched from the remote source just now.
    Remote,
    /// A cache record younger than the TTL.
    Cache,
    /// An expired cache record served because the remote fetch failed.
    StaleCache,
}

/// A platform listing plus provenance.
#[derive(Debug, Clone)]
pub struct Listing {
    pub platform_id: String,
    pub entries: Vec<ListingEntry>,
    pub origin: ListingOrigin,
    pub fetched_at: DateTime<Utc>,
    /// Remote error text when serving a stale fallback.
    pub warning: Option<String>,
}

impl Listing {
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.origin != ListingOrigin::Remote
    }
}

/// Produces listings for platforms, consulting the cache first.
///
/// Listing fetches for one platform must not run concurrently with each
/// other; callers serialise them.
pub struct Lister {
    transport: Arc<dyn Transport>,
    cache: ListingCache,
    config: ListingConfig,
}

impl Lister {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, cache: ListingCache, config: ListingConfig) -> Self {
        Self {
            transport,
            cache,
            config,
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &ListingCache {
        &self.cache
    }

    /// Returns a fresh cached listing or fetches one.
    ///
    /// # Errors
    ///
    /// Returns the remote error when the fetch fails and no cache record
    /// can stand in for it.
    pub async fn list(&self, platform: &PlatformSource) -> Result<Listing> {
        self.list_at(platform, Utc::now(), false).await
    }

    /// Fetches from the remote source regardless of cache age.
    ///
    /// # Errors
    ///
    /// Same as [`Lister::list`].
    pub async fn refresh(&self, platform: &PlatformSource) -> Result<Listing> {
        self.list_at(platform, Utc::now(), true).await
    }

    /// [`Lister::list`] evaluated at an explicit point in time.
    ///
    /// # Errors
    ///
    /// Same as [`Lister::list`].
    pub async fn list_at(
        &self,
        platform: &PlatformSource,
        now: DateTime<Utc>,
        force_refresh: bool,
    ) -> Result<Listing> {
        let cached = self.cache.get(&platform.id).await;

        if !force_refresh
            && let Some(record) = &cached
            && !record.is_expired(self.config.ttl, now)
        {
            log::info!("Loading {} from cache", platform.id);
            return Ok(Listing {
                platform_id: platform.id.clone(),
                entries: record.entries.clone(),
                origin: ListingOrigin::Cache,
                fetched_at: record.fetched_at,
                warning: None,
            });
        }

        log::info!("Fetching {} files from {}", platform.id, platform.source_url);
        match fetch_listing(self.transport.as_ref(), platform, &self.config).await {
            Ok(entries) => {
                log::info!("Found {} files for {}", entries.len(), platform.id);
                if let Err(e) = self.cache.put_at(&platform.id, &entries, now).await {
                    log::warn!("Could not cache listing for {}: {e}", platform.id);
                }
                Ok(Listing {
                    platform_id: platform.id.clone(),
                    entries,
                    origin: ListingOrigin::Remote,
                    fetched_at: now,
                    warning: None,
                })
            }
            Err(e) => match cached {
                Some(record) if self.config.allow_stale_fallback => {
                    log::warn!("Fetch failed for {}, serving stale cache: {e}", platform.id);
                    Ok(Listing {
                        platform_id: platform.id.clone(),
                        entries: record.entries,
                        origin: ListingOrigin::StaleCache,
                        fetched_at: record.fetched_at,
                        warning: Some(e.to_string()),
                    })
                }
                _ => {
                    log::error!("Failed to fetch files for {}: {e}", platform.id);
                    Err(e)
                }
            },
        }
    }
}
