use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use wagerboard_types::LeaderboardResponse;

use crate::metrics::ProviderMetrics;
use crate::provider::{LeaderboardSource, ProviderError};

struct CachedEntry {
    data: Arc<LeaderboardResponse>,
    version: u64,
    fetched_at: Instant,
}

/// A leaderboard read from the cache.
#[derive(Clone, Debug)]
pub struct CachedLeaderboard {
    pub data: Arc<LeaderboardResponse>,
    /// Bumped on every successful provider fetch.
    pub version: u64,
    /// Set when the provider failed and an older copy was served instead.
    pub stale: bool,
}

/// TTL cache in front of a [LeaderboardSource].
///
/// At most one provider fetch is in flight at a time; callers that arrive
/// while a fetch is running wait for it and reuse its result.
pub struct LeaderboardCache {
    source: Arc<dyn LeaderboardSource>,
    ttl: Duration,
    current: RwLock<Option<CachedEntry>>,
    refresh: Mutex<()>,
    metrics: Arc<ProviderMetrics>,
}

impl LeaderboardCache {
    pub fn new(
        source: Arc<dyn LeaderboardSource>,
        ttl: Duration,
        metrics: Arc<ProviderMetrics>,
    ) -> Self {
        Self {
            source,
            ttl,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            metrics,
        }
    }

    /// Returns the cached leaderboard, fetching it first when missing or expired.
    pub async fn get(&self) -> Result<CachedLeaderboard, ProviderError> {
        if let Some(fresh) = self.fresh().await {
            return Ok(fresh);
        }
        let _flight = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(fresh) = self.fresh().await {
            return Ok(fresh);
        }
        self.fetch_locked(true).await
    }

    /// Fetches from the provider regardless of the TTL. When the provider
    /// fails, the last good copy is served with `stale` set.
    pub async fn refresh(&self) -> Result<CachedLeaderboard, ProviderError> {
        let _flight = self.refresh.lock().await;
        self.fetch_locked(true).await
    }

    /// Like [Self::refresh], but a provider failure is returned as an error
    /// instead of falling back to an older copy.
    pub async fn refresh_strict(&self) -> Result<CachedLeaderboard, ProviderError> {
        let _flight = self.refresh.lock().await;
        self.fetch_locked(false).await
    }

    /// Current contents without touching the provider.
    pub async fn peek(&self) -> Option<CachedLeaderboard> {
        self.current.read().await.as_ref().map(|entry| CachedLeaderboard {
            data: Arc::clone(&entry.data),
            version: entry.version,
            stale: entry.fetched_at.elapsed() >= self.ttl,
        })
    }

    async fn fresh(&self) -> Option<CachedLeaderboard> {
        self.peek().await.filter(|cached| !cached.stale)
    }

    async fn fetch_locked(&self, serve_stale: bool) -> Result<CachedLeaderboard, ProviderError> {
        let start = Instant::now();
        let result = self.source.fetch().await;
        self.metrics.record_fetch(start.elapsed());
        match result {
            Ok(data) => {
                let mut current = self.current.write().await;
                let version = current.as_ref().map_or(1, |entry| entry.version + 1);
                let data = Arc::new(data);
                *current = Some(CachedEntry {
                    data: Arc::clone(&data),
                    version,
                    fetched_at: Instant::now(),
                });
                tracing::debug!(version, "leaderboard cache refreshed");
                Ok(CachedLeaderboard {
                    data,
                    version,
                    stale: false,
                })
            }
            Err(err) => {
                self.metrics.inc_fetch_failure();
                if !serve_stale {
                    return Err(err);
                }
                let previous = self.current.read().await;
                match previous.as_ref() {
                    Some(entry) => {
                        self.metrics.inc_stale_served();
                        tracing::warn!(
                            version = entry.version,
                            "leaderboard fetch failed, serving stale copy: {err}"
                        );
                        Ok(CachedLeaderboard {
                            data: Arc::clone(&entry.data),
                            version: entry.version,
                            stale: true,
                        })
                    }
                    None => Err(err),
                }
            }
        }
    }
}
