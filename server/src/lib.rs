use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use wagerboard_types::LiveMessage;

fn parse_env_usize(var: &str) -> Option<usize> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

mod api;
pub use api::Api;

pub mod broadcaster;
pub mod cache;
mod config;
pub use config::ServerConfig;
mod fanout;
pub mod metrics;
pub mod provider;
pub mod scheduler;
pub mod snapshot;
pub mod store;

use broadcaster::Broadcaster;
use cache::{CachedLeaderboard, LeaderboardCache};
use fanout::Fanout;
use metrics::{
    HttpMetrics, HttpMetricsSnapshot, ProviderMetrics, ProviderMetricsSnapshot, SnapshotMetrics,
    SnapshotMetricsSnapshot, WsMetrics, WsMetricsSnapshot,
};
use provider::{LeaderboardSource, ProviderError};
use snapshot::SnapshotBuilder;
use store::RaceStore;

#[derive(Default)]
struct WsConnectionTracker {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WsConnectionRejection {
    GlobalLimit,
    PerIpLimit,
}

/// Holds one websocket slot; released on drop.
pub struct WsConnectionGuard {
    wagerboard: Arc<Wagerboard>,
    ip: IpAddr,
}

impl Drop for WsConnectionGuard {
    fn drop(&mut self) {
        self.wagerboard.release_ws_connection(self.ip);
    }
}

/// Shared server state: the leaderboard cache, race store, snapshot builder
/// and live update broadcaster, plus the metrics they report into.
pub struct Wagerboard {
    pub config: ServerConfig,
    cache: Arc<LeaderboardCache>,
    store: RaceStore,
    builder: SnapshotBuilder,
    broadcaster: Arc<Broadcaster>,
    fanout: Option<Arc<Fanout>>,
    ws_metrics: Arc<WsMetrics>,
    http_metrics: HttpMetrics,
    provider_metrics: Arc<ProviderMetrics>,
    snapshot_metrics: Arc<SnapshotMetrics>,
    ws_connections: Mutex<WsConnectionTracker>,
}

impl Wagerboard {
    pub fn new(config: ServerConfig, source: Arc<dyn LeaderboardSource>, store: RaceStore) -> Self {
        let ws_metrics = Arc::new(WsMetrics::default());
        let provider_metrics = Arc::new(ProviderMetrics::default());
        let snapshot_metrics = Arc::new(SnapshotMetrics::default());
        let cache = Arc::new(LeaderboardCache::new(
            source,
            config.cache_ttl(),
            Arc::clone(&provider_metrics),
        ));
        let builder = SnapshotBuilder::new(
            &config,
            Arc::clone(&cache),
            store.clone(),
            Arc::clone(&snapshot_metrics),
        );
        let broadcaster = Arc::new(Broadcaster::new(
            config.ws_outbound_capacity(),
            Arc::clone(&ws_metrics),
        ));
        let fanout = match config.fanout_redis_url.as_deref() {
            Some(url) => {
                let publish = config.fanout_publish.unwrap_or(true);
                let subscribe = config.fanout_subscribe.unwrap_or(true);
                if !publish && !subscribe {
                    tracing::warn!("Fanout disabled: publish and subscribe are false.");
                    None
                } else {
                    let origin = config.fanout_origin.clone();
                    match Fanout::new(url, config.fanout_channel(), origin, publish, subscribe) {
                        Ok(fanout) => Some(Arc::new(fanout)),
                        Err(err) => {
                            tracing::warn!("Fanout disabled: {err}");
                            None
                        }
                    }
                }
            }
            None => None,
        };

        Self {
            config,
            cache,
            store,
            builder,
            broadcaster,
            fanout,
            ws_metrics,
            http_metrics: HttpMetrics::default(),
            provider_metrics,
            snapshot_metrics,
            ws_connections: Mutex::new(WsConnectionTracker::default()),
        }
    }

    /// Starts relaying updates from other instances, when fanout is configured.
    pub fn start_fanout(&self) {
        if let Some(fanout) = &self.fanout {
            tracing::info!(
                channel = fanout.channel(),
                origin = fanout.origin(),
                "Fanout enabled"
            );
            fanout.start(Arc::clone(&self.broadcaster));
        }
    }

    pub fn cache(&self) -> &LeaderboardCache {
        &self.cache
    }

    pub fn store(&self) -> &RaceStore {
        &self.store
    }

    pub fn builder(&self) -> &SnapshotBuilder {
        &self.builder
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Cached leaderboard, fetching it when the cached copy has expired.
    pub async fn leaderboard(&self) -> Result<CachedLeaderboard, ProviderError> {
        self.cache.get().await
    }

    /// Delivers a live message to local subscribers and, when configured,
    /// to the other instances. Returns the number of local deliveries.
    pub async fn publish(&self, message: &LiveMessage) -> usize {
        let delivered = match self.broadcaster.publish(message) {
            Ok(delivered) => delivered,
            Err(err) => {
                tracing::warn!("Failed to encode live message: {err}");
                return 0;
            }
        };
        if let Some(fanout) = &self.fanout {
            fanout.publish(message).await;
        }
        delivered
    }

    pub(crate) fn ws_metrics(&self) -> &WsMetrics {
        &self.ws_metrics
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub(crate) fn snapshot_metrics(&self) -> &SnapshotMetrics {
        &self.snapshot_metrics
    }

    pub fn ws_metrics_snapshot(&self) -> WsMetricsSnapshot {
        self.ws_metrics.snapshot()
    }

    pub fn http_metrics_snapshot(&self) -> HttpMetricsSnapshot {
        self.http_metrics.snapshot()
    }

    pub fn provider_metrics_snapshot(&self) -> ProviderMetricsSnapshot {
        self.provider_metrics.snapshot()
    }

    pub fn snapshot_metrics_snapshot(&self) -> SnapshotMetricsSnapshot {
        self.snapshot_metrics.snapshot()
    }

    pub(crate) fn try_acquire_ws_connection(
        self: &Arc<Self>,
        ip: IpAddr,
    ) -> Result<WsConnectionGuard, WsConnectionRejection> {
        // Environment variables override config
        let max_total =
            parse_env_usize("RATE_LIMIT_WS_CONNECTIONS").or(self.config.ws_max_connections);
        let max_per_ip = parse_env_usize("RATE_LIMIT_WS_CONNECTIONS_PER_IP")
            .or(self.config.ws_max_connections_per_ip);
        let mut tracker = self.lock_ws_connections();

        if let Some(limit) = max_total {
            if tracker.total >= limit {
                self.ws_metrics.inc_connection_reject_global();
                return Err(WsConnectionRejection::GlobalLimit);
            }
        }

        let current_ip = tracker.per_ip.get(&ip).copied().unwrap_or(0);
        if let Some(limit) = max_per_ip {
            if current_ip >= limit {
                self.ws_metrics.inc_connection_reject_per_ip();
                return Err(WsConnectionRejection::PerIpLimit);
            }
        }

        tracker.total = tracker.total.saturating_add(1);
        tracker.per_ip.insert(ip, current_ip.saturating_add(1));
        Ok(WsConnectionGuard {
            wagerboard: Arc::clone(self),
            ip,
        })
    }

    fn release_ws_connection(&self, ip: IpAddr) {
        let mut tracker = self.lock_ws_connections();
        tracker.total = tracker.total.saturating_sub(1);
        match tracker.per_ip.get_mut(&ip) {
            Some(count) if *count > 1 => {
                *count -= 1;
            }
            Some(_) => {
                tracker.per_ip.remove(&ip);
            }
            None => {}
        }
    }

    fn lock_ws_connections(&self) -> MutexGuard<'_, WsConnectionTracker> {
        match self.ws_connections.lock() {
            Ok(tracker) => tracker,
            Err(poisoned) => {
                tracing::warn!("WebSocket connection tracker lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{wagerboard, StaticSource};
    use super::*;

    #[tokio::test]
    async fn test_ws_connection_per_ip_limit() {
        let config = ServerConfig {
            ws_max_connections_per_ip: Some(2),
            ws_max_connections: Some(100),
            ..Default::default()
        };
        let wagerboard = wagerboard(config, StaticSource::new(None)).await;
        let ip: IpAddr = "192.168.1.1".parse().unwrap();

        let guard1 = wagerboard.try_acquire_ws_connection(ip);
        assert!(guard1.is_ok());
        let guard2 = wagerboard.try_acquire_ws_connection(ip);
        assert!(guard2.is_ok());
        assert_eq!(
            wagerboard.try_acquire_ws_connection(ip).err(),
            Some(WsConnectionRejection::PerIpLimit)
        );

        let other_ip: IpAddr = "192.168.1.2".parse().unwrap();
        assert!(wagerboard.try_acquire_ws_connection(other_ip).is_ok());

        drop(guard1);
        assert!(wagerboard.try_acquire_ws_connection(ip).is_ok());
        assert_eq!(wagerboard.ws_metrics_snapshot().connection_reject_per_ip, 1);
    }

    #[tokio::test]
    async fn test_ws_connection_global_limit() {
        let config = ServerConfig {
            ws_max_connections_per_ip: Some(10),
            ws_max_connections: Some(2),
            ..Default::default()
        };
        let wagerboard = wagerboard(config, StaticSource::new(None)).await;
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();
        let ip3: IpAddr = "10.0.0.3".parse().unwrap();

        let guard1 = wagerboard.try_acquire_ws_connection(ip1);
        assert!(guard1.is_ok());
        let _guard2 = wagerboard.try_acquire_ws_connection(ip2).unwrap();
        assert_eq!(
            wagerboard.try_acquire_ws_connection(ip3).err(),
            Some(WsConnectionRejection::GlobalLimit)
        );

        drop(guard1);
        assert!(wagerboard.try_acquire_ws_connection(ip3).is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_fanout_delivers_locally() {
        let wagerboard = wagerboard(ServerConfig::default(), StaticSource::new(None)).await;
        let (mut connection, mut rx) = wagerboard
            .broadcaster()
            .connect(wagerboard_types::Topic::Leaderboard);
        assert!(connection.open());

        let message = LiveMessage::LeaderboardUpdate {
            data: Box::default(),
        };
        assert_eq!(wagerboard.publish(&message).await, 1);
        assert!(rx.try_recv().is_ok());
    }
}
