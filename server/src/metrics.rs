use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => {
                self.buckets[idx].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

fn saturating_dec(value: &AtomicU64) {
    let mut current = value.load(Ordering::Relaxed);
    while current > 0 {
        match value.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

#[derive(Default)]
pub struct WsMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU64,
    messages_delivered: AtomicU64,
    queue_full: AtomicU64,
    send_errors: AtomicU64,
    send_timeouts: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    connection_reject_global: AtomicU64,
    connection_reject_per_ip: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct WsMetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub messages_delivered: u64,
    pub queue_full: u64,
    pub send_errors: u64,
    pub send_timeouts: u64,
    pub heartbeat_timeouts: u64,
    pub connection_reject_global: u64,
    pub connection_reject_per_ip: u64,
}

impl WsMetrics {
    pub fn snapshot(&self) -> WsMetricsSnapshot {
        WsMetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            connection_reject_global: self.connection_reject_global.load(Ordering::Relaxed),
            connection_reject_per_ip: self.connection_reject_per_ip.load(Ordering::Relaxed),
        }
    }

    pub fn inc_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        saturating_dec(&self.active_connections);
    }

    pub fn add_delivered(&self, count: u64) {
        self.messages_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_send_timeout(&self) {
        self.send_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_reject_global(&self) {
        self.connection_reject_global.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_reject_per_ip(&self) {
        self.connection_reject_per_ip.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub current_race: LatencySnapshot,
    pub previous_race: LatencySnapshot,
    pub race_position: LatencySnapshot,
    pub affiliate_stats: LatencySnapshot,
    pub reject_origin: u64,
    pub not_found: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    current_race: LatencyMetrics,
    previous_race: LatencyMetrics,
    race_position: LatencyMetrics,
    affiliate_stats: LatencyMetrics,
    reject_origin: AtomicU64,
    not_found: AtomicU64,
}

impl HttpMetrics {
    pub fn record_current_race(&self, duration: Duration) {
        self.current_race.record(duration);
    }

    pub fn record_previous_race(&self, duration: Duration) {
        self.previous_race.record(duration);
    }

    pub fn record_race_position(&self, duration: Duration) {
        self.race_position.record(duration);
    }

    pub fn record_affiliate_stats(&self, duration: Duration) {
        self.affiliate_stats.record(duration);
    }

    pub fn inc_reject_origin(&self) {
        self.reject_origin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            current_race: self.current_race.snapshot(),
            previous_race: self.previous_race.snapshot(),
            race_position: self.race_position.snapshot(),
            affiliate_stats: self.affiliate_stats.snapshot(),
            reject_origin: self.reject_origin.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProviderMetricsSnapshot {
    pub fetch: LatencySnapshot,
    pub fetch_failures: u64,
    pub stale_served: u64,
}

#[derive(Default)]
pub struct ProviderMetrics {
    fetch: LatencyMetrics,
    fetch_failures: AtomicU64,
    stale_served: AtomicU64,
}

impl ProviderMetrics {
    pub fn record_fetch(&self, duration: Duration) {
        self.fetch.record(duration);
    }

    pub fn inc_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProviderMetricsSnapshot {
        ProviderMetricsSnapshot {
            fetch: self.fetch.snapshot(),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotMetricsSnapshot {
    pub build: LatencySnapshot,
    pub races_created: u64,
    pub races_existing: u64,
    pub build_failures: u64,
    pub status_transitions: u64,
    pub leaderboard_publishes: u64,
    pub race_publishes: u64,
}

#[derive(Default)]
pub struct SnapshotMetrics {
    build: LatencyMetrics,
    races_created: AtomicU64,
    races_existing: AtomicU64,
    build_failures: AtomicU64,
    status_transitions: AtomicU64,
    leaderboard_publishes: AtomicU64,
    race_publishes: AtomicU64,
}

impl SnapshotMetrics {
    pub fn record_build(&self, duration: Duration) {
        self.build.record(duration);
    }

    pub fn inc_created(&self) {
        self.races_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_existing(&self) {
        self.races_existing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failure(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_status_transitions(&self, count: u64) {
        self.status_transitions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_leaderboard_publish(&self) {
        self.leaderboard_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_race_publish(&self) {
        self.race_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SnapshotMetricsSnapshot {
        SnapshotMetricsSnapshot {
            build: self.build.snapshot(),
            races_created: self.races_created.load(Ordering::Relaxed),
            races_existing: self.races_existing.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            status_transitions: self.status_transitions.load(Ordering::Relaxed),
            leaderboard_publishes: self.leaderboard_publishes.load(Ordering::Relaxed),
            race_publishes: self.race_publishes.load(Ordering::Relaxed),
        }
    }
}
