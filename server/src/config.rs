use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use wagerboard_types::{RaceType, DEFAULT_RACE_SIZE};

use crate::store::StoreLocation;

const DEFAULT_PROVIDER_BASE_URL: &str = "https://europe-west2-g3casino.cloudfunctions.net/user";
const DEFAULT_PROVIDER_LEADERBOARD_PATH: &str = "/affiliate/referral-leaderboard/2RW440E";
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROVIDER_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_PROVIDER_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_PROVIDER_MAX_BACKOFF_MS: u64 = 5_000;
const DEFAULT_CACHE_TTL_SECONDS: u64 = 60;
const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_MONTHLY_PRIZE_POOL: f64 = 500.0;
const DEFAULT_WEEKLY_PRIZE_POOL: f64 = 100.0;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WS_OUTBOUND_BUFFER: usize = 64;
const DEFAULT_WS_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_WS_MAX_CONNECTIONS_PER_IP: usize = 10;
const DEFAULT_WS_MAX_MESSAGE_BYTES: usize = 64 * 1024;
const DEFAULT_WS_SEND_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_WS_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_WS_HEARTBEAT_GRACE_SECONDS: u64 = 60;
const DEFAULT_FANOUT_CHANNEL: &str = "wagerboard.live";

/// Runtime configuration of a wagerboard server.
///
/// Optional limits follow one convention: `None` means the limit is disabled
/// (connection caps) or the built-in default applies (buffers, timeouts).
#[derive(Clone, Debug, Serialize)]
pub struct ServerConfig {
    pub provider_base_url: String,
    pub provider_leaderboard_path: String,
    #[serde(skip)]
    pub api_token: Option<String>,
    pub provider_timeout_ms: Option<u64>,
    pub provider_max_attempts: Option<u32>,
    pub provider_initial_backoff_ms: Option<u64>,
    pub provider_max_backoff_ms: Option<u64>,
    pub cache_ttl_seconds: Option<u64>,
    pub refresh_interval_seconds: Option<u64>,
    pub race_size: Option<usize>,
    pub race_types: Vec<RaceType>,
    pub monthly_prize_pool: f64,
    pub weekly_prize_pool: f64,
    pub store_path: Option<PathBuf>,
    #[serde(skip)]
    pub store_url: Option<String>,
    pub store_timeout_ms: Option<u64>,
    pub ws_outbound_buffer: Option<usize>,
    pub ws_max_connections: Option<usize>,
    pub ws_max_connections_per_ip: Option<usize>,
    pub ws_max_message_bytes: Option<usize>,
    pub ws_send_timeout_ms: Option<u64>,
    pub ws_heartbeat_interval_seconds: Option<u64>,
    pub ws_heartbeat_grace_seconds: Option<u64>,
    #[serde(skip)]
    pub fanout_redis_url: Option<String>,
    pub fanout_channel: Option<String>,
    pub fanout_origin: Option<String>,
    pub fanout_publish: Option<bool>,
    pub fanout_subscribe: Option<bool>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            provider_base_url: DEFAULT_PROVIDER_BASE_URL.to_string(),
            provider_leaderboard_path: DEFAULT_PROVIDER_LEADERBOARD_PATH.to_string(),
            api_token: None,
            provider_timeout_ms: Some(DEFAULT_PROVIDER_TIMEOUT_MS),
            provider_max_attempts: Some(DEFAULT_PROVIDER_MAX_ATTEMPTS),
            provider_initial_backoff_ms: Some(DEFAULT_PROVIDER_INITIAL_BACKOFF_MS),
            provider_max_backoff_ms: Some(DEFAULT_PROVIDER_MAX_BACKOFF_MS),
            cache_ttl_seconds: Some(DEFAULT_CACHE_TTL_SECONDS),
            refresh_interval_seconds: Some(DEFAULT_REFRESH_INTERVAL_SECONDS),
            race_size: Some(DEFAULT_RACE_SIZE),
            race_types: vec![RaceType::Monthly],
            monthly_prize_pool: DEFAULT_MONTHLY_PRIZE_POOL,
            weekly_prize_pool: DEFAULT_WEEKLY_PRIZE_POOL,
            store_path: None,
            store_url: None,
            store_timeout_ms: Some(DEFAULT_STORE_TIMEOUT_MS),
            ws_outbound_buffer: Some(DEFAULT_WS_OUTBOUND_BUFFER),
            ws_max_connections: Some(DEFAULT_WS_MAX_CONNECTIONS),
            ws_max_connections_per_ip: Some(DEFAULT_WS_MAX_CONNECTIONS_PER_IP),
            ws_max_message_bytes: Some(DEFAULT_WS_MAX_MESSAGE_BYTES),
            ws_send_timeout_ms: Some(DEFAULT_WS_SEND_TIMEOUT_MS),
            ws_heartbeat_interval_seconds: Some(DEFAULT_WS_HEARTBEAT_INTERVAL_SECONDS),
            ws_heartbeat_grace_seconds: Some(DEFAULT_WS_HEARTBEAT_GRACE_SECONDS),
            fanout_redis_url: None,
            fanout_channel: Some(DEFAULT_FANOUT_CHANNEL.to_string()),
            fanout_origin: None,
            fanout_publish: Some(true),
            fanout_subscribe: Some(true),
        }
    }
}

impl ServerConfig {
    pub fn provider_url(&self) -> String {
        format!(
            "{}{}",
            self.provider_base_url.trim_end_matches('/'),
            self.provider_leaderboard_path
        )
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(
            self.provider_timeout_ms
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_MS)
                .max(1),
        )
    }

    pub fn provider_max_attempts(&self) -> u32 {
        self.provider_max_attempts
            .unwrap_or(DEFAULT_PROVIDER_MAX_ATTEMPTS)
            .max(1)
    }

    pub fn provider_initial_backoff(&self) -> Duration {
        Duration::from_millis(
            self.provider_initial_backoff_ms
                .unwrap_or(DEFAULT_PROVIDER_INITIAL_BACKOFF_MS),
        )
    }

    pub fn provider_max_backoff(&self) -> Duration {
        Duration::from_millis(
            self.provider_max_backoff_ms
                .unwrap_or(DEFAULT_PROVIDER_MAX_BACKOFF_MS),
        )
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECONDS))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(
            self.refresh_interval_seconds
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECONDS)
                .max(1),
        )
    }

    pub fn race_size(&self) -> usize {
        self.race_size.unwrap_or(DEFAULT_RACE_SIZE).max(1)
    }

    pub fn prize_pool(&self, race_type: RaceType) -> f64 {
        match race_type {
            RaceType::Monthly => self.monthly_prize_pool,
            RaceType::Weekly => self.weekly_prize_pool,
        }
    }

    /// Postgres wins over a SQLite path; with neither the store lives in memory.
    pub fn store_location(&self) -> StoreLocation {
        match (&self.store_url, &self.store_path) {
            (Some(url), _) => StoreLocation::Postgres(url.clone()),
            (None, Some(path)) => StoreLocation::Sqlite(path.clone()),
            (None, None) => StoreLocation::Memory,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(
            self.store_timeout_ms
                .unwrap_or(DEFAULT_STORE_TIMEOUT_MS)
                .max(1),
        )
    }

    pub fn ws_outbound_capacity(&self) -> usize {
        self.ws_outbound_buffer
            .unwrap_or(DEFAULT_WS_OUTBOUND_BUFFER)
            .max(1)
    }

    pub fn ws_max_message_bytes(&self) -> usize {
        self.ws_max_message_bytes
            .unwrap_or(DEFAULT_WS_MAX_MESSAGE_BYTES)
            .max(1)
    }

    pub fn ws_send_timeout(&self) -> Duration {
        Duration::from_millis(
            self.ws_send_timeout_ms
                .unwrap_or(DEFAULT_WS_SEND_TIMEOUT_MS)
                .max(1),
        )
    }

    pub fn ws_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(
            self.ws_heartbeat_interval_seconds
                .unwrap_or(DEFAULT_WS_HEARTBEAT_INTERVAL_SECONDS)
                .max(1),
        )
    }

    /// Silence tolerated before a connection is considered dead. Never shorter
    /// than one heartbeat interval.
    pub fn ws_heartbeat_grace(&self) -> Duration {
        let grace = Duration::from_secs(
            self.ws_heartbeat_grace_seconds
                .unwrap_or(DEFAULT_WS_HEARTBEAT_GRACE_SECONDS),
        );
        grace.max(self.ws_heartbeat_interval())
    }

    pub fn fanout_channel(&self) -> String {
        self.fanout_channel
            .clone()
            .unwrap_or_else(|| DEFAULT_FANOUT_CHANNEL.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(
            config.provider_url(),
            "https://europe-west2-g3casino.cloudfunctions.net/user/affiliate/referral-leaderboard/2RW440E"
        );
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.race_size(), 10);
        assert_eq!(config.prize_pool(RaceType::Monthly), 500.0);
        assert_eq!(config.ws_send_timeout(), Duration::from_secs(2));
        assert_eq!(config.ws_heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.ws_heartbeat_grace(), Duration::from_secs(60));
    }

    #[test]
    fn test_zeroes_are_clamped() {
        let config = ServerConfig {
            provider_max_attempts: Some(0),
            ws_outbound_buffer: Some(0),
            ws_heartbeat_interval_seconds: Some(10),
            ws_heartbeat_grace_seconds: Some(0),
            race_size: None,
            ..ServerConfig::default()
        };
        assert_eq!(config.provider_max_attempts(), 1);
        assert_eq!(config.ws_outbound_capacity(), 1);
        assert_eq!(config.ws_heartbeat_grace(), Duration::from_secs(10));
        assert_eq!(config.race_size(), DEFAULT_RACE_SIZE);
    }

    #[test]
    fn test_provider_url_trims_trailing_slash() {
        let config = ServerConfig {
            provider_base_url: "http://127.0.0.1:9000/".to_string(),
            provider_leaderboard_path: "/leaderboard".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(config.provider_url(), "http://127.0.0.1:9000/leaderboard");
    }

    #[test]
    fn test_store_location() {
        let mut config = ServerConfig::default();
        assert!(matches!(config.store_location(), StoreLocation::Memory));
        config.store_path = Some(PathBuf::from("races.db"));
        assert!(matches!(config.store_location(), StoreLocation::Sqlite(_)));
        config.store_url = Some("postgres://localhost/races".to_string());
        assert!(matches!(config.store_location(), StoreLocation::Postgres(_)));
    }
}
