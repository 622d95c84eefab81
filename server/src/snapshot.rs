use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use wagerboard_types::{rank_entries, RaceDraft, RaceStatus, RaceType};

use crate::cache::LeaderboardCache;
use crate::metrics::SnapshotMetrics;
use crate::provider::ProviderError;
use crate::store::{RaceStore, StoreError, StoredSnapshot};
use crate::ServerConfig;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Invalid leaderboard data format: no {0} entries")]
    InvalidDataFormat(&'static str),
    #[error("failed to persist race snapshot: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("failed to fetch leaderboard: {0}")]
    Provider(#[from] ProviderError),
}

/// Turns the current leaderboard into a persisted race for a period.
pub struct SnapshotBuilder {
    cache: Arc<LeaderboardCache>,
    store: RaceStore,
    race_size: usize,
    monthly_prize_pool: f64,
    weekly_prize_pool: f64,
    build_lock: Mutex<()>,
    metrics: Arc<SnapshotMetrics>,
}

impl SnapshotBuilder {
    pub fn new(
        config: &ServerConfig,
        cache: Arc<LeaderboardCache>,
        store: RaceStore,
        metrics: Arc<SnapshotMetrics>,
    ) -> Self {
        Self {
            cache,
            store,
            race_size: config.race_size(),
            monthly_prize_pool: config.prize_pool(RaceType::Monthly),
            weekly_prize_pool: config.prize_pool(RaceType::Weekly),
            build_lock: Mutex::new(()),
            metrics,
        }
    }

    pub async fn build_monthly_snapshot(&self) -> Result<StoredSnapshot, SnapshotError> {
        self.build_snapshot(RaceType::Monthly, Utc::now()).await
    }

    /// Builds the race of the period containing `now`.
    ///
    /// Builds are serialized. If the period already has a race, that race is
    /// returned with `created == false` and nothing is written. A new race is
    /// only ever built from a fresh provider fetch; when the fetch fails the
    /// build fails and nothing is written.
    pub async fn build_snapshot(
        &self,
        race_type: RaceType,
        now: DateTime<Utc>,
    ) -> Result<StoredSnapshot, SnapshotError> {
        let _build = self.build_lock.lock().await;
        let start = Instant::now();
        let result = self.build_locked(race_type, now).await;
        self.metrics.record_build(start.elapsed());
        match &result {
            Ok(stored) if stored.created => {
                self.metrics.inc_created();
                tracing::info!(
                    race_id = stored.snapshot.race.id,
                    race_type = %race_type,
                    participants = stored.snapshot.participants.len(),
                    "race snapshot created"
                );
            }
            Ok(_) => self.metrics.inc_existing(),
            Err(err) => {
                self.metrics.inc_failure();
                tracing::warn!(race_type = %race_type, "race snapshot failed: {err}");
            }
        }
        result
    }

    async fn build_locked(
        &self,
        race_type: RaceType,
        now: DateTime<Utc>,
    ) -> Result<StoredSnapshot, SnapshotError> {
        let (period_start, period_end) = race_type.period_bounds(now);
        if let Some(snapshot) = self.store.race_for_period(race_type, period_start).await? {
            return Ok(StoredSnapshot {
                snapshot,
                created: false,
            });
        }

        let leaderboard = self.cache.refresh_strict().await?;
        let period = race_type.period();
        let entries = leaderboard
            .data
            .entries(period)
            .ok_or(SnapshotError::InvalidDataFormat(period.bucket_key()))?;
        let participants = rank_entries(entries, period, self.race_size);

        let draft = RaceDraft {
            title: race_type.title(period_start),
            race_type,
            status: RaceStatus::Live,
            prize_pool: self.prize_pool(race_type),
            start_date: period_start,
            end_date: period_end,
            participants,
        };
        Ok(self.store.insert_snapshot(draft, now).await?)
    }

    fn prize_pool(&self, race_type: RaceType) -> f64 {
        match race_type {
            RaceType::Monthly => self.monthly_prize_pool,
            RaceType::Weekly => self.weekly_prize_pool,
        }
    }
}
