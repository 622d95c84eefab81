use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use wagerboard_types::LiveMessage;

use crate::Wagerboard;

/// What a single scheduler tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub leaderboard_published: bool,
    pub races_created: usize,
    pub status_transitions: u64,
    pub race_updates: usize,
}

/// Background service that keeps the leaderboard and races current.
///
/// Every tick it refreshes the leaderboard, completes races whose period has
/// ended, makes sure each configured race type has a race for the current
/// period and pushes the changes to subscribers. Ticks never overlap.
pub struct Scheduler {
    wagerboard: Arc<Wagerboard>,
    interval: Duration,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(wagerboard: Arc<Wagerboard>) -> Self {
        let interval = wagerboard.config.refresh_interval();
        let (shutdown, _) = watch::channel(false);
        Self {
            wagerboard,
            interval,
            shutdown,
            task: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawns the tick loop. The first tick runs immediately. Calling `start`
    /// on a running scheduler does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let _ = self.shutdown.send(false);
        let mut shutdown = self.shutdown.subscribe();
        let wagerboard = Arc::clone(&self.wagerboard);
        let interval = self.interval;
        tracing::info!(interval_ms = interval.as_millis() as u64, "scheduler started");
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_version = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = tick(&wagerboard, Utc::now(), &mut last_version).await;
                        tracing::debug!(?report, "scheduler tick");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("scheduler stopped");
        }));
    }

    /// Stops the loop and waits for an in-flight tick to finish.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!("scheduler task failed: {err}");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Runs one scheduling cycle at `now`.
///
/// `last_version` is the leaderboard version last pushed to subscribers; an
/// update is only published for a fresh fetch newer than that. Stale copies
/// served while the provider is down are never pushed.
pub async fn tick(
    wagerboard: &Wagerboard,
    now: DateTime<Utc>,
    last_version: &mut Option<u64>,
) -> TickReport {
    let mut report = TickReport::default();
    let metrics = wagerboard.snapshot_metrics();

    match wagerboard.cache().refresh().await {
        Ok(cached) if !cached.stale && *last_version != Some(cached.version) => {
            *last_version = Some(cached.version);
            let message = LiveMessage::LeaderboardUpdate {
                data: Box::new(cached.data.as_ref().clone()),
            };
            let delivered = wagerboard.publish(&message).await;
            metrics.inc_leaderboard_publish();
            report.leaderboard_published = true;
            tracing::debug!(version = cached.version, delivered, "leaderboard update published");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!("leaderboard refresh failed: {err}"),
    }

    match wagerboard.store().advance_statuses(now).await {
        Ok(transitions) => {
            if transitions > 0 {
                metrics.add_status_transitions(transitions);
                tracing::info!(transitions, "race statuses advanced");
            }
            report.status_transitions = transitions;
        }
        Err(err) => tracing::warn!("failed to advance race statuses: {err}"),
    }

    for race_type in &wagerboard.config.race_types {
        // Failures are logged and counted by the builder.
        let Ok(stored) = wagerboard.builder().build_snapshot(*race_type, now).await else {
            continue;
        };
        if stored.created {
            report.races_created += 1;
        }
        if stored.created || report.status_transitions > 0 {
            let message = LiveMessage::RaceUpdate {
                data: Box::new(stored.snapshot),
            };
            wagerboard.publish(&message).await;
            metrics.inc_race_publish();
            report.race_updates += 1;
        }
    }

    report
}
