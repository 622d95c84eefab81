use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::leaderboard::{sort_by_wagered, LeaderboardEntry, Period};

/// Number of participants captured by a race snapshot unless configured otherwise.
pub const DEFAULT_RACE_SIZE: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceType {
    Weekly,
    Monthly,
}

impl RaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceType::Weekly => "weekly",
            RaceType::Monthly => "monthly",
        }
    }

    /// Leaderboard period whose wager totals rank this race.
    pub fn period(&self) -> Period {
        match self {
            RaceType::Weekly => Period::Weekly,
            RaceType::Monthly => Period::Monthly,
        }
    }

    /// UTC `[start, end)` of the race period containing `now`.
    ///
    /// Monthly races start on the first of the month, weekly races on Monday.
    pub fn period_bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = now.date_naive();
        let (start, end) = match self {
            RaceType::Monthly => {
                let start = date - Days::new(u64::from(date.day0()));
                (start, start + Months::new(1))
            }
            RaceType::Weekly => {
                let start = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
                (start, start + Days::new(7))
            }
        };
        (midnight(start), midnight(end))
    }

    pub fn title(&self, period_start: DateTime<Utc>) -> String {
        match self {
            RaceType::Monthly => {
                format!("Monthly Wager Race - {}", period_start.format("%B %Y"))
            }
            RaceType::Weekly => format!(
                "Weekly Wager Race - Week of {}",
                period_start.format("%B %-d, %Y")
            ),
        }
    }
}

impl fmt::Display for RaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaceType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            _ => Err(UnknownVariant {
                kind: "race type",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Upcoming,
    Live,
    Completed,
}

impl RaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Upcoming => "upcoming",
            RaceStatus::Live => "live",
            RaceStatus::Completed => "completed",
        }
    }

    /// Status a race spanning `[start, end)` should have at `now`.
    pub fn at(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now < start {
            RaceStatus::Upcoming
        } else if now < end {
            RaceStatus::Live
        } else {
            RaceStatus::Completed
        }
    }
}

impl fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaceStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "upcoming" => Ok(Self::Upcoming),
            "live" => Ok(Self::Live),
            "completed" => Ok(Self::Completed),
            _ => Err(UnknownVariant {
                kind: "race status",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Race {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub race_type: RaceType,
    pub status: RaceStatus,
    pub prize_pool: f64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceParticipant {
    pub race_id: i64,
    pub uid: String,
    pub name: String,
    pub wagered: f64,
    pub position: u32,
}

/// A persisted race together with its participants ordered by position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceSnapshot {
    #[serde(flatten)]
    pub race: Race,
    pub participants: Vec<RaceParticipant>,
}

/// Participant ranking computed before the race row exists.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedEntry {
    pub uid: String,
    pub name: String,
    pub wagered: f64,
    pub position: u32,
}

/// A race ready to be written; the store assigns ids and `created_at`.
#[derive(Clone, Debug, PartialEq)]
pub struct RaceDraft {
    pub title: String,
    pub race_type: RaceType,
    pub status: RaceStatus,
    pub prize_pool: f64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub participants: Vec<RankedEntry>,
}

/// Ranks `entries` by the period's wager total and keeps the first `limit`.
///
/// Provider ordering is not trusted: entries are re-sorted descending with a
/// stable sort, so equal amounts keep their original relative order.
/// Positions are `1..=k`.
pub fn rank_entries(entries: &[LeaderboardEntry], period: Period, limit: usize) -> Vec<RankedEntry> {
    let mut sorted = entries.to_vec();
    sort_by_wagered(&mut sorted, period);
    sorted
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(index, entry)| RankedEntry {
            wagered: entry.wagered.for_period(period),
            uid: entry.uid,
            name: entry.name,
            position: index as u32 + 1,
        })
        .collect()
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::WagerTotals;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn monthly(uid: &str, amount: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            uid: uid.to_string(),
            name: uid.to_string(),
            wagered: WagerTotals {
                this_month: amount,
                ..Default::default()
            },
            last_updated: None,
        }
    }

    #[test]
    fn test_monthly_bounds_and_title() {
        let (start, end) = RaceType::Monthly.period_bounds(utc(2025, 3, 17, 15));
        assert_eq!(start, utc(2025, 3, 1, 0));
        assert_eq!(end, utc(2025, 4, 1, 0));
        assert_eq!(RaceType::Monthly.title(start), "Monthly Wager Race - March 2025");

        let (start, end) = RaceType::Monthly.period_bounds(utc(2024, 12, 31, 23));
        assert_eq!(start, utc(2024, 12, 1, 0));
        assert_eq!(end, utc(2025, 1, 1, 0));
    }

    #[test]
    fn test_weekly_bounds_and_title() {
        // 2025-03-06 is a Thursday.
        let (start, end) = RaceType::Weekly.period_bounds(utc(2025, 3, 6, 9));
        assert_eq!(start, utc(2025, 3, 3, 0));
        assert_eq!(end, utc(2025, 3, 10, 0));
        assert_eq!(
            RaceType::Weekly.title(start),
            "Weekly Wager Race - Week of March 3, 2025"
        );
    }

    #[test]
    fn test_status_at() {
        let start = utc(2025, 3, 1, 0);
        let end = utc(2025, 4, 1, 0);
        assert_eq!(RaceStatus::at(start, end, utc(2025, 2, 28, 0)), RaceStatus::Upcoming);
        assert_eq!(RaceStatus::at(start, end, start), RaceStatus::Live);
        assert_eq!(RaceStatus::at(start, end, end), RaceStatus::Completed);
    }

    #[test]
    fn test_parse_round_trip_names() {
        assert_eq!("MONTHLY".parse::<RaceType>(), Ok(RaceType::Monthly));
        assert_eq!("live".parse::<RaceStatus>(), Ok(RaceStatus::Live));
        assert!("weekend".parse::<RaceType>().is_err());
    }

    #[test]
    fn test_rank_entries_resorts_provider_order() {
        let entries = vec![monthly("low", 100.0), monthly("high", 900.0), monthly("mid", 500.0)];
        let ranked = rank_entries(&entries, Period::Monthly, 10);
        let order: Vec<_> = ranked.iter().map(|r| (r.uid.as_str(), r.position)).collect();
        assert_eq!(order, vec![("high", 1), ("mid", 2), ("low", 3)]);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let race = Race {
            id: 7,
            title: "Monthly Wager Race - March 2025".to_string(),
            race_type: RaceType::Monthly,
            status: RaceStatus::Live,
            prize_pool: 500.0,
            start_date: utc(2025, 3, 1, 0),
            end_date: utc(2025, 4, 1, 0),
            created_at: utc(2025, 3, 1, 1),
        };
        let snapshot = RaceSnapshot {
            race,
            participants: vec![],
        };
        let value = serde_json::to_value(&snapshot).expect("serialize snapshot");
        assert_eq!(value["type"], "monthly");
        assert_eq!(value["status"], "live");
        assert_eq!(value["prizePool"], 500.0);
        assert!(value["participants"].as_array().is_some());
        let decoded: RaceSnapshot = serde_json::from_value(value).expect("deserialize snapshot");
        assert_eq!(decoded, snapshot);
    }

    fn arb_entries() -> impl Strategy<Value = Vec<LeaderboardEntry>> {
        prop::collection::vec(0u32..1_000, 0..40).prop_map(|amounts| {
            amounts
                .into_iter()
                .enumerate()
                .map(|(i, amount)| monthly(&format!("u{i}"), f64::from(amount)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_positions_are_contiguous(entries in arb_entries(), limit in 0usize..15) {
            let ranked = rank_entries(&entries, Period::Monthly, limit);
            prop_assert!(ranked.len() <= limit);
            prop_assert_eq!(ranked.len(), entries.len().min(limit));
            for (index, participant) in ranked.iter().enumerate() {
                prop_assert_eq!(participant.position as usize, index + 1);
            }
        }

        #[test]
        fn prop_amounts_non_increasing(entries in arb_entries()) {
            let ranked = rank_entries(&entries, Period::Monthly, DEFAULT_RACE_SIZE);
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].wagered >= pair[1].wagered);
            }
        }

        #[test]
        fn prop_keeps_the_largest_amounts(entries in arb_entries()) {
            let ranked = rank_entries(&entries, Period::Monthly, DEFAULT_RACE_SIZE);
            if let Some(last) = ranked.last() {
                let above = entries
                    .iter()
                    .filter(|e| e.wagered.this_month > last.wagered)
                    .count();
                prop_assert!(above < ranked.len());
            }
        }

        #[test]
        fn prop_ties_keep_input_order(entries in arb_entries()) {
            let ranked = rank_entries(&entries, Period::Monthly, entries.len());
            let index_of = |uid: &str| entries.iter().position(|e| e.uid == uid);
            for pair in ranked.windows(2) {
                if pair[0].wagered == pair[1].wagered {
                    prop_assert!(index_of(&pair[0].uid) < index_of(&pair[1].uid));
                }
            }
        }
    }
}
