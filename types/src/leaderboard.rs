use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Ranking window reported by the affiliate provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Today,
    Weekly,
    Monthly,
    AllTime,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::Today,
        Period::Weekly,
        Period::Monthly,
        Period::AllTime,
    ];

    /// Key of the bucket holding this period's entries in a provider response.
    pub fn bucket_key(&self) -> &'static str {
        match self {
            Period::Today => "today",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::AllTime => "all_time",
        }
    }

    /// Name of the wager total ranked within this period.
    pub fn wager_field(&self) -> &'static str {
        match self {
            Period::Today => "today",
            Period::Weekly => "this_week",
            Period::Monthly => "this_month",
            Period::AllTime => "all_time",
        }
    }
}

/// Cumulative wagered amounts of one participant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WagerTotals {
    #[serde(default, deserialize_with = "lenient_amount")]
    pub today: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub this_week: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub this_month: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub all_time: f64,
}

impl WagerTotals {
    pub fn for_period(&self, period: Period) -> f64 {
        match period {
            Period::Today => self.today,
            Period::Weekly => self.this_week,
            Period::Monthly => self.this_month,
            Period::AllTime => self.all_time,
        }
    }
}

/// One participant as reported by a single leaderboard refresh.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    #[serde(default, deserialize_with = "null_as_default")]
    pub uid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub wagered: WagerTotals,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodBucket {
    #[serde(default)]
    pub data: Option<Vec<LeaderboardEntry>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodBuckets {
    #[serde(default)]
    pub today: Option<PeriodBucket>,
    #[serde(default)]
    pub weekly: Option<PeriodBucket>,
    #[serde(default)]
    pub monthly: Option<PeriodBucket>,
    #[serde(default)]
    pub all_time: Option<PeriodBucket>,
}

impl PeriodBuckets {
    pub fn get(&self, period: Period) -> Option<&PeriodBucket> {
        match period {
            Period::Today => self.today.as_ref(),
            Period::Weekly => self.weekly.as_ref(),
            Period::Monthly => self.monthly.as_ref(),
            Period::AllTime => self.all_time.as_ref(),
        }
    }

    fn slot(&mut self, period: Period) -> &mut Option<PeriodBucket> {
        match period {
            Period::Today => &mut self.today,
            Period::Weekly => &mut self.weekly,
            Period::Monthly => &mut self.monthly,
            Period::AllTime => &mut self.all_time,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardMetadata {
    #[serde(default)]
    pub total_users: u64,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Leaderboard keyed by period, in the shape served to clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: LeaderboardMetadata,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: PeriodBuckets,
}

impl LeaderboardResponse {
    /// Buckets a flat entry list, ranking every period independently.
    pub fn from_entries(entries: Vec<LeaderboardEntry>, now: DateTime<Utc>) -> Self {
        let mut data = PeriodBuckets::default();
        for period in Period::ALL {
            let mut ranked = entries.clone();
            sort_by_wagered(&mut ranked, period);
            *data.slot(period) = Some(PeriodBucket { data: Some(ranked) });
        }
        Self {
            status: Some("success".to_string()),
            metadata: LeaderboardMetadata {
                total_users: entries.len() as u64,
                last_updated: Some(now),
            },
            data,
        }
    }

    /// Entries of one period, or `None` when the bucket or its list is absent.
    pub fn entries(&self, period: Period) -> Option<&[LeaderboardEntry]> {
        self.data
            .get(period)
            .and_then(|bucket| bucket.data.as_deref())
    }

    /// Copy with every bucket cut to the requested page.
    pub fn paginate(&self, page: usize, limit: usize) -> Self {
        let mut paged = self.clone();
        let skip = page.saturating_mul(limit);
        for period in Period::ALL {
            if let Some(bucket) = paged.data.slot(period).as_mut() {
                if let Some(entries) = bucket.data.take() {
                    bucket.data = Some(entries.into_iter().skip(skip).take(limit).collect());
                }
            }
        }
        paged
    }
}

/// Sorts descending by the period's wager total. The sort is stable so ties
/// keep their original relative order.
pub fn sort_by_wagered(entries: &mut [LeaderboardEntry], period: Period) {
    entries.sort_by(|a, b| {
        b.wagered
            .for_period(period)
            .total_cmp(&a.wagered.for_period(period))
    });
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Providers have been seen sending amounts as numbers, numeric strings and nulls.
fn lenient_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let amount = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(amount.filter(|value| value.is_finite()).unwrap_or(0.0))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw.trim()).ok(),
        _ => None,
    };
    Ok(parsed.map(|parsed| parsed.with_timezone(&Utc)))
}
