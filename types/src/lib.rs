//! Wire and domain types shared by the wagerboard server and its clients.

pub mod api;
pub use api::{ErrorResponse, LiveMessage, RacePosition, Topic};
pub mod leaderboard;
pub use leaderboard::{
    sort_by_wagered, LeaderboardEntry, LeaderboardMetadata, LeaderboardResponse, Period,
    PeriodBucket, PeriodBuckets, WagerTotals,
};
pub mod race;
pub use race::{
    rank_entries, Race, RaceDraft, RaceParticipant, RaceSnapshot, RaceStatus, RaceType,
    RankedEntry, UnknownVariant, DEFAULT_RACE_SIZE,
};
