use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::leaderboard::LeaderboardResponse;
use crate::race::{RaceSnapshot, RaceType, UnknownVariant};

/// Default page size of paginated leaderboard reads.
pub const DEFAULT_PAGE_LIMIT: usize = 10;
/// Largest page a client may request.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Channel a live subscriber listens on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    Leaderboard,
    WagerRaces,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Leaderboard, Topic::WagerRaces];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Leaderboard => "leaderboard",
            Topic::WagerRaces => "wager-races",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "leaderboard" => Ok(Topic::Leaderboard),
            "wager-races" => Ok(Topic::WagerRaces),
            _ => Err(UnknownVariant {
                kind: "topic",
                value: value.to_string(),
            }),
        }
    }
}

/// Message pushed to live subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    #[serde(rename_all = "camelCase")]
    ConnectionStatus { connected: bool, client_id: String },
    LeaderboardUpdate { data: Box<LeaderboardResponse> },
    RaceUpdate { data: Box<RaceSnapshot> },
}

impl LiveMessage {
    /// Topic this message is published on, `None` for per-connection messages.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            LiveMessage::ConnectionStatus { .. } => None,
            LiveMessage::LeaderboardUpdate { .. } => Some(Topic::Leaderboard),
            LiveMessage::RaceUpdate { .. } => Some(Topic::WagerRaces),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A participant's standing in the currently running race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RacePosition {
    pub position: u32,
    pub total_participants: usize,
    pub wager_amount: f64,
    pub race_type: RaceType,
    pub race_title: String,
    pub end_date: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_status_shape() {
        let message = LiveMessage::ConnectionStatus {
            connected: true,
            client_id: "abc".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&message).expect("serialize"),
            json!({ "type": "connection_status", "connected": true, "clientId": "abc" })
        );
        assert_eq!(message.topic(), None);
    }

    #[test]
    fn test_leaderboard_update_shape() {
        let message = LiveMessage::LeaderboardUpdate {
            data: Box::default(),
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "leaderboard_update");
        assert!(value["data"]["metadata"].is_object());
        assert_eq!(message.topic(), Some(Topic::Leaderboard));
    }

    #[test]
    fn test_topic_names() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>(), Ok(topic));
            assert_eq!(
                serde_json::to_value(topic).expect("serialize"),
                json!(topic.as_str())
            );
        }
        assert!("races".parse::<Topic>().is_err());
    }
}
