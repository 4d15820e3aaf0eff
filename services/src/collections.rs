//! Durable record schemas. These mirror the database tables one to one; the
//! storage gateway is the only writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common_match::scoring::MatchOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    /// Stored case-folded; uniqueness is on the folded form.
    pub username: String,
    /// Lookup hash, never the address itself.
    pub email_hash: Option<String>,
    pub password_hash: Option<String>,
    pub settings: serde_json::Value,
    pub created: DateTime<Utc>,
}

/// 1:1 with `UserRecord`. `rating == None` means still in placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingRecord {
    pub user_id: String,
    pub rating: Option<i32>,
    pub competitive_rating: Option<i32>,
    pub placement_games_played: u32,
}

impl RatingRecord {
    pub fn fresh(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            rating: None,
            competitive_rating: None,
            placement_games_played: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStatus {
    Pending,
    InProgress,
    Completed,
    Abandoned,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::InProgress => "in-progress",
            MatchStatus::Completed => "completed",
            MatchStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(MatchStatus::Pending),
            "in-progress" => Some(MatchStatus::InProgress),
            "completed" => Some(MatchStatus::Completed),
            "abandoned" => Some(MatchStatus::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: String,
    pub seed: String,
    pub mode: String,
    pub round_time_seconds: u32,
    pub status: MatchStatus,
    pub created: DateTime<Utc>,
}

/// One side of a match. Metric columns stay null until finalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPlayerRecord {
    pub match_id: String,
    pub user_id: String,
    pub wpm: Option<f64>,
    pub raw_wpm: Option<f64>,
    pub accuracy: Option<f64>,
    pub consistency: Option<f64>,
    pub score: Option<f64>,
    pub result: Option<MatchOutcome>,
    pub damage_dealt: i32,
    pub damage_taken: i32,
    pub errors: u32,
    pub correct_chars: u32,
    pub total_typed: u32,
    pub rating_before: Option<i32>,
    pub rating_after: Option<i32>,
    pub rating_delta: Option<i32>,
    /// Cumulative typed-length per second bucket.
    pub progress_samples: Vec<u32>,
}

impl MatchPlayerRecord {
    /// Empty shell persisted when the match is created, before play.
    pub fn shell(match_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            match_id: match_id.into(),
            user_id: user_id.into(),
            wpm: None,
            raw_wpm: None,
            accuracy: None,
            consistency: None,
            score: None,
            result: None,
            damage_dealt: 0,
            damage_taken: 0,
            errors: 0,
            correct_chars: 0,
            total_typed: 0,
            rating_before: None,
            rating_after: None,
            rating_delta: None,
            progress_samples: Vec::new(),
        }
    }
}

/// At most one row per (user, day-in-reset-timezone).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyScoreRecord {
    pub user_id: String,
    /// `YYYY-MM-DD` in the reset timezone.
    pub day: String,
    pub wpm: f64,
    pub raw_wpm: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub score: f64,
    pub correct_chars: u32,
    pub total_typed: u32,
    pub errors: u32,
    pub seed: String,
    pub created: DateTime<Utc>,
}

/// Leaderboard projection row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub user_id: String,
    pub username: String,
    pub rating: i32,
    pub competitive_rating: Option<i32>,
}

/// What the rating policy needs to know about one recent ranked result.
#[derive(Debug, Clone)]
pub struct RecentResult {
    pub won: Option<bool>,
    pub wpm: Option<f64>,
    pub accuracy: Option<f64>,
    pub consistency: Option<f64>,
    pub opponent_rating: Option<i32>,
    pub created: DateTime<Utc>,
}

/// One rating write within `apply_ratings`.
#[derive(Debug, Clone)]
pub struct RatingUpdate {
    pub user_id: String,
    pub rating: Option<i32>,
    pub competitive_rating: Option<i32>,
}
