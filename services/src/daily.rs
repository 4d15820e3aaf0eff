//! Daily challenge: one scored attempt per account per calendar day in the
//! configured reset timezone. The text is derived from the day key, so every
//! client and the server agree on it without coordination.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use common_match::consts::MAX_CHARS_PER_SEC_DAILY;
use common_match::scoring;
use common_match::textgen::{self, Difficulty};

use crate::collections::DailyScoreRecord;

pub const DAILY_SEED_PREFIX: &str = "veloxtype-daily-";
pub const DAILY_TEXT_LENGTH: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct DailySubmission {
    pub typed: String,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub total_errors: Option<u32>,
    #[serde(default)]
    pub total_keystrokes: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyChallengeInfo {
    pub day: String,
    pub seed: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct DailyChallenge {
    timezone: Tz,
}

impl DailyChallenge {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// `YYYY-MM-DD` of `now` in the reset timezone.
    pub fn day_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.timezone).format("%Y-%m-%d").to_string()
    }

    pub fn seed_for(&self, day: &str) -> String {
        format!("{DAILY_SEED_PREFIX}{day}")
    }

    pub fn text_for(&self, day: &str) -> String {
        textgen::generate(&self.seed_for(day), DAILY_TEXT_LENGTH, Difficulty::Medium, false)
    }

    pub fn challenge(&self, now: DateTime<Utc>) -> DailyChallengeInfo {
        let day = self.day_key(now);
        let seed = self.seed_for(&day);
        let text = self.text_for(&day);
        DailyChallengeInfo { day, seed, text }
    }

    /// Recompute every metric server-side against the authoritative text and
    /// produce the row to persist. The caller owns the unique-per-day insert.
    pub fn score(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        submission: &DailySubmission,
    ) -> DailyScoreRecord {
        let day = self.day_key(now);
        let seed = self.seed_for(&day);
        let target = self.text_for(&day);

        let typed = scoring::clamp_typed(
            &submission.typed,
            &target,
            submission.elapsed_ms,
            MAX_CHARS_PER_SEC_DAILY,
        );
        let metrics = scoring::compute_round(
            &target,
            &typed,
            submission.elapsed_ms,
            &[],
            submission.total_errors,
            submission.total_keystrokes,
            None,
        );

        DailyScoreRecord {
            user_id: user_id.to_string(),
            day,
            wpm: metrics.wpm,
            raw_wpm: metrics.raw_wpm,
            accuracy: metrics.accuracy,
            consistency: metrics.consistency,
            score: metrics.score,
            correct_chars: metrics.correct_chars,
            total_typed: metrics.total_typed,
            errors: metrics.errors,
            seed,
            created: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn challenge() -> DailyChallenge {
        DailyChallenge::new(chrono_tz::America::New_York)
    }

    #[test]
    fn day_boundary_follows_reset_timezone() {
        let daily = challenge();
        // 03:00 UTC is still the previous day in New York.
        let utc_morning = Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap();
        assert_eq!(daily.day_key(utc_morning), "2025-06-01");
        let utc_noon = Utc.with_ymd_and_hms(2025, 6, 2, 16, 0, 0).unwrap();
        assert_eq!(daily.day_key(utc_noon), "2025-06-02");
    }

    #[test]
    fn text_is_stable_for_a_day() {
        let daily = challenge();
        assert_eq!(daily.text_for("2025-06-01"), daily.text_for("2025-06-01"));
        assert_ne!(daily.text_for("2025-06-01"), daily.text_for("2025-06-02"));
        assert_eq!(daily.seed_for("2025-06-01"), "veloxtype-daily-2025-06-01");
    }

    #[test]
    fn score_clamps_to_daily_chars_per_second() {
        let daily = challenge();
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 16, 0, 0).unwrap();
        let text = daily.text_for(&daily.day_key(now));
        // Claim the full text in one second: only 20 chars can count.
        let submission = DailySubmission {
            typed: text.clone(),
            elapsed_ms: 1_000,
            total_errors: None,
            total_keystrokes: None,
        };
        let row = daily.score("u1", now, &submission);
        assert!(row.total_typed <= 20);
    }

    #[test]
    fn perfect_copy_scores_full_accuracy() {
        let daily = challenge();
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 16, 0, 0).unwrap();
        let text = daily.text_for(&daily.day_key(now));
        let submission = DailySubmission {
            typed: text.clone(),
            elapsed_ms: 60_000,
            total_errors: None,
            total_keystrokes: None,
        };
        let row = daily.score("u1", now, &submission);
        assert_eq!(row.correct_chars as usize, text.chars().count());
        assert!((row.accuracy - 1.0).abs() < 1e-9);
    }
}
