//! Server-side metric computation. Clients submit raw keystrokes and timing;
//! every number that reaches storage or ratings is derived here.

use serde::{Deserialize, Serialize};

use crate::consts::{BASE_PLACEMENT_RATING, ELO_K, FORFEIT_PENALTY, MAX_DAMAGE_PER_ROUND};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Win,
    Loss,
    Draw,
}

impl MatchOutcome {
    pub fn score(self) -> f64 {
        match self {
            MatchOutcome::Win => 1.0,
            MatchOutcome::Draw => 0.5,
            MatchOutcome::Loss => 0.0,
        }
    }

    pub fn complement(self) -> Self {
        match self {
            MatchOutcome::Win => MatchOutcome::Loss,
            MatchOutcome::Loss => MatchOutcome::Win,
            MatchOutcome::Draw => MatchOutcome::Draw,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchOutcome::Win => "win",
            MatchOutcome::Loss => "loss",
            MatchOutcome::Draw => "draw",
        }
    }
}

/// Everything the orchestrator persists and scores for one player round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub wpm: f64,
    pub raw_wpm: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub correct_chars: u32,
    pub total_typed: u32,
    pub errors: u32,
    /// Placement/analytics score; not the combat score.
    pub score: f64,
    /// 0..100 rank-normalised score that drives round damage.
    pub combat: f64,
}

/// Plausibility guard: no human submission can carry more characters than
/// `max_chars_per_sec` sustained over the elapsed time, and typing past the
/// end of the target text carries no signal.
pub fn clamp_typed(typed: &str, target: &str, elapsed_ms: u64, max_chars_per_sec: u32) -> String {
    let ceiling = ((elapsed_ms as f64 / 1000.0) * f64::from(max_chars_per_sec)).ceil() as usize;
    let limit = ceiling.min(target.chars().count());
    typed.chars().take(limit).collect()
}

pub fn correct_chars(target: &str, typed: &str) -> u32 {
    target
        .chars()
        .zip(typed.chars())
        .filter(|(expected, got)| expected == got)
        .count() as u32
}

/// Keystroke-level accuracy when the client reported counters, positional
/// accuracy otherwise.
pub fn accuracy(
    correct: u32,
    total_typed: u32,
    total_errors: Option<u32>,
    total_keystrokes: Option<u32>,
) -> f64 {
    match (total_errors, total_keystrokes) {
        (Some(errors), Some(keystrokes)) if keystrokes > 0 => {
            (f64::from(keystrokes.saturating_sub(errors)) / f64::from(keystrokes)).clamp(0.0, 1.0)
        }
        _ => f64::from(correct) / f64::from(total_typed.max(1)),
    }
}

/// Consistency over per-second throughput samples: `1 / (1 + stddev)`.
/// Fewer than two samples is treated as perfectly consistent.
pub fn consistency(speeds: &[f64]) -> f64 {
    if speeds.len() < 2 {
        return 1.0;
    }
    let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
    let variance = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / speeds.len() as f64;
    1.0 / (1.0 + variance.sqrt())
}

/// Cumulative per-second progress samples → per-second speeds.
pub fn sample_speeds(samples: &[u32]) -> Vec<f64> {
    samples
        .windows(2)
        .map(|w| f64::from(w[1].saturating_sub(w[0])))
        .collect()
}

/// The WPM a rating band is normalised against. Grows linearly so a score of
/// 100 means "typed at the ceiling of your band with perfect accuracy".
pub fn wpm_ceiling(rating: i32) -> f64 {
    60.0 + f64::from(rating.max(0)) * 0.05
}

/// 0..100 rank-sensitive round score. `rating` is the band the score is
/// normalised against; unrated players use the placement base.
pub fn combat_score(wpm: f64, accuracy: f64, rating: Option<i32>) -> f64 {
    let ceiling = wpm_ceiling(rating.unwrap_or(BASE_PLACEMENT_RATING));
    let speed = (wpm / ceiling).clamp(0.0, 1.0);
    (100.0 * speed * accuracy.clamp(0.0, 1.0).powi(2)).clamp(0.0, 100.0)
}

/// Round damage: positive score gap, capped.
pub fn damage(winner_score: f64, loser_score: f64) -> i32 {
    ((winner_score - loser_score).max(0.0).round() as i32).clamp(0, MAX_DAMAGE_PER_ROUND)
}

pub fn expected_score(rating: i32, opponent: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf(f64::from(opponent - rating) / 400.0))
}

/// Per-match Elo delta. `score_margin` is this player's average combat score
/// minus the opponent's; `remaining_hp` is this player's HP at termination.
/// Decisive wins (big margin, healthy HP) are worth up to 1.5× the base
/// delta; the forfeiter eats a flat extra penalty.
pub fn elo_delta(
    rating: i32,
    opponent_rating: i32,
    outcome: MatchOutcome,
    score_margin: f64,
    remaining_hp: i32,
    forfeited: bool,
) -> i32 {
    let expected = expected_score(rating, opponent_rating);
    let base = ELO_K * (outcome.score() - expected);
    let multiplier = (1.0
        + score_margin.max(0.0) / 200.0
        + f64::from(remaining_hp.max(0)) / 400.0)
        .min(1.5);
    let mut delta = (base * multiplier).round() as i32;
    if forfeited {
        delta -= FORFEIT_PENALTY;
    }
    delta
}

/// Full metric derivation for one round submission. `typed` must already be
/// plausibility-clamped via [`clamp_typed`].
#[allow(clippy::too_many_arguments)]
pub fn compute_round(
    target: &str,
    typed: &str,
    elapsed_ms: u64,
    samples: &[u32],
    total_errors: Option<u32>,
    total_keystrokes: Option<u32>,
    rating: Option<i32>,
) -> RoundMetrics {
    let minutes = (elapsed_ms.max(1) as f64) / 60_000.0;
    let total_typed = typed.chars().count() as u32;
    let correct = correct_chars(target, typed);
    let errors = total_typed.saturating_sub(correct);

    let accuracy = accuracy(correct, total_typed, total_errors, total_keystrokes);
    let keystrokes = total_keystrokes.unwrap_or(total_typed);
    let raw_wpm = (f64::from(keystrokes) / 5.0) / minutes;

    // Every three corrected mistakes grant one WPM back.
    let corrected = total_errors.map(|t| t.saturating_sub(errors)).unwrap_or(0);
    let wpm = (f64::from(correct) / 5.0) / minutes + f64::from(corrected / 3);

    let consistency = consistency(&sample_speeds(samples));
    let score = wpm * accuracy.powi(2) * (0.9 + 0.1 * consistency);
    let combat = combat_score(wpm, accuracy, rating);

    RoundMetrics {
        wpm,
        raw_wpm,
        accuracy,
        consistency,
        correct_chars: correct,
        total_typed,
        errors,
        score,
        combat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_respects_chars_per_second() {
        let target = "a".repeat(500);
        let typed = "a".repeat(500);
        // 2 seconds at 45 cps allows 90 chars.
        let clamped = clamp_typed(&typed, &target, 2_000, 45);
        assert_eq!(clamped.chars().count(), 90);
    }

    #[test]
    fn clamp_never_exceeds_target() {
        let clamped = clamp_typed("abcdefgh", "abc", 60_000, 45);
        assert_eq!(clamped, "abc");
    }

    #[test]
    fn keystroke_accuracy_preferred_over_positional() {
        // 100 keystrokes, 5 errors -> 0.95 regardless of final text.
        let acc = accuracy(10, 20, Some(5), Some(100));
        assert!((acc - 0.95).abs() < 1e-9);
        // Fallback path.
        let acc = accuracy(10, 20, None, None);
        assert!((acc - 0.5).abs() < 1e-9);
    }

    #[test]
    fn corrected_mistakes_grant_wpm() {
        let target = "hello world hello world";
        // 60 correct-ish chars in 60s would be 1 char/s; keep it simple:
        let base = compute_round(target, "hello world", 60_000, &[], Some(0), None, None);
        let fixed = compute_round(target, "hello world", 60_000, &[], Some(6), None, None);
        assert!((fixed.wpm - base.wpm - 2.0).abs() < 1e-9);
    }

    #[test]
    fn consistency_defaults_to_one() {
        assert_eq!(consistency(&[]), 1.0);
        assert_eq!(consistency(&[4.0]), 1.0);
        assert!(consistency(&[2.0, 8.0, 3.0]) < 1.0);
    }

    #[test]
    fn damage_is_capped_and_floored() {
        assert_eq!(damage(90.0, 10.0), MAX_DAMAGE_PER_ROUND);
        assert_eq!(damage(10.0, 90.0), 0);
        assert_eq!(damage(55.4, 40.2), 15);
    }

    #[test]
    fn combat_score_drops_with_rating_band() {
        let low_band = combat_score(90.0, 0.97, Some(1000));
        let high_band = combat_score(90.0, 0.97, Some(2000));
        assert!(low_band > high_band);
        assert!(low_band <= 100.0);
    }

    #[test]
    fn elo_delta_rewards_upsets() {
        let upset = elo_delta(1200, 1500, MatchOutcome::Win, 10.0, 40, false);
        let expected_win = elo_delta(1500, 1200, MatchOutcome::Win, 10.0, 40, false);
        assert!(upset > expected_win);
        assert!(expected_win > 0);
    }

    #[test]
    fn forfeit_costs_extra() {
        let plain_loss = elo_delta(1400, 1400, MatchOutcome::Loss, 0.0, 0, false);
        let forfeit_loss = elo_delta(1400, 1400, MatchOutcome::Loss, 0.0, 0, true);
        assert_eq!(forfeit_loss, plain_loss - FORFEIT_PENALTY);
    }
}
