//! Placement calibration, tier arithmetic, the overperformance accelerator
//! and the Apex (competitive) rating lifecycle.

use serde::{Deserialize, Serialize};

use crate::consts::{
    APEX_LEADERBOARD_SLOTS, APEX_THRESHOLD, BASE_PLACEMENT_RATING, MAX_PLACEMENT_RATING, MAX_TIER,
    OVERPERFORMANCE_MIN_ACCURACY, OVERPERFORMANCE_MIN_SAMPLES, OVERPERFORMANCE_SCORE_FLOOR,
    PLACEMENT_K, PLACEMENT_REQUIRED, TIER_WIDTH,
};
use crate::scoring::{combat_score, wpm_ceiling};

/// One qualifying game feeding the placement walk, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGame {
    pub won: bool,
    pub wpm: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub opponent_rating: Option<i32>,
}

/// A recent ranked result as the overperformance accelerator sees it.
#[derive(Debug, Clone, Default)]
pub struct HistorySample {
    pub wpm: Option<f64>,
    pub accuracy: Option<f64>,
}

fn expected_score_f(rating: f64, opponent: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - rating) / 400.0))
}

fn placement_walk(games: &[PlacementGame]) -> f64 {
    let mut estimate = f64::from(BASE_PLACEMENT_RATING);

    for game in games {
        let opponent = game.opponent_rating.map(f64::from).unwrap_or(estimate);
        let actual = if game.won { 1.0 } else { 0.0 };
        estimate += PLACEMENT_K * (actual - expected_score_f(estimate, opponent));

        // Secondary signal: how the raw performance sits inside the band the
        // estimate currently points at.
        let wpm_norm = (game.wpm / wpm_ceiling(estimate.round() as i32)).clamp(0.0, 1.0);
        let perf_signal = 0.7 * wpm_norm + 0.25 * game.accuracy + 0.05 * game.consistency;
        estimate += (perf_signal - 0.5) * 22.0;
        estimate += (game.consistency - 0.5) * 4.0;

        estimate = estimate.clamp(0.0, f64::from(MAX_PLACEMENT_RATING));
    }

    estimate
}

/// Initial rating after the full placement set. An empty slice seeds at the
/// base; the result can never reach Apex.
pub fn calculate_placement_rating(games: &[PlacementGame]) -> i32 {
    placement_walk(games).round() as i32
}

/// Confidence-blended estimate for matchmaking while placement is still in
/// progress. Approaches the walk as the player closes in on the required
/// game count.
pub fn provisional_estimate(games: &[PlacementGame]) -> i32 {
    let base = f64::from(BASE_PLACEMENT_RATING);
    let confidence = (games.len() as f64 / f64::from(PLACEMENT_REQUIRED)).min(1.0);
    (base + (placement_walk(games) - base) * confidence).round() as i32
}

pub fn tier_of(rating: i32) -> u32 {
    ((rating.max(0) / TIER_WIDTH) as u32).min(MAX_TIER)
}

pub fn tier_mid(tier: u32) -> i32 {
    tier.min(MAX_TIER) as i32 * TIER_WIDTH + TIER_WIDTH / 2
}

/// Highest tier whose mid-rating would still score at least the
/// overperformance floor for these averages.
pub fn infer_overperformance_tier(avg_wpm: f64, avg_accuracy: f64) -> Option<u32> {
    (0..=MAX_TIER)
        .rev()
        .find(|t| combat_score(avg_wpm, avg_accuracy, Some(tier_mid(*t))) >= OVERPERFORMANCE_SCORE_FLOOR)
}

/// Overperformance accelerator: a ranked player consistently scoring two or
/// more tiers above their rating is snapped up to the inferred band's
/// mid-point. Returns the promoted rating, or `None` when no promotion
/// applies.
pub fn overperformance_promotion(current_rating: i32, recent: &[HistorySample]) -> Option<i32> {
    let usable: Vec<(f64, f64)> = recent
        .iter()
        .filter_map(|s| Some((s.wpm?, s.accuracy?)))
        .collect();
    if usable.len() < OVERPERFORMANCE_MIN_SAMPLES {
        return None;
    }

    let avg_accuracy = usable.iter().map(|(_, a)| a).sum::<f64>() / usable.len() as f64;
    if avg_accuracy < OVERPERFORMANCE_MIN_ACCURACY {
        return None;
    }
    let avg_wpm = usable.iter().map(|(w, _)| w).sum::<f64>() / usable.len() as f64;

    let inferred = infer_overperformance_tier(avg_wpm, avg_accuracy)?;
    let current_tier = tier_of(current_rating);
    if inferred < current_tier + 2 {
        return None;
    }

    let target = inferred.min(current_tier + 2).min(MAX_TIER);
    Some(tier_mid(target).max(current_rating))
}

/// Competitive-rating state after a ranked match has produced `new_rating`
/// and `delta`. Promotion needs both the Apex threshold and a leaderboard
/// slot; demotion clears the rating whenever the main rating falls back
/// below the threshold.
pub fn competitive_after_match(
    new_rating: i32,
    current_competitive: Option<i32>,
    delta: i32,
    leaderboard_position: i64,
) -> Option<i32> {
    if new_rating < APEX_THRESHOLD {
        return None;
    }
    match current_competitive {
        Some(competitive) => Some((competitive + delta).max(0)),
        None if leaderboard_position <= APEX_LEADERBOARD_SLOTS => Some(0),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(won: bool, wpm: f64, accuracy: f64, consistency: f64, opponent: Option<i32>) -> PlacementGame {
        PlacementGame { won, wpm, accuracy, consistency, opponent_rating: opponent }
    }

    #[test]
    fn empty_placement_seeds_at_base() {
        assert_eq!(calculate_placement_rating(&[]), BASE_PLACEMENT_RATING);
    }

    #[test]
    fn stronger_opposition_places_higher() {
        let unrated: Vec<_> = (0..5).map(|_| game(true, 70.0, 0.95, 0.8, None)).collect();
        let strong: Vec<_> = (0..5).map(|_| game(true, 70.0, 0.95, 0.8, Some(1400))).collect();
        assert!(calculate_placement_rating(&strong) > calculate_placement_rating(&unrated));
    }

    #[test]
    fn wins_place_higher_than_losses() {
        let wins: Vec<_> = (0..5).map(|_| game(true, 60.0, 0.94, 0.8, None)).collect();
        let losses: Vec<_> = (0..5).map(|_| game(false, 60.0, 0.94, 0.8, None)).collect();
        assert!(calculate_placement_rating(&wins) > calculate_placement_rating(&losses));
    }

    #[test]
    fn placement_cannot_reach_apex() {
        let crushing: Vec<_> = (0..5).map(|_| game(true, 200.0, 1.0, 1.0, Some(2200))).collect();
        assert!(calculate_placement_rating(&crushing) <= MAX_PLACEMENT_RATING);
    }

    #[test]
    fn provisional_estimate_blends_toward_base() {
        let two_wins: Vec<_> = (0..2).map(|_| game(true, 90.0, 0.97, 0.9, Some(1300))).collect();
        let provisional = provisional_estimate(&two_wins);
        let full = calculate_placement_rating(&two_wins);
        assert!(provisional > BASE_PLACEMENT_RATING);
        assert!(provisional < full);
    }

    #[test]
    fn tier_arithmetic() {
        assert_eq!(tier_of(0), 0);
        assert_eq!(tier_of(1050), 10);
        assert_eq!(tier_of(2099), 20);
        assert_eq!(tier_of(5000), MAX_TIER);
        assert_eq!(tier_mid(10), 1050);
        assert_eq!(tier_mid(20), 2050);
    }

    #[test]
    fn overperformance_needs_enough_samples() {
        let few = vec![HistorySample { wpm: Some(140.0), accuracy: Some(0.98) }; 5];
        assert_eq!(overperformance_promotion(900, &few), None);
    }

    #[test]
    fn overperformance_needs_accuracy() {
        let sloppy = vec![HistorySample { wpm: Some(140.0), accuracy: Some(0.85) }; 8];
        assert_eq!(overperformance_promotion(900, &sloppy), None);
    }

    #[test]
    fn overperformance_promotes_two_tiers_and_snaps_to_mid() {
        let dominant = vec![HistorySample { wpm: Some(160.0), accuracy: Some(0.98) }; 8];
        let promoted = overperformance_promotion(850, &dominant).expect("promotion");
        // Two tiers up from tier 8 is tier 10, whose mid-point is 1050.
        assert_eq!(promoted, tier_mid(10));
    }

    #[test]
    fn overperformance_ignores_small_gaps() {
        // Good but only one band above: no promotion.
        let solid = vec![HistorySample { wpm: Some(78.0), accuracy: Some(0.95) }; 8];
        let inferred = infer_overperformance_tier(78.0, 0.95);
        if let Some(t) = inferred {
            assert!(t < tier_of(1050) + 2);
        }
        assert_eq!(overperformance_promotion(1050, &solid), None);
    }

    #[test]
    fn competitive_promotion_and_demotion() {
        // First promotion starts at zero.
        assert_eq!(competitive_after_match(2110, None, 18, 900), Some(0));
        // Outside the leaderboard slots: no promotion.
        assert_eq!(competitive_after_match(2110, None, 18, 2000), None);
        // In Apex, delta tracks and floors at zero.
        assert_eq!(competitive_after_match(2150, Some(40), -25, 100), Some(15));
        assert_eq!(competitive_after_match(2150, Some(10), -25, 100), Some(0));
        // Demotion clears in the same write.
        assert_eq!(competitive_after_match(2080, Some(40), -30, 100), None);
    }
}
