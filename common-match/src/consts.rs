//! Tuning constants for the ranked match core. These values are part of the
//! persisted-data contract; changing them changes rating semantics.

/// Provisional rating every account calibrates around.
pub const BASE_PLACEMENT_RATING: i32 = 1050;

/// Placement can never seed an account at or above Apex.
pub const MAX_PLACEMENT_RATING: i32 = 2099;

/// Qualifying games before an initial rating is computed.
pub const PLACEMENT_REQUIRED: u32 = 5;

/// Ceiling on round damage regardless of score gap.
pub const MAX_DAMAGE_PER_ROUND: i32 = 35;

/// Main rating at which the competitive ladder opens.
pub const APEX_THRESHOLD: i32 = 2100;

/// Leaderboard positions eligible for a competitive rating.
pub const APEX_LEADERBOARD_SLOTS: i64 = 1500;

/// Plausibility clamp for ranked round submissions (chars per second).
pub const MAX_CHARS_PER_SEC_RANKED: u32 = 45;

/// Plausibility clamp for daily-challenge submissions.
pub const MAX_CHARS_PER_SEC_DAILY: u32 = 20;

/// Continuous disconnection longer than this forfeits the match.
pub const RECONNECT_GRACE_MS: u64 = 30_000;

/// Late submissions are accepted this long past the round time limit.
pub const SUBMIT_GRACE_MS: u64 = 30_000;

pub const DEFAULT_MAX_ROUNDS: u32 = 6;
pub const DEFAULT_BREAK_SECONDS: u32 = 7;
pub const DEFAULT_COUNTDOWN_SECONDS: u32 = 3;
pub const DEFAULT_PREP_SECONDS: u32 = 10;
pub const DEFAULT_ROUND_TIME_SECONDS: u32 = 60;
pub const DEFAULT_TEXT_LENGTH: usize = 250;

/// Rounds that make up regulation; overtime bookkeeping starts here even
/// when a config allows more rounds.
pub const REGULATION_ROUNDS: u32 = 6;

/// Draw-vote window length once overtime opens one.
pub const DRAW_WINDOW_SECONDS: u32 = 5;

pub const INITIAL_HP: i32 = 100;

/// Per-connection token bucket: burst capacity and steady refill.
pub const RATE_LIMIT_BURST: f64 = 30.0;
pub const RATE_LIMIT_REFILL_PER_SEC: f64 = 10.0;

/// K-factor for the per-match Elo update.
pub const ELO_K: f64 = 32.0;

/// K-factor for the placement calibration walk.
pub const PLACEMENT_K: f64 = 40.0;

/// Flat extra rating loss applied to a forfeiter on top of the Elo delta.
pub const FORFEIT_PENALTY: i32 = 15;

/// Rating tiers are 100 points wide; index 20 (Velocity 3) is the last.
pub const TIER_WIDTH: i32 = 100;
pub const MAX_TIER: u32 = 20;

/// Combat score a tier's mid-rating must sustain for the overperformance
/// accelerator to infer that tier.
pub const OVERPERFORMANCE_SCORE_FLOOR: f64 = 82.0;

/// Games inspected and minimum usable samples for the accelerator.
pub const OVERPERFORMANCE_WINDOW: usize = 10;
pub const OVERPERFORMANCE_MIN_SAMPLES: usize = 6;
pub const OVERPERFORMANCE_MIN_ACCURACY: f64 = 0.90;
