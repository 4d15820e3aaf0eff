pub mod config;
pub mod consts;
pub mod matchmaking;
pub mod message;
pub mod rating;
pub mod scoring;
pub mod shutdown;
pub mod telemetry;
pub mod textgen;
pub mod timesync;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Current wall clock as epoch milliseconds. All wire timestamps use this.
pub fn timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
