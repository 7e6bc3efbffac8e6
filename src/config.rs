//! Ceremony timing and consensus constants

use std::time::Duration;

/// The lottery seed is sampled this many blocks before the lottery block
pub const LOTTERY_SEED_LAG: u64 = 100;

/// Flips every candidate must solve in the short session
pub const SHORT_SESSION_FLIPS_COUNT: usize = 5;

/// Target number of long-session testers per flip
pub const LONG_SESSION_TESTERS: usize = 10;

/// Words available for flip pair derivation
pub const WORD_DICTIONARY_SIZE: usize = 3300;

// Identity score thresholds
pub const MIN_SHORT_SCORE: f32 = 0.5;
pub const MIN_LONG_SCORE: f32 = 0.75;
pub const MIN_TOTAL_SCORE: f32 = 0.75;

/// Qualified-flips count above which the cumulative total score gates
/// promotion and survival
pub const TOTAL_QUALIFIED_FLIPS_THRESHOLD: u32 = 10;

/// Validation session timing
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub validation_interval: Duration,
    pub flip_lottery_duration: Duration,
    pub short_session_duration: Duration,
    pub long_session_duration: Duration,
    pub after_long_session_duration: Duration,
    /// Grace window after the short session during which evidence
    /// keeps accumulating
    pub evidence_grace: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            validation_interval: Duration::from_secs(20 * 60),
            flip_lottery_duration: Duration::from_secs(30),
            short_session_duration: Duration::from_secs(60),
            long_session_duration: Duration::from_secs(60),
            after_long_session_duration: Duration::from_secs(30),
            evidence_grace: Duration::from_secs(15),
        }
    }
}

impl ValidationConfig {
    /// Total ceremony wall time, used to decide whether a syncing node
    /// should still interact with the network
    pub fn ceremony_duration(&self) -> Duration {
        self.flip_lottery_duration
            + self.short_session_duration
            + self.long_session_duration
            + self.after_long_session_duration
            + Duration::from_secs(5 * 60)
    }
}
