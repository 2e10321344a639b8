//! Temporal decay of memory scores.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::MemoryMetadata;
use crate::config::{DecayMode, TemporalDecayConfig};
use crate::memory::MessageLog;

/// `max(0.5^(age / half_life), floor)`, with negative ages treated as zero.
pub fn decay_factor(age: f64, half_life: f64, floor: f64) -> f64 {
    if half_life <= 0.0 || !age.is_finite() {
        return 1.0;
    }
    let age = age.max(0.0);
    0.5f64.powf(age / half_life).max(floor).min(1.0)
}

/// What decay needs to know about one memory.
pub struct DecayInput<'a> {
    pub metadata: &'a MemoryMetadata,
    pub now: DateTime<Utc>,
    pub messages: Option<&'a dyn MessageLog>,
}

fn parse_timestamp(metadata: &MemoryMetadata) -> Option<DateTime<Utc>> {
    let raw = metadata.timestamp.as_deref()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!(timestamp = raw, error = %e, "Unparseable memory timestamp, skipping decay");
            None
        }
    }
}

impl DecayInput<'_> {
    /// Age in the unit of `mode`, or `None` when it cannot be determined.
    async fn age(&self, mode: DecayMode) -> Option<f64> {
        match mode {
            DecayMode::Time => {
                let stored = parse_timestamp(self.metadata)?;
                let seconds = (self.now - stored).num_seconds() as f64;
                Some(seconds / 3600.0)
            }
            DecayMode::MessageCount => {
                if let Some(age) = self.metadata.message_age {
                    return Some(age as f64);
                }
                let stored = parse_timestamp(self.metadata)?;
                let scene_id = self.metadata.scene_id?;
                let log = self.messages?;
                match log.messages_since(scene_id, stored).await {
                    Ok(count) => Some(count as f64),
                    Err(e) => {
                        warn!(scene_id, error = %e, "Message count lookup failed, skipping decay");
                        None
                    }
                }
            }
        }
    }

    /// Multiply `score` by the decay factor. Exempt memories, disabled decay
    /// and undeterminable ages leave it unchanged.
    pub async fn apply(&self, score: f32, config: &TemporalDecayConfig) -> f32 {
        if !config.enabled || self.metadata.decay_exempt {
            return score;
        }
        match self.age(config.mode).await {
            Some(age) => score * decay_factor(age, config.half_life, config.floor) as f32,
            None => score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stamped(hours_ago: i64, now: DateTime<Utc>) -> MemoryMetadata {
        MemoryMetadata {
            timestamp: Some((now - Duration::hours(hours_ago)).to_rfc3339()),
            ..MemoryMetadata::default()
        }
    }

    #[test]
    fn test_factor_halves_at_half_life() {
        assert!((decay_factor(10.0, 10.0, 0.0) - 0.5).abs() < 1e-9);
        assert!((decay_factor(20.0, 10.0, 0.0) - 0.25).abs() < 1e-9);
        assert_eq!(decay_factor(0.0, 10.0, 0.0), 1.0);
        assert_eq!(decay_factor(-5.0, 10.0, 0.0), 1.0);
    }

    #[test]
    fn test_factor_respects_floor() {
        assert_eq!(decay_factor(1000.0, 1.0, 0.3), 0.3);
    }

    #[tokio::test]
    async fn test_time_mode_older_scores_lower() {
        let now = Utc::now();
        let config = TemporalDecayConfig::time(24.0, 0.0);
        let fresh = stamped(1, now);
        let stale = stamped(48, now);

        let fresh_score = DecayInput { metadata: &fresh, now, messages: None }
            .apply(1.0, &config)
            .await;
        let stale_score = DecayInput { metadata: &stale, now, messages: None }
            .apply(1.0, &config)
            .await;
        assert!(fresh_score > stale_score);
        assert!((stale_score - 0.25).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_malformed_timestamp_leaves_score() {
        let now = Utc::now();
        let metadata = MemoryMetadata {
            timestamp: Some("last tuesday".to_string()),
            ..MemoryMetadata::default()
        };
        let score = DecayInput { metadata: &metadata, now, messages: None }
            .apply(0.7, &TemporalDecayConfig::time(1.0, 0.0))
            .await;
        assert_eq!(score, 0.7);
    }

    #[tokio::test]
    async fn test_exempt_and_disabled() {
        let now = Utc::now();
        let mut metadata = stamped(500, now);
        let disabled = TemporalDecayConfig::default();
        let input = DecayInput { metadata: &metadata, now, messages: None };
        assert_eq!(input.apply(0.9, &disabled).await, 0.9);

        metadata.decay_exempt = true;
        let input = DecayInput { metadata: &metadata, now, messages: None };
        assert_eq!(input.apply(0.9, &TemporalDecayConfig::time(1.0, 0.0)).await, 0.9);
    }

    #[tokio::test]
    async fn test_message_age_from_metadata() {
        let metadata = MemoryMetadata {
            message_age: Some(10),
            ..MemoryMetadata::default()
        };
        let input = DecayInput { metadata: &metadata, now: Utc::now(), messages: None };
        let score = input.apply(1.0, &TemporalDecayConfig::message_count(10.0, 0.0)).await;
        assert!((score - 0.5).abs() < 1e-6);
    }
}
