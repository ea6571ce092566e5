use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// What the follower shows after a transition gave up on its target clip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Keep the last committed frame paused while the master keeps running.
    #[default]
    HoldLastFrame,
    /// Switch to the target clip's first frame without resuming it, when the
    /// target has an element at all.
    ShowNextFirstFrame,
}

/// Tunables of the synchronization engine.
///
/// Every field has a default, so a JSON document only needs to name the
/// values it overrides. Durations are written as milliseconds.
///
/// # Example
/// ```
/// use timeline_sync::config::SyncConfig;
///
/// let config = SyncConfig::from_json_str(r#"{ "max_mb": 500, "forward_distance": 2 }"#)
///     .expect("valid config");
/// assert_eq!(config.max_mb, 500);
/// assert_eq!(config.back_distance, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub back_distance: usize,
    pub forward_distance: usize,
    pub max_mb: u64,
    pub max_slots: usize,
    /// Used when the resolver cannot estimate a clip's size.
    pub fallback_clip_estimate_mb: u64,
    pub ready_threshold: u8,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_base: Duration,
    #[serde(with = "millis")]
    pub retry_cap: Duration,
    #[serde(with = "millis")]
    pub load_timeout: Duration,
    #[serde(with = "millis")]
    pub transition_timeout: Duration,
    #[serde(with = "millis")]
    pub verify_grace: Duration,
    #[serde(with = "millis")]
    pub drift_epsilon: Duration,
    #[serde(with = "millis")]
    pub sample_interval: Duration,
    #[serde(with = "millis")]
    pub stall_threshold: Duration,
    /// Minimal follower health before a tempo rate is applied.
    pub rate_min_health: u8,
    pub exhausted_policy: ExhaustedPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            back_distance: 1,
            forward_distance: 3,
            max_mb: 512,
            max_slots: 5,
            fallback_clip_estimate_mb: 64,
            ready_threshold: 75,
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(8),
            load_timeout: Duration::from_secs(15),
            transition_timeout: Duration::from_secs(5),
            verify_grace: Duration::from_millis(500),
            drift_epsilon: Duration::from_millis(150),
            sample_interval: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(3),
            rate_min_health: 25,
            exhausted_policy: ExhaustedPolicy::HoldLastFrame,
        }
    }
}

impl SyncConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason| Err(SyncError::InvalidConfig { reason });
        if self.max_slots == 0 {
            return invalid("max_slots must be positive");
        }
        if self.max_mb == 0 {
            return invalid("max_mb must be positive");
        }
        if self.ready_threshold == 0 || self.ready_threshold > 100 {
            return invalid("ready_threshold must be within 1..=100");
        }
        if self.rate_min_health > 100 {
            return invalid("rate_min_health must be within 0..=100");
        }
        if self.retry_base.is_zero() || self.retry_cap < self.retry_base {
            return invalid("retry_cap must be at least retry_base and both positive");
        }
        if self.sample_interval.is_zero() {
            return invalid("sample_interval must be positive");
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use timeline_sync::config::SyncConfig;
    ///
    /// let config = SyncConfig::default();
    /// assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
    /// assert_eq!(config.backoff_delay(10), Duration::from_secs(8));
    /// ```
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.retry_cap)
            .min(self.retry_cap)
    }
}

/// Reads and validates a JSON config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<SyncConfig> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|error| SyncError::ConfigIo {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;
    SyncConfig::from_json_str(&json)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
