//! Configuration types for the companion pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for every millisecond interval and timeout (one day).
///
/// Worker deadlines are computed as `Instant + Duration`, which panics on
/// overflow.
pub const MAX_INTERVAL_MS: u64 = 86_400_000;

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Channel capacities and overflow behaviour.
    pub channels: ChannelConfig,
    /// Worker loop timing and dispatch limits.
    pub workers: WorkerConfig,
    /// Speech generation/playback settings.
    pub speech: SpeechConfig,
    /// Response distributor settings.
    pub distributor: DistributorConfig,
    /// Vision look-up settings.
    pub vision: VisionConfig,
    /// Animation dispatch settings.
    pub animation: AnimationConfig,
    /// Health monitor settings.
    pub health: HealthConfig,
    /// Shutdown protocol timeouts.
    pub shutdown: ShutdownConfig,
}

/// Behaviour of a backpressure queue when a put arrives while full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item silently (ring buffer, producer never told).
    OverwriteOldest,
    /// Evict the oldest queued item and count it as dropped.
    #[default]
    DropOldest,
    /// Refuse the incoming item; the queue is left untouched.
    RejectNewest,
}

/// Per-channel capacities and watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Raw-input ring buffer of transcriptions.
    pub transcription_capacity: usize,
    /// Structured replies waiting for the distributor.
    pub reply_capacity: usize,
    /// Sentence jobs waiting for speech generation.
    pub speech_capacity: usize,
    /// Rendered audio chunks waiting for playback.
    pub audio_capacity: usize,
    /// Animation requests (ring buffer; only the latest few matter).
    pub animation_capacity: usize,
    /// Overflow policy for the mid-pipeline backpressure queues.
    pub overflow_policy: OverflowPolicy,
    /// Fill ratio at which the backpressure flag turns on.
    pub high_watermark: f32,
    /// Fill ratio at which the backpressure flag turns off again.
    pub low_watermark: f32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transcription_capacity: 16,
            reply_capacity: 8,
            speech_capacity: 32,
            audio_capacity: 8,
            animation_capacity: 4,
            overflow_policy: OverflowPolicy::DropOldest,
            high_watermark: 0.8,
            low_watermark: 0.5,
        }
    }
}

/// Worker loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum time a worker blocks on a channel `get` before re-checking signals.
    pub poll_interval_ms: u64,
    /// Threads in each bounded executor.
    pub executor_size: usize,
    /// How long a new request waits for the outstanding reply before being dropped.
    pub dispatch_wait_timeout_ms: u64,
    /// Transcriptions below this confidence are ignored.
    pub min_confidence: f32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            executor_size: 2,
            dispatch_wait_timeout_ms: 3_000,
            min_confidence: 0.0,
        }
    }
}

impl WorkerConfig {
    /// Poll interval as a [`Duration`], never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Single-flight wait timeout as a [`Duration`].
    pub fn dispatch_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_wait_timeout_ms)
    }
}

/// Speech pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Whether voice output starts enabled.
    pub enabled: bool,
    /// Maximum concurrent syntheses (also the speech executor size).
    pub max_in_flight: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: 2,
        }
    }
}

/// Response distributor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Delay after a reply before the status UI is reset and the avatar rests.
    pub tail_delay_ms: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            tail_delay_ms: 1_500,
        }
    }
}

/// Vision look-up settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Whether "look at camera" side effects are honoured.
    pub enabled: bool,
    /// Minimum spacing between two look-ups.
    ///
    /// The look result re-enters the pipeline as a new transcription, so this
    /// is what keeps a reply that always asks to look from feeding itself.
    pub min_interval_ms: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: 10_000,
        }
    }
}

/// Animation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    /// Canonical resting animation shown after replies and interrupts.
    pub resting: String,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            resting: "idle".to_owned(),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health polls.
    pub interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

impl HealthConfig {
    /// Poll interval as a [`Duration`], never zero.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Shutdown protocol timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Budget for joining all workers on the first pass.
    pub timeout_ms: u64,
    /// Budget for the forced second pass.
    pub forced_timeout_ms: u64,
    /// Join budget for background (non-critical) workers.
    pub background_join_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            forced_timeout_ms: 1_000,
            background_join_timeout_ms: 500,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn forced_timeout(&self) -> Duration {
        Duration::from_millis(self.forced_timeout_ms)
    }

    pub fn background_join_timeout(&self) -> Duration {
        Duration::from_millis(self.background_join_timeout_ms)
    }
}

impl CompanionConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::CompanionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::CompanionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/companion/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("companion").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("companion")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/companion-config/config.toml")
        }
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Config`](crate::error::CompanionError::Config)
    /// naming the first offending field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let ch = &self.channels;
        let capacities = [
            ("channels.transcription_capacity", ch.transcription_capacity),
            ("channels.reply_capacity", ch.reply_capacity),
            ("channels.speech_capacity", ch.speech_capacity),
            ("channels.audio_capacity", ch.audio_capacity),
            ("channels.animation_capacity", ch.animation_capacity),
            ("workers.executor_size", self.workers.executor_size),
            ("speech.max_in_flight", self.speech.max_in_flight),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return Err(crate::error::CompanionError::Config(format!(
                    "{field} must be at least 1"
                )));
            }
        }

        let intervals = [
            ("workers.poll_interval_ms", self.workers.poll_interval_ms, 1),
            ("health.interval_ms", self.health.interval_ms, 1),
            (
                "workers.dispatch_wait_timeout_ms",
                self.workers.dispatch_wait_timeout_ms,
                0,
            ),
            ("distributor.tail_delay_ms", self.distributor.tail_delay_ms, 0),
            ("vision.min_interval_ms", self.vision.min_interval_ms, 0),
            ("shutdown.timeout_ms", self.shutdown.timeout_ms, 0),
            ("shutdown.forced_timeout_ms", self.shutdown.forced_timeout_ms, 0),
            (
                "shutdown.background_join_timeout_ms",
                self.shutdown.background_join_timeout_ms,
                0,
            ),
        ];
        for (field, value, min) in intervals {
            if !(min..=MAX_INTERVAL_MS).contains(&value) {
                return Err(crate::error::CompanionError::Config(format!(
                    "{field} must be between {min} and {MAX_INTERVAL_MS}, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&ch.low_watermark)
            || !(0.0..=1.0).contains(&ch.high_watermark)
            || ch.low_watermark >= ch.high_watermark
        {
            return Err(crate::error::CompanionError::Config(format!(
                "watermarks must satisfy 0 <= low ({}) < high ({}) <= 1",
                ch.low_watermark, ch.high_watermark
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CompanionConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.workers.poll_interval_ms > 0);
        assert_eq!(config.workers.executor_size, 2);
        assert_eq!(config.channels.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.animation.resting, "idle");
        assert!(config.speech.enabled);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CompanionConfig::default();
        config.channels.reply_capacity = 3;
        config.channels.overflow_policy = OverflowPolicy::RejectNewest;
        config.animation.resting = "sleepy".to_owned();
        config.save_to_file(&path).unwrap();

        let loaded = CompanionConfig::from_file(&path).unwrap();
        assert_eq!(loaded.channels.reply_capacity, 3);
        assert_eq!(loaded.channels.overflow_policy, OverflowPolicy::RejectNewest);
        assert_eq!(loaded.animation.resting, "sleepy");
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = CompanionConfig::from_file(std::path::Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is [not valid toml").unwrap();
        let result = CompanionConfig::from_file(&path);
        assert!(matches!(result, Err(crate::error::CompanionError::Config(_))));
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: CompanionConfig = toml::from_str("[workers]\npoll_interval_ms = 50\n").unwrap();
        assert_eq!(config.workers.poll_interval_ms, 50);
        assert_eq!(config.workers.executor_size, 2);
        assert_eq!(config.shutdown.timeout_ms, 5_000);
    }

    #[test]
    fn overflow_policy_deserializes() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: OverflowPolicy,
        }

        let w: Wrapper = toml::from_str(r#"policy = "overwrite_oldest""#).unwrap();
        assert_eq!(w.policy, OverflowPolicy::OverwriteOldest);
        let w: Wrapper = toml::from_str(r#"policy = "drop_oldest""#).unwrap();
        assert_eq!(w.policy, OverflowPolicy::DropOldest);
        let w: Wrapper = toml::from_str(r#"policy = "reject_newest""#).unwrap();
        assert_eq!(w.policy, OverflowPolicy::RejectNewest);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = CompanionConfig::default();
        config.channels.audio_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channels.audio_capacity"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = CompanionConfig::default();
        config.workers.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers.poll_interval_ms"));
    }

    #[test]
    fn huge_intervals_are_rejected() {
        let mut config = CompanionConfig::default();
        config.workers.poll_interval_ms = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers.poll_interval_ms"));

        let mut config = CompanionConfig::default();
        config.shutdown.timeout_ms = MAX_INTERVAL_MS + 1;
        assert!(config.validate().is_err());

        let mut config = CompanionConfig::default();
        config.distributor.tail_delay_ms = 0;
        config.health.interval_ms = MAX_INTERVAL_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_watermarks_are_rejected() {
        let mut config = CompanionConfig::default();
        config.channels.low_watermark = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = CompanionConfig::default_config_path();
        assert!(path.ends_with("companion/config.toml"));
    }
}
