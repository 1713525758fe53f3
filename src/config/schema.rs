use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::video::encoder::{BackendPreference, EncoderPreset, VideoCodec};
use crate::video::format::Resolution;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// What to stream and where
    pub stream: StreamSettings,
    /// Encoder session recovery tuning
    pub encoder: EncoderConfig,
    /// Publish connection supervision
    pub connection: ConnectionConfig,
    /// Adaptive quality controller
    pub quality: QualityConfig,
    /// Queue and pool sizing
    pub pipeline: PipelineConfig,
}

/// Stream settings
///
/// The user's copy is the contract the quality controller must stay within;
/// the pipeline keeps a second, active copy it may adjust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Publish URL, e.g. `rtmp://live.example.com/app`
    pub url: String,
    /// Stream key appended when publishing
    pub stream_key: String,
    /// Output resolution
    pub resolution: Resolution,
    /// Video bitrate in kbps
    pub video_bitrate_kbps: u32,
    /// Audio bitrate in kbps
    pub audio_bitrate_kbps: u32,
    /// Target frame rate
    pub fps: u32,
    pub preset: EncoderPreset,
    pub codec: VideoCodec,
    pub backend: BackendPreference,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream_key: String::new(),
            resolution: Resolution::HD720,
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            fps: 30,
            preset: EncoderPreset::Balanced,
            codec: VideoCodec::H264,
            backend: BackendPreference::Auto,
        }
    }
}

/// Schemes the publish URL may use
const URL_SCHEMES: &[&str] = &["rtmp", "rtmps", "tcp"];

impl StreamSettings {
    /// Check the settings before anything is opened
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(ConfigurationError::MissingUrl);
        }
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ConfigurationError::InvalidUrl {
                url: url.to_string(),
                reason: "missing scheme".to_string(),
            })?;
        if !URL_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
            return Err(ConfigurationError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", scheme),
            });
        }
        if rest.split('/').next().unwrap_or_default().is_empty() {
            return Err(ConfigurationError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }
        if self.stream_key.trim().is_empty() {
            return Err(ConfigurationError::MissingStreamKey);
        }
        if !self.resolution.is_valid() {
            return Err(ConfigurationError::InvalidSetting {
                field: "resolution",
                reason: format!(
                    "{} outside {}..{}",
                    self.resolution,
                    Resolution::MIN,
                    Resolution::MAX
                ),
            });
        }
        if self.video_bitrate_kbps == 0 {
            return Err(ConfigurationError::InvalidSetting {
                field: "video_bitrate_kbps",
                reason: "must be positive".to_string(),
            });
        }
        if !(1..=120).contains(&self.fps) {
            return Err(ConfigurationError::InvalidSetting {
                field: "fps",
                reason: format!("{} not in 1..=120", self.fps),
            });
        }
        Ok(())
    }

    /// Whether switching to `other` needs a new encoder session
    ///
    /// Bitrate and frame rate can be changed on a running session.
    pub fn requires_session_rebuild(&self, other: &StreamSettings) -> bool {
        self.resolution != other.resolution
            || self.codec != other.codec
            || self.backend != other.backend
            || self.preset != other.preset
    }

    /// Whether switching to `other` needs a new publish connection
    pub fn requires_reconnect(&self, other: &StreamSettings) -> bool {
        self.url != other.url || self.stream_key != other.stream_key
    }
}

/// Stream fields given on the command line
///
/// They win over the file, including after a reload.
#[derive(Debug, Clone, Default)]
pub struct StreamOverrides {
    pub url: Option<String>,
    pub stream_key: Option<String>,
    pub resolution: Option<Resolution>,
    pub fps: Option<u32>,
    pub video_bitrate_kbps: Option<u32>,
}

impl StreamOverrides {
    pub fn apply(&self, settings: &mut StreamSettings) {
        if let Some(url) = &self.url {
            settings.url = url.clone();
        }
        if let Some(key) = &self.stream_key {
            settings.stream_key = key.clone();
        }
        if let Some(resolution) = self.resolution {
            settings.resolution = resolution;
        }
        if let Some(fps) = self.fps {
            settings.fps = fps;
        }
        if let Some(bitrate) = self.video_bitrate_kbps {
            settings.video_bitrate_kbps = bitrate;
        }
    }
}

/// Encoder session recovery tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Hardware attempts before the software fallback
    pub max_hardware_attempts: u32,
    /// Pause unit between attempts (pause = attempt x unit)
    pub retry_pause_ms: u64,
    /// Frames in the rolling error-rate window
    pub error_window: usize,
    /// Samples required before the error rate is trusted
    pub error_min_samples: usize,
    /// Error rate above which the session is recreated
    pub error_rate_threshold: f64,
    /// Encoder worker mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_hardware_attempts: 3,
            retry_pause_ms: 500,
            error_window: 30,
            error_min_samples: 10,
            error_rate_threshold: 0.10,
            mailbox_capacity: 8,
        }
    }
}

impl EncoderConfig {
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

/// Publish connection supervision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    /// Wait after publish before confirming the server kept the session
    pub settle_delay_ms: u64,
    pub health_interval_ms: u64,
    /// Consecutive failed health checks before reconnecting
    pub health_failure_ceiling: u32,
    pub initial_reconnect_delay_ms: u64,
    pub reconnect_delay_increment_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Failed reconnects before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 8_000,
            publish_timeout_ms: 6_000,
            settle_delay_ms: 1_500,
            health_interval_ms: 15_000,
            health_failure_ceiling: 5,
            initial_reconnect_delay_ms: 8_000,
            reconnect_delay_increment_ms: 4_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 2,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

/// Adaptive quality controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Off unless explicitly enabled
    pub enabled: bool,
    pub interval_ms: u64,
    /// Healthy samples in a row before stepping back up
    pub restore_after: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 5_000,
            restore_after: 3,
        }
    }
}

impl QualityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Queue and pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw frames waiting for normalization
    pub frame_queue: usize,
    /// Frame buffers the normalizer may hold at once
    pub pool_size: usize,
    /// Encoded samples waiting to be sent
    pub sample_queue: usize,
    pub stats_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue: 4,
            pool_size: 8,
            sample_queue: 32,
            stats_interval_ms: 1_000,
        }
    }
}

impl PipelineConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> StreamSettings {
        StreamSettings {
            url: "rtmp://live.example.com/app".to_string(),
            stream_key: "abcd".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_url_and_key() {
        let mut s = valid();
        s.url = " ".to_string();
        assert_eq!(s.validate(), Err(ConfigurationError::MissingUrl));

        s.url = "http://example.com/app".to_string();
        assert!(matches!(
            s.validate(),
            Err(ConfigurationError::InvalidUrl { .. })
        ));

        s.url = "rtmp:///app".to_string();
        assert!(matches!(
            s.validate(),
            Err(ConfigurationError::InvalidUrl { .. })
        ));

        let mut s = valid();
        s.stream_key.clear();
        assert_eq!(s.validate(), Err(ConfigurationError::MissingStreamKey));
    }

    #[test]
    fn test_validate_ranges() {
        let mut s = valid();
        s.fps = 0;
        assert!(matches!(
            s.validate(),
            Err(ConfigurationError::InvalidSetting { field: "fps", .. })
        ));

        let mut s = valid();
        s.resolution = Resolution::new(100, 100);
        assert!(matches!(
            s.validate(),
            Err(ConfigurationError::InvalidSetting {
                field: "resolution",
                ..
            })
        ));
    }

    #[test]
    fn test_rebuild_vs_live_change() {
        let a = valid();
        let mut b = a.clone();
        b.video_bitrate_kbps = 4000;
        b.fps = 25;
        assert!(!a.requires_session_rebuild(&b));

        b.resolution = Resolution::HD1080;
        assert!(a.requires_session_rebuild(&b));
        assert!(!a.requires_reconnect(&b));
    }

    #[test]
    fn test_overrides_only_touch_given_fields() {
        let overrides = StreamOverrides {
            stream_key: Some("cli-key".to_string()),
            video_bitrate_kbps: Some(6000),
            ..Default::default()
        };
        let mut s = valid();
        s.fps = 25;
        overrides.apply(&mut s);
        assert_eq!(s.stream_key, "cli-key");
        assert_eq!(s.video_bitrate_kbps, 6000);
        assert_eq!(s.fps, 25);
        assert_eq!(s.url, "rtmp://live.example.com/app");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"stream":{"url":"rtmp://h/a","fps":25}}"#).unwrap();
        assert_eq!(config.stream.fps, 25);
        assert_eq!(config.stream.video_bitrate_kbps, 2500);
        assert_eq!(config.connection.max_reconnect_attempts, 2);
        assert!(!config.quality.enabled);
    }
}
