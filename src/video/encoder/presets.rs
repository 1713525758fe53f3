//! Encoder presets
//!
//! A preset expands into a complete property bundle. The bundle is computed
//! up front and only stored once every property has been applied, so a
//! half-applied preset is never visible.

use serde::{Deserialize, Serialize};

use super::traits::{Profile, VideoCodec};

/// Encoder preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderPreset {
    /// Shortest GOP, no B-frames
    LowLatency,
    #[default]
    Balanced,
    /// The only preset that enables frame reordering
    HighQuality,
    /// Cheaper quality setting for battery and thermal headroom
    PowerEfficient,
}

impl EncoderPreset {
    pub fn bundle(&self) -> PresetBundle {
        match self {
            EncoderPreset::LowLatency => PresetBundle {
                quality: 0.50,
                keyframe_interval_secs: 1.0,
                allow_frame_reordering: false,
            },
            EncoderPreset::Balanced => PresetBundle {
                quality: 0.65,
                keyframe_interval_secs: 2.0,
                allow_frame_reordering: false,
            },
            EncoderPreset::HighQuality => PresetBundle {
                quality: 0.85,
                keyframe_interval_secs: 2.0,
                allow_frame_reordering: true,
            },
            EncoderPreset::PowerEfficient => PresetBundle {
                quality: 0.55,
                keyframe_interval_secs: 2.0,
                allow_frame_reordering: false,
            },
        }
    }

    /// Profile to start the degradation chain from
    pub fn initial_profile(&self, codec: VideoCodec) -> Profile {
        match (codec, self) {
            (VideoCodec::H265, _) => Profile::Main,
            (_, EncoderPreset::HighQuality | EncoderPreset::Balanced) => Profile::High,
            (_, EncoderPreset::LowLatency | EncoderPreset::PowerEfficient) => Profile::Main,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EncoderPreset::LowLatency => "Low latency",
            EncoderPreset::Balanced => "Balanced",
            EncoderPreset::HighQuality => "High quality",
            EncoderPreset::PowerEfficient => "Power efficient",
        }
    }
}

impl std::fmt::Display for EncoderPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Properties a preset fixes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetBundle {
    /// 0.0 - 1.0
    pub quality: f32,
    pub keyframe_interval_secs: f32,
    pub allow_frame_reordering: bool,
}

impl PresetBundle {
    /// Key-frame interval in frames for a frame rate (at least 1)
    pub fn keyframe_interval_frames(&self, fps: u32) -> u32 {
        ((fps as f32 * self.keyframe_interval_secs).round() as u32).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_high_quality_reorders() {
        for preset in [
            EncoderPreset::LowLatency,
            EncoderPreset::Balanced,
            EncoderPreset::PowerEfficient,
        ] {
            assert!(!preset.bundle().allow_frame_reordering);
        }
        assert!(EncoderPreset::HighQuality.bundle().allow_frame_reordering);
    }

    #[test]
    fn test_keyframe_interval_between_one_and_two_seconds() {
        for preset in [
            EncoderPreset::LowLatency,
            EncoderPreset::Balanced,
            EncoderPreset::HighQuality,
            EncoderPreset::PowerEfficient,
        ] {
            let secs = preset.bundle().keyframe_interval_secs;
            assert!((1.0..=2.0).contains(&secs));
        }
        assert_eq!(EncoderPreset::Balanced.bundle().keyframe_interval_frames(30), 60);
        assert_eq!(EncoderPreset::LowLatency.bundle().keyframe_interval_frames(25), 25);
        assert_eq!(EncoderPreset::LowLatency.bundle().keyframe_interval_frames(0), 1);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&EncoderPreset::HighQuality).unwrap();
        assert_eq!(json, "\"high_quality\"");
    }
}
