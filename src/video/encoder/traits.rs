//! Encoder traits and common types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::VideoFrame;

/// Output codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::H265 => write!(f, "H.265"),
        }
    }
}

/// User preference for the encoder backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Hardware first, software as fallback
    #[default]
    Auto,
    /// Hardware only; fail rather than fall back
    Hardware,
    /// Never touch hardware encoders
    Software,
}

/// Hardware constraint for one session-creation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareRequirement {
    /// Only hardware encoders are eligible
    Required,
    /// Hardware first, software allowed as implicit fallback
    Preferred,
    /// No constraint, priority order only
    Any,
    /// Only software encoders are eligible
    SoftwareOnly,
}

impl HardwareRequirement {
    /// Spec relaxation for hardware attempt `attempt` (1-based)
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => HardwareRequirement::Required,
            2 => HardwareRequirement::Preferred,
            _ => HardwareRequirement::Any,
        }
    }

    pub fn allows(&self, hardware: bool) -> bool {
        match self {
            HardwareRequirement::Required => hardware,
            HardwareRequirement::SoftwareOnly => !hardware,
            HardwareRequirement::Preferred | HardwareRequirement::Any => true,
        }
    }
}

/// Codec profile, in degradation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    High,
    Main,
    Baseline,
}

impl Profile {
    /// Next simpler profile to try when this one is rejected
    pub fn degrade(self) -> Option<Profile> {
        match self {
            Profile::High => Some(Profile::Main),
            Profile::Main => Some(Profile::Baseline),
            Profile::Baseline => None,
        }
    }
}

/// Status codes reported by compression sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderStatus {
    EncoderNotFound,
    Malfunction,
    InsufficientColorData,
    SessionInvalidated,
    AllocationFailed,
    PixelTransferFailed,
    PropertyNotSupported,
    Other(i32),
}

impl fmt::Display for EncoderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderStatus::EncoderNotFound => write!(f, "encoder not found"),
            EncoderStatus::Malfunction => write!(f, "encoder malfunction"),
            EncoderStatus::InsufficientColorData => write!(f, "insufficient color data"),
            EncoderStatus::SessionInvalidated => write!(f, "session invalidated"),
            EncoderStatus::AllocationFailed => write!(f, "allocation failed"),
            EncoderStatus::PixelTransferFailed => write!(f, "pixel transfer failed"),
            EncoderStatus::PropertyNotSupported => write!(f, "property not supported"),
            EncoderStatus::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Everything a factory needs to create a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSpec {
    pub codec: VideoCodec,
    pub resolution: Resolution,
    /// I420 or NV12
    pub input_format: PixelFormat,
    pub hardware: HardwareRequirement,
    /// Only consider the encoder with this name
    pub pinned_encoder: Option<String>,
}

/// One configurable session property
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionProperty {
    /// Average bitrate in kbps
    Bitrate(u32),
    ExpectedFrameRate(u32),
    RealTime(bool),
    /// B-frames
    FrameReordering(bool),
    Profile(Profile),
    /// Max frames between key frames
    KeyframeInterval(u32),
    /// 0.0 - 1.0
    Quality(f32),
}

impl SessionProperty {
    pub fn name(&self) -> &'static str {
        match self {
            SessionProperty::Bitrate(_) => "bitrate",
            SessionProperty::ExpectedFrameRate(_) => "expected_frame_rate",
            SessionProperty::RealTime(_) => "real_time",
            SessionProperty::FrameReordering(_) => "frame_reordering",
            SessionProperty::Profile(_) => "profile",
            SessionProperty::KeyframeInterval(_) => "keyframe_interval",
            SessionProperty::Quality(_) => "quality",
        }
    }
}

/// Encoded output ready for the publish connection
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Bytes,
    pub codec: VideoCodec,
    pub resolution: Resolution,
    pub key_frame: bool,
    /// Sequence of the source frame
    pub sequence: u64,
    /// Presentation time in milliseconds since stream start
    pub pts_ms: u64,
    /// When the source frame was captured
    pub capture_ts: Instant,
}

impl EncodedSample {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An open compression session
///
/// Not Sync: sessions are owned by the single encoder worker task.
pub trait CompressionSession: Send {
    /// Encoder name for logs and events
    fn name(&self) -> &str;

    /// Whether the session actually runs on hardware
    ///
    /// Can be false even for a session created by a hardware factory when
    /// the platform quietly fell back to software.
    fn is_hardware(&self) -> bool;

    fn input_format(&self) -> PixelFormat;

    /// Switch the input pixel format without recreating the session
    fn set_input_format(&mut self, format: PixelFormat) -> Result<(), EncoderStatus>;

    fn set_property(&mut self, property: SessionProperty) -> Result<(), EncoderStatus>;

    /// Encode one frame in the session's input format
    ///
    /// `Ok(None)` means the encoder buffered the frame.
    fn encode(
        &mut self,
        frame: &VideoFrame,
        pts_ms: u64,
        force_keyframe: bool,
    ) -> Result<Option<EncodedSample>, EncoderStatus>;

    /// Drain buffered output
    fn flush(&mut self) -> Vec<EncodedSample> {
        Vec::new()
    }
}

/// Creates compression sessions
pub trait EncoderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn is_hardware(&self) -> bool;

    /// Higher is preferred
    fn priority(&self) -> u32;

    fn supports(&self, codec: VideoCodec) -> bool;

    /// Whether the encoder can be used on this system
    fn is_available(&self) -> bool {
        true
    }

    fn create(&self, spec: &SessionSpec) -> Result<Box<dyn CompressionSession>, EncoderStatus>;
}
