//! Video encoder session management
//!
//! This module provides:
//! - Encoder and session traits that hardware backends implement
//! - A registry choosing encoders by priority and hardware requirement
//! - Presets that expand into complete property bundles
//! - The session manager with hardware retries and software fallback
//! - The worker task serializing encodes and lifecycle commands
//! - A raw pass-through encoder usable without codec libraries

pub mod presets;
pub mod registry;
pub mod session;
pub mod software;
pub mod traits;
pub mod worker;

// Core traits and types
pub use traits::{
    BackendPreference, CompressionSession, EncodedSample, EncoderFactory, EncoderStatus,
    HardwareRequirement, Profile, SessionProperty, SessionSpec, VideoCodec,
};

pub use presets::{EncoderPreset, PresetBundle};

// Encoder registry
pub use registry::{AvailableEncoder, EncoderRegistry};

pub use session::{
    classify, transition, AppliedProperties, EncoderAction, EncoderEvent, EncoderInfo,
    EncoderSessionManager, EncoderState, ErrorWindow, FailureClass,
};

pub use software::RawVideoEncoderFactory;

pub use worker::{EncoderCommand, EncoderHandle, EncoderWorker};
