//! Load-driven quality control
//!
//! Disabled unless `quality.enabled` is set, so user settings are never
//! altered silently.

pub mod controller;
pub mod monitor;

pub use controller::{
    adjust, classify, restore, Envelope, LoadCondition, QualityController, BITRATE_STEP_KBPS,
    CPU_CRITICAL_PERCENT, FPS_STEP, MEMORY_CRITICAL_PERCENT,
};
pub use monitor::{SysinfoMonitor, SystemLoad, SystemMonitor, ThermalState};
