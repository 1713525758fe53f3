//! Small utilities shared across the pipeline

pub mod throttle;

pub use throttle::LogThrottler;
