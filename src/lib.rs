//! livepush - live video publisher
//!
//! This crate normalizes captured frames, encodes them through a hardware
//! session with software fallback, and keeps a publish connection to a
//! media server alive with bounded reconnects.

pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod publish;
pub mod quality;
pub mod stats;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
pub use pipeline::StreamPipeline;
