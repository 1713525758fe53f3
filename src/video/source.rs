//! Synthetic frame source
//!
//! Generates color bars with a moving marker so the pipeline can be driven
//! without a capture device.

use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;

/// 75% color bars, RGB
const BARS: [[u8; 3]; 7] = [
    [191, 191, 191],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
];

/// Test pattern generator producing BGRA frames
pub struct TestPatternSource {
    resolution: Resolution,
    fps: u32,
    sequence: u64,
    base: Vec<u8>,
}

impl TestPatternSource {
    pub fn new(resolution: Resolution, fps: u32) -> Self {
        let (w, h) = (resolution.width as usize, resolution.height as usize);
        let mut base = vec![0u8; w * h * 4];
        for (i, px) in base.chunks_exact_mut(4).enumerate() {
            let x = i % w;
            let [r, g, b] = BARS[(x * BARS.len() / w.max(1)).min(BARS.len() - 1)];
            px.copy_from_slice(&[b, g, r, 0xFF]);
        }
        debug!("Test pattern {} @ {}fps", resolution, fps);
        Self {
            resolution,
            fps: fps.max(1),
            sequence: 0,
            base,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Next frame: the bars plus a white column sweeping left to right
    pub fn next_frame(&mut self) -> VideoFrame {
        let (w, h) = (self.resolution.width as usize, self.resolution.height as usize);
        let mut data = self.base.clone();
        let marker_w = (w / 64).max(2);
        let x0 = (self.sequence as usize * marker_w) % w.max(1);
        for row in 0..h {
            for x in x0..(x0 + marker_w).min(w) {
                let i = (row * w + x) * 4;
                data[i..i + 4].copy_from_slice(&[0xEB, 0xEB, 0xEB, 0xFF]);
            }
        }
        let frame = VideoFrame::from_vec(data, self.resolution, PixelFormat::Bgra, self.sequence);
        self.sequence += 1;
        frame
    }

    /// Emit frames at the configured rate until cancelled
    pub async fn run<F>(mut self, cancel: CancellationToken, mut sink: F)
    where
        F: FnMut(VideoFrame),
    {
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / self.fps);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => sink(self.next_frame()),
            }
        }
        debug!("Test pattern stopped after {} frames", self.sequence);
    }
}
