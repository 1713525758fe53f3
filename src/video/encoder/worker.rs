//! Encoder worker task
//!
//! A single task owns the [`EncoderSessionManager`]. Frames and lifecycle
//! commands share one bounded mailbox, so an open or reconfigure can never
//! race with an encode. Frames are offered with `try_send` and dropped when
//! the mailbox is full; lifecycle commands wait for room.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::session::{EncoderInfo, EncoderSessionManager};
use super::traits::EncodedSample;
use crate::config::StreamSettings;
use crate::error::EncoderError;
use crate::stats::TransmissionStats;
use crate::video::frame::VideoFrame;

type Reply<T> = oneshot::Sender<T>;

/// Mailbox message
pub enum EncoderCommand {
    Open {
        settings: StreamSettings,
        reply: Reply<Result<EncoderInfo, EncoderError>>,
    },
    Reconfigure {
        settings: StreamSettings,
        reply: Reply<Result<EncoderInfo, EncoderError>>,
    },
    Encode(VideoFrame),
    RequestKeyframe,
    Close {
        reply: Reply<()>,
    },
}

/// Handle to a running encoder worker
#[derive(Clone)]
pub struct EncoderHandle {
    tx: mpsc::Sender<EncoderCommand>,
}

impl EncoderHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EncoderCommand,
    ) -> Result<T, EncoderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EncoderError::WorkerGone)?;
        rx.await.map_err(|_| EncoderError::WorkerGone)
    }

    pub async fn open(&self, settings: StreamSettings) -> Result<EncoderInfo, EncoderError> {
        self.call(|reply| EncoderCommand::Open { settings, reply })
            .await?
    }

    pub async fn reconfigure(&self, settings: StreamSettings) -> Result<EncoderInfo, EncoderError> {
        self.call(|reply| EncoderCommand::Reconfigure { settings, reply })
            .await?
    }

    pub async fn close(&self) -> Result<(), EncoderError> {
        self.call(|reply| EncoderCommand::Close { reply }).await
    }

    /// Offer a frame; false when the mailbox is full or the worker is gone
    pub fn try_encode(&self, frame: VideoFrame) -> bool {
        self.tx.try_send(EncoderCommand::Encode(frame)).is_ok()
    }

    pub fn request_keyframe(&self) {
        let _ = self.tx.try_send(EncoderCommand::RequestKeyframe);
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Encoder worker
pub struct EncoderWorker {
    manager: EncoderSessionManager,
    samples: mpsc::Sender<EncodedSample>,
    stats: Arc<TransmissionStats>,
}

impl EncoderWorker {
    /// Spawn the worker; it runs until every handle is dropped
    pub fn spawn(
        manager: EncoderSessionManager,
        capacity: usize,
        samples: mpsc::Sender<EncodedSample>,
        stats: Arc<TransmissionStats>,
    ) -> (EncoderHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            manager,
            samples,
            stats,
        };
        let task = tokio::spawn(worker.run(rx));
        (EncoderHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EncoderCommand>) {
        debug!("Encoder worker started");
        while let Some(command) = rx.recv().await {
            match command {
                EncoderCommand::Open { settings, reply } => {
                    let result = self.manager.open(&settings).await;
                    let _ = reply.send(result);
                }
                EncoderCommand::Reconfigure { settings, reply } => {
                    let result = self.manager.reconfigure(&settings).await;
                    let _ = reply.send(result);
                }
                EncoderCommand::Encode(frame) => self.encode(frame).await,
                EncoderCommand::RequestKeyframe => self.manager.request_keyframe(),
                EncoderCommand::Close { reply } => {
                    self.manager.close();
                    let _ = reply.send(());
                }
            }
        }
        self.manager.close();
        info!("Encoder worker stopped");
    }

    async fn encode(&mut self, frame: VideoFrame) {
        match self.manager.encode(frame).await {
            Ok(Some(sample)) => {
                if self.samples.try_send(sample).is_err() {
                    self.stats.record_dropped();
                }
            }
            Ok(None) => {}
            Err(EncoderError::NotRunning) => self.stats.record_dropped(),
            Err(_) => self.stats.record_encode_error(),
        }
    }
}
