//! Publish connection abstraction
//!
//! Everything below this trait (handshake, chunking, wire protocol) belongs
//! to the transport. The supervisor only drives the lifecycle.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::video::encoder::EncodedSample;

/// A transport able to publish an encoded stream to a media server
///
/// Calls are never made concurrently; the supervisor task owns the
/// connection exclusively.
#[async_trait]
pub trait PublishConnection: Send {
    /// Transport name for logs
    fn name(&self) -> &str;

    /// Open the transport to `url`
    async fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    /// Start publishing under `stream_key`
    async fn publish(&mut self, stream_key: &str) -> Result<(), TransportError>;

    /// Tear the connection down. Safe to call in any state.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Transport liveness as last observed
    fn is_connected(&self) -> bool;

    /// Publish session liveness as last observed
    fn is_publishing(&self) -> bool;

    /// Send one encoded sample
    async fn send(&mut self, sample: &EncodedSample) -> Result<(), TransportError>;
}

