//! Encoder session lifecycle
//!
//! [`EncoderSessionManager`] owns the single compression session of a stream.
//! Opening walks a relaxation ladder of hardware attempts before falling
//! back to software. Encode failures are classified: some rebuild the
//! session, some only change the input format, the rest feed a rolling
//! error rate that can also trigger a rebuild.
//!
//! Lifecycle changes go through [`transition`], a pure state table.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::presets::PresetBundle;
use super::registry::EncoderRegistry;
use super::traits::{
    BackendPreference, CompressionSession, EncodedSample, EncoderStatus, HardwareRequirement,
    Profile, SessionProperty, SessionSpec,
};
use crate::config::{EncoderConfig, StreamSettings};
use crate::error::EncoderError;
use crate::events::{EventBus, SystemEvent};
use crate::utils::LogThrottler;
use crate::video::convert::{i420_to_nv12, yuv420p_buffer_size};
use crate::video::format::PixelFormat;
use crate::video::frame::VideoFrame;
use crate::video::pool::BufferPool;
use crate::warn_throttled;

/// NV12 frames in flight between the manager and a session
const NV12_POOL_SIZE: usize = 4;

/// Encoder lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderState {
    Uninitialized,
    /// Hardware attempt n (1-based) in progress
    HardwareAttempt(u32),
    SoftwareFallback,
    Running,
    /// Session lost; a rebuild follows
    Invalidated,
    /// Setup failed on every path
    Failed,
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderState::Uninitialized => write!(f, "uninitialized"),
            EncoderState::HardwareAttempt(n) => write!(f, "hardware attempt {}", n),
            EncoderState::SoftwareFallback => write!(f, "software fallback"),
            EncoderState::Running => write!(f, "running"),
            EncoderState::Invalidated => write!(f, "invalidated"),
            EncoderState::Failed => write!(f, "failed"),
        }
    }
}

/// Inputs to the lifecycle table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderEvent {
    Open,
    AttemptSucceeded,
    AttemptFailed,
    /// Session reported invalidated / allocation failure, or error rate exceeded
    SessionLost,
    SettingsChanged,
    Close,
}

/// What the manager does after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderAction {
    TryHardware(u32),
    /// Recovery for the failed attempt, pause, then the next attempt
    RecoverAndRetry(u32),
    TrySoftware,
    Configure,
    Reconfigure,
    Recreate,
    ReportSetupFailed,
    Teardown,
}

/// Lifecycle transition table
///
/// `None` marks an event that is invalid in the current state.
pub fn transition(
    state: EncoderState,
    event: EncoderEvent,
    max_hardware_attempts: u32,
) -> Option<(EncoderState, EncoderAction)> {
    use EncoderAction as A;
    use EncoderEvent as E;
    use EncoderState as S;

    let next = match (state, event) {
        (_, E::Close) => (S::Uninitialized, A::Teardown),
        (S::Uninitialized | S::Invalidated | S::Failed | S::Running, E::Open) => {
            (S::HardwareAttempt(1), A::TryHardware(1))
        }
        (S::HardwareAttempt(_) | S::SoftwareFallback, E::AttemptSucceeded) => {
            (S::Running, A::Configure)
        }
        (S::HardwareAttempt(n), E::AttemptFailed) if n < max_hardware_attempts => {
            (S::HardwareAttempt(n + 1), A::RecoverAndRetry(n + 1))
        }
        (S::HardwareAttempt(_), E::AttemptFailed) => (S::SoftwareFallback, A::TrySoftware),
        (S::SoftwareFallback, E::AttemptFailed) => (S::Failed, A::ReportSetupFailed),
        (S::Running, E::SessionLost) => (S::Invalidated, A::Recreate),
        (S::Running, E::SettingsChanged) => (S::Running, A::Reconfigure),
        _ => return None,
    };
    Some(next)
}

/// How an encode failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The session is gone; rebuild it
    Recreate,
    /// Keep the session, switch the input pixel format
    SwapInputFormat,
    /// Count it; only the rolling error rate can escalate
    Counted,
}

pub fn classify(status: EncoderStatus) -> FailureClass {
    match status {
        EncoderStatus::SessionInvalidated | EncoderStatus::AllocationFailed => {
            FailureClass::Recreate
        }
        EncoderStatus::PixelTransferFailed | EncoderStatus::InsufficientColorData => {
            FailureClass::SwapInputFormat
        }
        _ => FailureClass::Counted,
    }
}

/// Rolling error rate over the last N encodes
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    samples: VecDeque<bool>,
    capacity: usize,
    min_samples: usize,
    threshold: f64,
    errors: usize,
}

impl ErrorWindow {
    pub fn new(capacity: usize, min_samples: usize, threshold: f64) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            min_samples,
            threshold,
            errors: 0,
        }
    }

    pub fn record(&mut self, failed: bool) {
        if self.samples.len() == self.capacity {
            if let Some(true) = self.samples.pop_front() {
                self.errors -= 1;
            }
        }
        self.samples.push_back(failed);
        if failed {
            self.errors += 1;
        }
    }

    pub fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.errors as f64 / self.samples.len() as f64
    }

    /// Rate is above the threshold and backed by enough samples
    pub fn exceeded(&self) -> bool {
        self.samples.len() >= self.min_samples && self.rate() > self.threshold
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.errors = 0;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Properties that were successfully applied to the running session
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedProperties {
    pub bundle: PresetBundle,
    pub bitrate_kbps: u32,
    pub fps: u32,
    /// None when the session rejected every profile
    pub profile: Option<Profile>,
    pub keyframe_interval_frames: u32,
    pub frame_reordering: bool,
}

/// Snapshot of the running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub name: String,
    pub hardware: bool,
    pub input_format: PixelFormat,
}

struct ActiveSession {
    session: Box<dyn CompressionSession>,
    factory: String,
}

fn set_critical(
    session: &mut dyn CompressionSession,
    property: SessionProperty,
) -> Result<(), EncoderError> {
    session
        .set_property(property)
        .map_err(|status| EncoderError::PropertyRejected {
            property: property.name(),
            status,
        })
}

fn set_optional(session: &mut dyn CompressionSession, property: SessionProperty) -> bool {
    match session.set_property(property) {
        Ok(()) => true,
        Err(status) => {
            debug!(
                "{} ignored property {}: {}",
                session.name(),
                property.name(),
                status
            );
            false
        }
    }
}

/// Encoder session manager
pub struct EncoderSessionManager {
    registry: EncoderRegistry,
    config: EncoderConfig,
    state: EncoderState,
    active: Option<ActiveSession>,
    settings: Option<StreamSettings>,
    applied: Option<AppliedProperties>,
    /// Input format the next session is created with
    preferred_input: PixelFormat,
    /// Encoder to pin the next attempt to; cleared when not found
    pinned: Option<String>,
    errors: ErrorWindow,
    stream_start: Option<Instant>,
    force_keyframe: bool,
    /// Converted NV12 input frames, reused once the session lets go of them
    nv12_pool: BufferPool,
    cancel: CancellationToken,
    events: Option<EventBus>,
    throttler: LogThrottler,
}

impl EncoderSessionManager {
    pub fn new(registry: EncoderRegistry, config: EncoderConfig) -> Self {
        let errors = ErrorWindow::new(
            config.error_window,
            config.error_min_samples,
            config.error_rate_threshold,
        );
        Self {
            registry,
            config,
            state: EncoderState::Uninitialized,
            active: None,
            settings: None,
            applied: None,
            preferred_input: PixelFormat::Yuv420,
            pinned: None,
            errors,
            stream_start: None,
            force_keyframe: true,
            nv12_pool: BufferPool::new(NV12_POOL_SIZE),
            cancel: CancellationToken::new(),
            events: None,
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Token that interrupts retry pauses
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pin the first attempts to a named encoder
    pub fn pin_encoder(&mut self, name: impl Into<String>) {
        self.pinned = Some(name.into());
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EncoderState::Running && self.active.is_some()
    }

    pub fn info(&self) -> Option<EncoderInfo> {
        self.active.as_ref().map(|a| EncoderInfo {
            name: a.factory.clone(),
            hardware: a.session.is_hardware(),
            input_format: a.session.input_format(),
        })
    }

    pub fn is_hardware(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.session.is_hardware())
    }

    pub fn applied(&self) -> Option<&AppliedProperties> {
        self.applied.as_ref()
    }

    pub fn preferred_input(&self) -> PixelFormat {
        self.preferred_input
    }

    pub fn error_rate(&self) -> f64 {
        self.errors.rate()
    }

    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn fire(&mut self, event: EncoderEvent) -> Option<EncoderAction> {
        let Some((next, action)) = transition(self.state, event, self.config.max_hardware_attempts)
        else {
            debug!("Ignoring encoder event {:?} in state {}", event, self.state);
            return None;
        };
        if next != self.state {
            debug!("Encoder state {} -> {}", self.state, next);
            self.state = next;
            if let Some(events) = &self.events {
                events.publish(SystemEvent::EncoderStateChanged {
                    state: next,
                    encoder: self.active.as_ref().map(|a| a.factory.clone()),
                    hardware: self.is_hardware(),
                });
            }
        }
        Some(action)
    }

    fn spec(&self, settings: &StreamSettings, hardware: HardwareRequirement) -> SessionSpec {
        SessionSpec {
            codec: settings.codec,
            resolution: settings.resolution.encoder_safe(),
            input_format: self.preferred_input,
            hardware,
            pinned_encoder: self.pinned.clone(),
        }
    }

    fn swap_preferred_input(&mut self) -> PixelFormat {
        self.preferred_input = match self.preferred_input {
            PixelFormat::Nv12 => PixelFormat::Yuv420,
            _ => PixelFormat::Nv12,
        };
        self.preferred_input
    }

    /// Recovery step taken after a failed hardware attempt
    fn recover(&mut self, status: EncoderStatus) {
        match status {
            EncoderStatus::EncoderNotFound => {
                if let Some(pinned) = self.pinned.take() {
                    info!("Encoder {} not found, widening search", pinned);
                }
            }
            EncoderStatus::Malfunction => {
                info!("Encoder malfunction, tearing down before retry");
                self.teardown_session();
            }
            EncoderStatus::InsufficientColorData => {
                let format = self.swap_preferred_input();
                info!("Insufficient color data, retrying with {} input", format);
            }
            _ => {}
        }
    }

    /// Cancellable pause; borrows nothing from the manager across the await
    fn pause(&self, duration: Duration) -> impl std::future::Future<Output = Result<(), EncoderError>> {
        let cancel = self.cancel.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(EncoderError::Cancelled),
                _ = tokio::time::sleep(duration) => Ok(()),
            }
        }
    }

    fn teardown_session(&mut self) {
        if let Some(mut active) = self.active.take() {
            let pending = active.session.flush();
            if !pending.is_empty() {
                debug!("Discarding {} buffered samples from {}", pending.len(), active.factory);
            }
        }
        self.applied = None;
    }

    /// Open a session for `settings`
    ///
    /// Walks the hardware attempts, then software. On success the session is
    /// running with all properties applied.
    pub async fn open(&mut self, settings: &StreamSettings) -> Result<EncoderInfo, EncoderError> {
        self.teardown_session();
        self.errors.clear();
        self.force_keyframe = true;
        self.settings = Some(settings.clone());

        if settings.backend == BackendPreference::Software {
            // skip the hardware ladder entirely
            self.state = EncoderState::HardwareAttempt(self.config.max_hardware_attempts);
            self.fire(EncoderEvent::AttemptFailed);
        } else {
            self.fire(EncoderEvent::Open);
        }

        let mut last = EncoderStatus::EncoderNotFound;
        loop {
            match self.state {
                EncoderState::HardwareAttempt(attempt) => {
                    let requirement = match settings.backend {
                        BackendPreference::Hardware => HardwareRequirement::Required,
                        _ => HardwareRequirement::for_attempt(attempt),
                    };
                    let spec = self.spec(settings, requirement);
                    debug!("Hardware attempt {} with {:?}", attempt, requirement);

                    match self.try_create(&spec, settings) {
                        Ok(info) => return Ok(info),
                        Err(status) => {
                            warn!("Hardware attempt {} failed: {}", attempt, status);
                            last = status;
                            self.recover(status);
                            if let Some(EncoderAction::RecoverAndRetry(_)) =
                                self.fire(EncoderEvent::AttemptFailed)
                            {
                                self.pause(self.config.retry_pause() * attempt).await?;
                            } else if settings.backend == BackendPreference::Hardware {
                                self.fire(EncoderEvent::AttemptFailed);
                                return Err(EncoderError::SetupFailed { cause: last });
                            }
                        }
                    }
                }
                EncoderState::SoftwareFallback => {
                    info!("Falling back to software encoding");
                    let spec = self.spec(settings, HardwareRequirement::SoftwareOnly);
                    match self.try_create(&spec, settings) {
                        Ok(info) => return Ok(info),
                        Err(status) => {
                            warn!("Software fallback failed: {}", status);
                            self.fire(EncoderEvent::AttemptFailed);
                            return Err(EncoderError::SetupFailed { cause: status });
                        }
                    }
                }
                EncoderState::Failed => return Err(EncoderError::SetupFailed { cause: last }),
                state => {
                    debug!("Unexpected encoder state {} during open", state);
                    return Err(EncoderError::SetupFailed { cause: last });
                }
            }
        }
    }

    /// One creation attempt plus property application
    fn try_create(
        &mut self,
        spec: &SessionSpec,
        settings: &StreamSettings,
    ) -> Result<EncoderInfo, EncoderStatus> {
        let created = self.registry.create(spec)?;
        self.active = Some(ActiveSession {
            session: created.session,
            factory: created.factory,
        });

        if let Err(e) = self.apply_properties(settings) {
            self.teardown_session();
            return Err(match e {
                EncoderError::PropertyRejected { status, .. } => status,
                _ => EncoderStatus::Malfunction,
            });
        }

        self.fire(EncoderEvent::AttemptSucceeded);
        self.stream_start.get_or_insert_with(Instant::now);
        let info = self.info().ok_or(EncoderStatus::Malfunction)?;
        info!(
            "Encoder running: {} ({}, {} input)",
            info.name,
            if info.hardware { "hardware" } else { "software" },
            info.input_format
        );
        Ok(info)
    }

    /// Apply bitrate, frame rate, real-time flag, reordering, profile and
    /// key-frame interval to the current session
    ///
    /// Critical properties (bitrate, real-time) abort; the others degrade.
    pub fn apply_properties(&mut self, settings: &StreamSettings) -> Result<(), EncoderError> {
        let bundle = settings.preset.bundle();
        let keyframe_interval_frames = bundle.keyframe_interval_frames(settings.fps);
        let first_profile = settings.preset.initial_profile(settings.codec);

        let active = self.active.as_mut().ok_or(EncoderError::NotRunning)?;
        let session = active.session.as_mut();

        // real-time is constant, so a rejected bitrate leaves the session as it was
        set_critical(session, SessionProperty::RealTime(true))?;
        set_critical(session, SessionProperty::Bitrate(settings.video_bitrate_kbps))?;
        set_optional(session, SessionProperty::ExpectedFrameRate(settings.fps));
        set_optional(session, SessionProperty::Quality(bundle.quality));

        let frame_reordering = bundle.allow_frame_reordering
            && set_optional(session, SessionProperty::FrameReordering(true));
        if !frame_reordering {
            set_optional(session, SessionProperty::FrameReordering(false));
        }

        let mut profile = Some(first_profile);
        while let Some(p) = profile {
            if set_optional(session, SessionProperty::Profile(p)) {
                break;
            }
            profile = p.degrade();
            if let Some(next) = profile {
                info!("Profile {:?} rejected, degrading to {:?}", p, next);
            }
        }

        set_optional(session, SessionProperty::KeyframeInterval(keyframe_interval_frames));

        self.applied = Some(AppliedProperties {
            bundle,
            bitrate_kbps: settings.video_bitrate_kbps,
            fps: settings.fps,
            profile,
            keyframe_interval_frames,
            frame_reordering,
        });
        Ok(())
    }

    /// Apply new settings: live when possible, otherwise rebuild the session
    pub async fn reconfigure(&mut self, settings: &StreamSettings) -> Result<EncoderInfo, EncoderError> {
        if self.is_running() && self.settings.as_ref() == Some(settings) {
            return self.info().ok_or(EncoderError::NotRunning);
        }
        let rebuild = match &self.settings {
            Some(current) => current.requires_session_rebuild(settings),
            None => true,
        };
        if rebuild || !self.is_running() {
            info!("Settings change needs a new encoder session");
            return self.open(settings).await;
        }

        self.fire(EncoderEvent::SettingsChanged);
        self.apply_properties(settings)?;
        self.settings = Some(settings.clone());
        self.info().ok_or(EncoderError::NotRunning)
    }

    /// Tear down the session and open a new one with the current settings
    pub async fn recreate(&mut self, reason: &str) -> Result<EncoderInfo, EncoderError> {
        let settings = self.settings.clone().ok_or(EncoderError::NotRunning)?;
        warn!("Recreating encoder session: {}", reason);
        self.fire(EncoderEvent::SessionLost);
        if let Some(events) = &self.events {
            events.publish(SystemEvent::EncoderRecreated {
                reason: reason.to_string(),
            });
        }
        self.teardown_session();
        self.open(&settings).await
    }

    /// Encode one normalized I420 frame
    ///
    /// Failures are classified and recovered here; the returned error only
    /// tells the caller this frame produced no output.
    pub async fn encode(&mut self, frame: VideoFrame) -> Result<Option<EncodedSample>, EncoderError> {
        if !self.is_running() {
            return Err(EncoderError::NotRunning);
        }

        let pts_ms = self
            .stream_start
            .map(|start| frame.capture_ts.saturating_duration_since(start).as_millis() as u64)
            .unwrap_or(0);
        let force_keyframe = std::mem::take(&mut self.force_keyframe);

        let active = self.active.as_mut().ok_or(EncoderError::NotRunning)?;
        let input = match active.session.input_format() {
            PixelFormat::Nv12 if frame.format == PixelFormat::Yuv420 => {
                let len = yuv420p_buffer_size(frame.resolution);
                let data = match self.nv12_pool.acquire(len) {
                    Some(mut buf) => {
                        i420_to_nv12(frame.data(), frame.resolution, &mut buf);
                        buf.freeze()
                    }
                    None => {
                        // the session still holds every pooled frame
                        let mut buf = vec![0; len];
                        i420_to_nv12(frame.data(), frame.resolution, &mut buf);
                        Bytes::from(buf)
                    }
                };
                let stride = PixelFormat::Nv12.min_stride(frame.resolution.width) as u32;
                VideoFrame::new(data, frame.resolution, PixelFormat::Nv12, stride, frame.sequence)
                    .with_capture_ts(frame.capture_ts)
            }
            _ => frame,
        };

        let status = match active.session.encode(&input, pts_ms, force_keyframe) {
            Ok(sample) => {
                self.errors.record(false);
                self.throttler.clear("encode_failed");
                return Ok(sample);
            }
            Err(status) => status,
        };

        match classify(status) {
            FailureClass::Recreate => {
                self.recreate(&status.to_string()).await?;
            }
            FailureClass::SwapInputFormat => {
                self.errors.record(true);
                let format = self.swap_preferred_input();
                if let Some(active) = self.active.as_mut() {
                    match active.session.set_input_format(format) {
                        Ok(()) => info!("Encoder input switched to {} after {}", format, status),
                        Err(e) => debug!("Input format switch deferred to next session: {}", e),
                    }
                }
                self.force_keyframe = true;
            }
            FailureClass::Counted => {
                self.errors.record(true);
                warn_throttled!(
                    self.throttler,
                    "encode_failed",
                    "Encode failed: {} (error rate {:.0}%)",
                    status,
                    self.errors.rate() * 100.0
                );
                if self.errors.exceeded() {
                    let reason = format!("error rate {:.0}%", self.errors.rate() * 100.0);
                    self.recreate(&reason).await?;
                }
            }
        }

        Err(EncoderError::EncodeFailed(status))
    }

    /// Close the session
    pub fn close(&mut self) {
        self.fire(EncoderEvent::Close);
        self.teardown_session();
        self.settings = None;
        self.stream_start = None;
        self.errors.clear();
    }
}
