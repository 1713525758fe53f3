//! Stream pipeline
//!
//! Wires the stages together for one publish session:
//!
//! ```text
//! push_frame -> validate -> [frame mailbox] -> normalize (blocking pool)
//!     -> EncoderWorker -> [sample channel] -> ConnectionSupervisor -> server
//! ```
//!
//! Every arrow with brackets is a bounded channel; a full channel drops the
//! frame and counts it instead of blocking the producer.

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, StreamSettings};
use crate::error::{AppError, ErrorKind, Result};
use crate::events::{EventBus, SystemEvent, TopicReceiver};
use crate::publish::{ConnectionState, ConnectionSupervisor, PublishConnection, SupervisorHandle};
use crate::quality::{QualityController, SysinfoMonitor, SystemMonitor};
use crate::stats::{StatsSnapshot, TransmissionStats};
use crate::utils::LogThrottler;
use crate::video::encoder::{
    EncoderHandle, EncoderRegistry, EncoderSessionManager, EncoderState, EncoderWorker,
};
use crate::video::{BufferPool, FormatNormalizer, FrameValidator, NormalizeTarget, VideoFrame};
use crate::warn_throttled;

/// Creates a fresh transport for every stream start
pub type ConnectionFactory = Arc<dyn Fn() -> Box<dyn PublishConnection> + Send + Sync>;

/// Creates the load monitor used by the quality controller
pub type MonitorFactory = Arc<dyn Fn() -> Box<dyn SystemMonitor> + Send + Sync>;

/// Everything that exists only while streaming
struct RunningStream {
    session_id: String,
    cancel: CancellationToken,
    encoder: EncoderHandle,
    encoder_task: JoinHandle<()>,
    supervisor: SupervisorHandle,
    tasks: Vec<JoinHandle<()>>,
}

/// Stream pipeline
pub struct StreamPipeline {
    config: AppConfig,
    registry: EncoderRegistry,
    connector: ConnectionFactory,
    monitor: MonitorFactory,
    events: EventBus,
    stats: Arc<TransmissionStats>,
    validator: FrameValidator,
    /// Settings as the user asked for them
    user: Arc<ArcSwap<StreamSettings>>,
    /// Settings the encoder runs with; the quality controller may lower them
    active: Arc<watch::Sender<StreamSettings>>,
    state: Arc<watch::Sender<ConnectionState>>,
    frames: Arc<ArcSwapOption<mpsc::Sender<VideoFrame>>>,
    running: Arc<Mutex<Option<RunningStream>>>,
}

impl StreamPipeline {
    pub fn new(config: AppConfig, registry: EncoderRegistry, connector: ConnectionFactory) -> Self {
        let settings = config.stream.clone();
        let (active, _) = watch::channel(settings.clone());
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            registry,
            connector,
            monitor: Arc::new(|| Box::new(SysinfoMonitor::new()) as Box<dyn SystemMonitor>),
            events: EventBus::new(),
            stats: Arc::new(TransmissionStats::new()),
            validator: FrameValidator::new(),
            user: Arc::new(ArcSwap::from_pointee(settings)),
            active: Arc::new(active),
            state: Arc::new(state),
            frames: Arc::new(ArcSwapOption::empty()),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorFactory) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn user_settings(&self) -> Arc<StreamSettings> {
        self.user.load_full()
    }

    pub fn active_settings(&self) -> StreamSettings {
        self.active.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state; survives stream restarts
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Offer a captured frame
    ///
    /// Never blocks. `Ok(false)` means the frame was dropped because the
    /// normalizer is behind; rejected frames come back as
    /// [`AppError::FrameRejected`].
    pub fn push_frame(&self, frame: VideoFrame) -> Result<bool> {
        let frames = self.frames.load();
        let Some(frames) = (*frames).as_ref() else {
            return Err(AppError::NotRunning);
        };

        let validated = match self.validator.validate(frame) {
            Ok(validated) => validated,
            Err(reason) => {
                self.stats.record_rejected();
                return Err(reason.into());
            }
        };

        if frames.try_send(validated.frame).is_err() {
            self.stats.record_dropped();
            return Ok(false);
        }
        Ok(true)
    }

    /// Start streaming with the current user settings
    ///
    /// Returns the new session id. The encoder is open when this returns;
    /// the connection comes up in the background (see [`Self::watch_state`]).
    pub async fn start(&self) -> Result<String> {
        let mut running = self.running.lock().await;
        if let Some(run) = running.as_ref() {
            return Err(AppError::Internal(format!(
                "stream {} already running",
                run.session_id
            )));
        }

        let settings = (*self.user.load_full()).clone();
        if let Err(e) = settings.validate() {
            self.publish_error(ErrorKind::Configuration, &e.to_string());
            return Err(e.into());
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting stream {} -> {} ({} @ {}fps, {}kbps)",
            session_id,
            settings.url,
            settings.resolution,
            settings.fps,
            settings.video_bitrate_kbps
        );
        self.stats.reset();
        self.active.send_replace(settings.clone());
        let cancel = CancellationToken::new();
        let pipeline = &self.config.pipeline;

        let manager = EncoderSessionManager::new(self.registry.clone(), self.config.encoder.clone())
            .with_events(self.events.clone())
            .with_cancel(cancel.child_token());
        let (sample_tx, sample_rx) = mpsc::channel(pipeline.sample_queue.max(1));
        let (encoder, encoder_task) = EncoderWorker::spawn(
            manager,
            self.config.encoder.mailbox_capacity,
            sample_tx,
            self.stats.clone(),
        );

        if let Err(e) = encoder.open(settings.clone()).await {
            error!("Encoder setup failed: {}", e);
            cancel.cancel();
            drop(encoder);
            let _ = encoder_task.await;
            self.publish_error(ErrorKind::Encoder, &e.to_string());
            return Err(e.into());
        }

        let supervisor = ConnectionSupervisor::spawn(
            (self.connector)(),
            settings.clone(),
            self.config.connection.clone(),
            sample_rx,
            self.stats.clone(),
            self.events.clone(),
            &cancel,
        );

        let (frame_tx, frame_rx) = mpsc::channel(pipeline.frame_queue.max(1));
        let normalizer = Arc::new(FormatNormalizer::new(BufferPool::new(pipeline.pool_size)));

        let mut tasks = vec![
            tokio::spawn(normalize_loop(
                frame_rx,
                normalizer,
                self.active.subscribe(),
                encoder.clone(),
                self.stats.clone(),
                cancel.clone(),
            )),
            tokio::spawn(apply_loop(
                self.active.subscribe(),
                encoder.clone(),
                cancel.clone(),
            )),
            tokio::spawn(state_relay(
                supervisor.watch(),
                self.state.clone(),
                encoder.clone(),
                cancel.clone(),
            )),
            tokio::spawn(encoder_watch(
                self.events.subscribe_topic("encoder.state_changed"),
                EncoderFailureTeardown {
                    session_id: session_id.clone(),
                    events: self.events.clone(),
                    frames: self.frames.clone(),
                    running: self.running.clone(),
                    state: self.state.clone(),
                },
                cancel.clone(),
            )),
            self.stats.clone().spawn_reporter(
                self.events.clone(),
                pipeline.stats_interval(),
                cancel.clone(),
            ),
        ];
        if self.config.quality.enabled {
            let controller = QualityController::new(
                self.config.quality.clone(),
                (self.monitor)(),
                self.user.clone(),
                self.active.clone(),
                self.events.clone(),
            );
            tasks.push(controller.spawn(cancel.clone()));
        }

        self.frames.store(Some(Arc::new(frame_tx)));
        self.events.publish(SystemEvent::StreamStarted {
            session_id: session_id.clone(),
            url: settings.url.clone(),
            started_at: Utc::now(),
        });

        *running = Some(RunningStream {
            session_id: session_id.clone(),
            cancel,
            encoder,
            encoder_task,
            supervisor,
            tasks,
        });
        Ok(session_id)
    }

    /// Stop streaming
    ///
    /// Encoder first, then the connection, then timers, then counters. Each
    /// step runs even if the one before it failed.
    pub async fn stop(&self) -> Result<()> {
        let Some(run) = self.running.lock().await.take() else {
            return Err(AppError::NotRunning);
        };
        info!("Stopping stream {}", run.session_id);
        self.frames.store(None);
        let session_id = shutdown(run).await;

        self.stats.reset();
        self.state.send_replace(ConnectionState::Idle);
        self.events.publish(SystemEvent::StreamStopped { session_id });
        Ok(())
    }

    /// Manual reconnect; the way out of a failed connection
    pub async fn reconnect(&self) -> Result<()> {
        let running = self.running.lock().await;
        let run = running.as_ref().ok_or(AppError::NotRunning)?;
        run.supervisor.reconnect().await?;
        Ok(())
    }

    /// Replace the user settings
    ///
    /// Bitrate and frame rate are applied to the running session; resolution,
    /// codec, preset or backend changes rebuild it; URL or key changes
    /// reconnect. Any quality-controller adjustment is discarded.
    pub async fn update_settings(&self, settings: StreamSettings) -> Result<()> {
        settings.validate()?;
        let previous = self.user.load_full();
        if *previous == settings {
            return Ok(());
        }
        self.user.store(Arc::new(settings.clone()));

        let running = self.running.lock().await;
        let Some(run) = running.as_ref() else {
            self.active.send_replace(settings);
            return Ok(());
        };

        let encoder = run.encoder.clone();
        let retarget = previous.requires_reconnect(&settings);
        let supervisor_target = retarget.then(|| settings.clone());
        drop(running);

        let result = encoder.reconfigure(settings.clone()).await;
        self.active.send_replace(settings);
        if let Some(target) = supervisor_target {
            let running = self.running.lock().await;
            if let Some(run) = running.as_ref() {
                run.supervisor.retarget(target).await?;
            }
        }
        result.map(|_| ()).map_err(AppError::from)
    }

    fn publish_error(&self, kind: ErrorKind, message: &str) {
        self.events.publish(SystemEvent::StreamError {
            kind,
            message: message.to_string(),
            manual_restart_required: true,
        });
    }
}

/// Encoder first, then the connection, then the tasks
async fn shutdown(run: RunningStream) -> String {
    if let Err(e) = run.encoder.close().await {
        warn!("Encoder close failed: {}", e);
    }

    run.supervisor.stop().await;

    run.cancel.cancel();
    for task in run.tasks {
        if let Err(e) = task.await {
            warn!("Pipeline task ended abnormally: {}", e);
        }
    }
    drop(run.encoder);
    if let Err(e) = run.encoder_task.await {
        warn!("Encoder worker ended abnormally: {}", e);
    }
    run.session_id
}

/// Normalize queued frames on the blocking pool and hand them to the encoder
async fn normalize_loop(
    mut frames: mpsc::Receiver<VideoFrame>,
    normalizer: Arc<FormatNormalizer>,
    active: watch::Receiver<StreamSettings>,
    encoder: EncoderHandle,
    stats: Arc<TransmissionStats>,
    cancel: CancellationToken,
) {
    let throttler = LogThrottler::with_secs(5);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let target = NormalizeTarget::new(active.borrow().resolution);
        let worker = normalizer.clone();
        let result = tokio::task::spawn_blocking(move || worker.normalize(frame, target)).await;
        match result {
            Ok(Ok(normalized)) => {
                if normalized.degraded {
                    stats.record_degraded();
                }
                if !encoder.try_encode(normalized.frame) {
                    stats.record_dropped();
                }
            }
            Ok(Err(e)) => {
                stats.record_dropped();
                warn_throttled!(throttler, "normalize_failed", "Frame dropped: {}", e);
            }
            Err(e) => {
                error!("Normalization task failed: {}", e);
                stats.record_dropped();
            }
        }
    }
    debug!("Normalize loop stopped");
}

/// Re-apply active settings whenever they change (quality controller)
async fn apply_loop(
    mut active: watch::Receiver<StreamSettings>,
    encoder: EncoderHandle,
    cancel: CancellationToken,
) {
    // the current value is already applied
    let _ = active.borrow_and_update();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
                let settings = active.borrow_and_update().clone();
                if let Err(e) = encoder.reconfigure(settings).await {
                    warn!("Applying adjusted settings failed: {}", e);
                }
            }
        }
    }
}

/// Mirror supervisor state and ask for a keyframe whenever publishing starts
async fn state_relay(
    mut supervisor: watch::Receiver<ConnectionState>,
    state: Arc<watch::Sender<ConnectionState>>,
    encoder: EncoderHandle,
    cancel: CancellationToken,
) {
    loop {
        let current = *supervisor.borrow_and_update();
        let previous = state.send_replace(current);
        if current == ConnectionState::Publishing && !previous.is_streaming() {
            encoder.request_keyframe();
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = supervisor.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// What a terminal encoder failure needs to take the stream down
struct EncoderFailureTeardown {
    session_id: String,
    events: EventBus,
    frames: Arc<ArcSwapOption<mpsc::Sender<VideoFrame>>>,
    running: Arc<Mutex<Option<RunningStream>>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl EncoderFailureTeardown {
    /// Stop accepting frames at once, release the stream in the background
    ///
    /// The release joins this stream's tasks, so it cannot run inside one.
    fn run(self) {
        error!("Encoder failed permanently, stream needs a manual restart");
        self.frames.store(None);
        self.events.publish(SystemEvent::StreamError {
            kind: ErrorKind::Encoder,
            message: "encoder session could not be recovered".to_string(),
            manual_restart_required: true,
        });

        tokio::spawn(async move {
            let mut running = self.running.lock().await;
            // a stop or restart may have got there first
            if running.as_ref().map(|r| r.session_id.as_str()) != Some(self.session_id.as_str()) {
                return;
            }
            if let Some(run) = running.take() {
                let session_id = shutdown(run).await;
                info!("Stream {} released after encoder failure", session_id);
            }
            self.state.send_replace(ConnectionState::Failed);
        });
    }
}

/// Turn a terminal encoder failure into a stream error and a released stream
async fn encoder_watch(
    mut rx: TopicReceiver,
    teardown: EncoderFailureTeardown,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        if let SystemEvent::EncoderStateChanged {
            state: EncoderState::Failed,
            ..
        } = event
        {
            teardown.run();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::{RejectReason, TransportError};
    use crate::video::encoder::{
        BackendPreference, CompressionSession, EncodedSample, EncoderFactory, EncoderStatus,
        RawVideoEncoderFactory, SessionProperty, SessionSpec, VideoCodec,
    };
    use crate::video::format::{PixelFormat, Resolution};
    use crate::video::TestPatternSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct CountingConnection {
        sent: Arc<AtomicU32>,
        connected: bool,
        publishing: bool,
    }

    #[async_trait]
    impl PublishConnection for CountingConnection {
        fn name(&self) -> &str {
            "counting"
        }

        async fn connect(&mut self, _url: &str) -> std::result::Result<(), TransportError> {
            self.connected = true;
            Ok(())
        }

        async fn publish(&mut self, _key: &str) -> std::result::Result<(), TransportError> {
            self.publishing = true;
            Ok(())
        }

        async fn close(&mut self) -> std::result::Result<(), TransportError> {
            self.connected = false;
            self.publishing = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn is_publishing(&self) -> bool {
            self.publishing
        }

        async fn send(&mut self, _sample: &EncodedSample) -> std::result::Result<(), TransportError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            stream: StreamSettings {
                url: "tcp://127.0.0.1/live".to_string(),
                stream_key: "key".to_string(),
                resolution: Resolution::new(320, 240),
                backend: BackendPreference::Software,
                ..Default::default()
            },
            connection: ConnectionConfig {
                settle_delay_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pipeline() -> (StreamPipeline, Arc<AtomicU32>) {
        let sent = Arc::new(AtomicU32::new(0));
        let counter = sent.clone();
        let connector: ConnectionFactory = Arc::new(move || {
            Box::new(CountingConnection {
                sent: counter.clone(),
                connected: false,
                publishing: false,
            }) as Box<dyn PublishConnection>
        });
        let registry = EncoderRegistry::new().with(Arc::new(RawVideoEncoderFactory::new()));
        (StreamPipeline::new(config(), registry, connector), sent)
    }

    async fn wait_publishing(pipeline: &StreamPipeline) {
        let mut rx = pipeline.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == ConnectionState::Publishing),
        )
        .await
        .expect("publishing in time")
        .unwrap();
    }

    #[tokio::test]
    async fn test_frames_flow_end_to_end() {
        let (pipeline, sent) = pipeline();
        let mut events = pipeline.events().subscribe_topic("stream.*");
        pipeline.start().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(SystemEvent::StreamStarted { .. })
        ));
        wait_publishing(&pipeline).await;

        let mut source = TestPatternSource::new(Resolution::new(320, 240), 30);
        for _ in 0..200 {
            let _ = pipeline.push_frame(source.next_frame()).unwrap();
            if sent.load(Ordering::SeqCst) >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sent.load(Ordering::SeqCst) >= 5);
        assert!(pipeline.stats().frames_transmitted >= 5);

        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.connection_state(), ConnectionState::Idle);
        assert_eq!(pipeline.stats().frames_transmitted, 0);
        assert!(!pipeline.is_running().await);
    }

    #[tokio::test]
    async fn test_push_before_start_and_rejections() {
        let (pipeline, _sent) = pipeline();
        let frame = VideoFrame::from_vec(
            vec![0; PixelFormat::Bgra.frame_size(Resolution::VGA)],
            Resolution::VGA,
            PixelFormat::Bgra,
            0,
        );
        assert!(matches!(
            pipeline.push_frame(frame.clone()),
            Err(AppError::NotRunning)
        ));

        pipeline.start().await.unwrap();
        let tiny = Resolution::new(64, 64);
        let small = VideoFrame::from_vec(
            vec![0; PixelFormat::Bgra.frame_size(tiny)],
            tiny,
            PixelFormat::Bgra,
            1,
        );
        assert!(matches!(
            pipeline.push_frame(small),
            Err(AppError::FrameRejected(RejectReason::TooSmall))
        ));
        assert_eq!(pipeline.stats().rejected_frames, 1);
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_when_idle() {
        let (pipeline, _sent) = pipeline();
        assert!(matches!(pipeline.stop().await, Err(AppError::NotRunning)));
        let first = assert_ok!(pipeline.start().await);
        assert!(matches!(pipeline.start().await, Err(AppError::Internal(_))));
        assert_ok!(pipeline.stop().await);
        assert_err!(pipeline.stop().await);
        // restart gets a fresh session
        let second = assert_ok!(pipeline.start().await);
        assert_ne!(first, second);
        assert_ok!(pipeline.stop().await);
    }

    #[tokio::test]
    async fn test_invalid_settings_never_start() {
        let (pipeline, _sent) = pipeline();
        let bad = StreamSettings {
            stream_key: String::new(),
            ..config().stream
        };
        assert!(matches!(
            pipeline.update_settings(bad).await,
            Err(AppError::Config(_))
        ));
        // rejected settings are not stored
        assert_eq!(pipeline.user_settings().stream_key, "key");

        let (broken, _sent) = pipeline_with_stream(StreamSettings {
            url: String::new(),
            ..config().stream
        });
        let mut errors = broken.events().subscribe_topic("stream.error");
        assert!(matches!(broken.start().await, Err(AppError::Config(_))));
        assert!(!broken.is_running().await);
        assert!(matches!(
            errors.recv().await,
            Some(SystemEvent::StreamError {
                kind: ErrorKind::Configuration,
                manual_restart_required: true,
                ..
            })
        ));
    }

    fn pipeline_with_stream(stream: StreamSettings) -> (StreamPipeline, Arc<AtomicU32>) {
        let (pipeline, sent) = pipeline();
        let config = AppConfig {
            stream,
            ..config()
        };
        let pipeline = StreamPipeline::new(config, pipeline.registry.clone(), pipeline.connector.clone());
        (pipeline, sent)
    }

    /// Session that loses itself on the first frame
    struct InvalidatedSession;

    impl CompressionSession for InvalidatedSession {
        fn name(&self) -> &str {
            "fragile"
        }

        fn is_hardware(&self) -> bool {
            false
        }

        fn input_format(&self) -> PixelFormat {
            PixelFormat::Yuv420
        }

        fn set_input_format(&mut self, _format: PixelFormat) -> std::result::Result<(), EncoderStatus> {
            Ok(())
        }

        fn set_property(&mut self, _property: SessionProperty) -> std::result::Result<(), EncoderStatus> {
            Ok(())
        }

        fn encode(
            &mut self,
            _frame: &VideoFrame,
            _pts_ms: u64,
            _force_keyframe: bool,
        ) -> std::result::Result<Option<EncodedSample>, EncoderStatus> {
            Err(EncoderStatus::SessionInvalidated)
        }
    }

    /// Hands out one session, then refuses
    struct OneShotFactory {
        created: AtomicU32,
    }

    impl EncoderFactory for OneShotFactory {
        fn name(&self) -> &str {
            "fragile"
        }

        fn is_hardware(&self) -> bool {
            false
        }

        fn priority(&self) -> u32 {
            1
        }

        fn supports(&self, _codec: VideoCodec) -> bool {
            true
        }

        fn create(&self, _spec: &SessionSpec) -> std::result::Result<Box<dyn CompressionSession>, EncoderStatus> {
            if self.created.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Box::new(InvalidatedSession))
            } else {
                Err(EncoderStatus::AllocationFailed)
            }
        }
    }

    #[tokio::test]
    async fn test_unrecoverable_encoder_releases_stream() {
        let (pipeline, _sent) = pipeline();
        let registry = EncoderRegistry::new().with(Arc::new(OneShotFactory {
            created: AtomicU32::new(0),
        }));
        let pipeline = StreamPipeline::new(config(), registry, pipeline.connector.clone());
        let mut errors = pipeline.events().subscribe_topic("stream.error");
        let mut state = pipeline.watch_state();
        pipeline.start().await.unwrap();

        let mut source = TestPatternSource::new(Resolution::new(320, 240), 30);
        let _ = pipeline.push_frame(source.next_frame());

        let event = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .expect("stream error in time");
        assert!(matches!(
            event,
            Some(SystemEvent::StreamError {
                kind: ErrorKind::Encoder,
                manual_restart_required: true,
                ..
            })
        ));
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Failed),
        )
        .await
        .expect("failed in time")
        .unwrap();

        assert!(!pipeline.is_running().await);
        assert!(matches!(
            pipeline.push_frame(source.next_frame()),
            Err(AppError::NotRunning)
        ));
        assert_err!(pipeline.stop().await);
        // a manual restart opens a fresh session, which the factory refuses
        assert!(pipeline.start().await.is_err());
    }

    #[tokio::test]
    async fn test_update_settings_live() {
        let (pipeline, _sent) = pipeline();
        pipeline.start().await.unwrap();

        let faster = StreamSettings {
            video_bitrate_kbps: 3000,
            fps: 25,
            ..config().stream
        };
        pipeline.update_settings(faster.clone()).await.unwrap();
        assert_eq!(pipeline.active_settings(), faster);
        assert_eq!(*pipeline.user_settings(), faster);

        let bigger = StreamSettings {
            resolution: Resolution::VGA,
            ..faster
        };
        pipeline.update_settings(bigger).await.unwrap();
        assert_eq!(pipeline.active_settings().resolution, Resolution::VGA);
        pipeline.stop().await.unwrap();
    }
}
