//! Publish connection supervisor
//!
//! One task owns the [`PublishConnection`] and the receiving end of the
//! encoded-sample channel. It connects, forwards samples while publishing,
//! runs the health check timer and walks the reconnect path. State is
//! published through a `watch` channel and `stream.*` events.
//!
//! ```text
//! idle -> connecting -> connected -> publishing <-> degraded
//!             ^                          |             |
//!             |                          v             v
//!             +----------------------- reconnecting ----> failed
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::PublishConnection;
use super::policy::ReconnectPolicy;
use super::state::ConnectionState;
use crate::config::{ConnectionConfig, StreamSettings};
use crate::error::{ConfigurationError, ErrorKind, TransportError};
use crate::events::{EventBus, SystemEvent};
use crate::stats::TransmissionStats;
use crate::utils::LogThrottler;
use crate::video::encoder::EncodedSample;
use crate::warn_throttled;

/// Requests accepted by the supervisor task
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Manual reconnect: reset counters, then take the reconnect path
    Reconnect,
    /// Switch to a new URL / stream key (implies a reconnect)
    Retarget(StreamSettings),
}

/// Handle to a running supervisor
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Manual reconnect; also the way out of `Failed`
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        self.commands
            .send(SupervisorCommand::Reconnect)
            .await
            .map_err(|_| TransportError::Cancelled)
    }

    /// Publish to a different URL or stream key
    pub async fn retarget(&self, settings: StreamSettings) -> Result<(), TransportError> {
        self.commands
            .send(SupervisorCommand::Retarget(settings))
            .await
            .map_err(|_| TransportError::Cancelled)
    }

    /// Cancel all timers and waits, close the connection, end in `Idle`
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Supervisor task ended abnormally: {}", e);
        }
    }
}

/// What the run loop does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Connect,
    Monitor,
    Reconnect,
    Halt,
    Stop,
}

/// Connection supervisor task state
pub struct ConnectionSupervisor {
    connection: Box<dyn PublishConnection>,
    settings: StreamSettings,
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    samples: mpsc::Receiver<EncodedSample>,
    commands: mpsc::Receiver<SupervisorCommand>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<TransmissionStats>,
    events: EventBus,
    cancel: CancellationToken,
    throttler: LogThrottler,
}

/// Race `op` against its timeout and the stop token
async fn race<T>(
    cancel: &CancellationToken,
    operation: &'static str,
    timeout: Duration,
    op: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(timeout, op) => match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout {
                operation,
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}

impl ConnectionSupervisor {
    /// Spawn the supervisor task
    ///
    /// `cancel` stops it; a child token is derived so stopping the handle
    /// does not cancel the caller's token.
    pub fn spawn(
        connection: Box<dyn PublishConnection>,
        settings: StreamSettings,
        config: ConnectionConfig,
        samples: mpsc::Receiver<EncodedSample>,
        stats: Arc<TransmissionStats>,
        events: EventBus,
        cancel: &CancellationToken,
    ) -> SupervisorHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let cancel = cancel.child_token();

        let supervisor = Self {
            connection,
            settings,
            policy: ReconnectPolicy::new(&config),
            config,
            samples,
            commands: cmd_rx,
            state_tx,
            stats,
            events,
            cancel: cancel.clone(),
            throttler: LogThrottler::with_secs(5),
        };
        let task = tokio::spawn(supervisor.run());

        SupervisorHandle {
            commands: cmd_tx,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        info!("Publish supervisor started ({})", self.connection.name());
        let mut step = Step::Connect;
        loop {
            step = match step {
                Step::Connect => self.connect_step().await,
                Step::Monitor => self.monitor().await,
                Step::Reconnect => self.reconnect_step().await,
                Step::Halt => self.halted().await,
                Step::Stop => break,
            };
        }

        if let Err(e) = self.connection.close().await {
            debug!("Close on stop failed: {}", e);
        }
        self.set_state(ConnectionState::Idle);
        info!("Publish supervisor stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            warn!("Unexpected connection transition {} -> {}", previous, next);
        }
        debug!("Connection state {} -> {}", previous, next);
        self.state_tx.send_replace(next);
        self.events.publish(SystemEvent::StreamStateChanged {
            state: next,
            previous,
            attempt: self.policy.attempts(),
        });
    }

    /// Configuration problems end in `Failed` without any retry
    fn check_settings(&mut self) -> Result<(), ConfigurationError> {
        self.settings.validate().map_err(|e| {
            error!("Stream configuration invalid: {}", e);
            self.set_state(ConnectionState::Failed);
            self.events.publish(SystemEvent::StreamError {
                kind: ErrorKind::Configuration,
                message: e.to_string(),
                manual_restart_required: true,
            });
            e
        })
    }

    async fn connect_step(&mut self) -> Step {
        if self.check_settings().is_err() {
            return Step::Halt;
        }
        self.set_state(ConnectionState::Connecting);
        match self.connect_cycle().await {
            Ok(()) => self.on_published(),
            Err(TransportError::Cancelled) => Step::Stop,
            Err(e) if !e.is_retryable() => self.unusable_target(e),
            Err(e) => {
                warn!("Connect to {} failed: {}", self.settings.url, e);
                self.stats.record_failure();
                Step::Reconnect
            }
        }
    }

    /// connect, publish, settle, re-check
    async fn connect_cycle(&mut self) -> Result<(), TransportError> {
        let url = self.settings.url.clone();
        let key = self.settings.stream_key.clone();

        race(
            &self.cancel,
            "connect",
            self.config.connect_timeout(),
            self.connection.connect(&url),
        )
        .await?;
        self.set_state(ConnectionState::Connected);

        race(
            &self.cancel,
            "publish",
            self.config.publish_timeout(),
            self.connection.publish(&key),
        )
        .await?;

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(self.config.settle_delay()) => {}
        }

        if !self.is_healthy() {
            return Err(TransportError::DroppedAfterPublish);
        }
        Ok(())
    }

    fn on_published(&mut self) -> Step {
        let attempts = self.policy.attempts();
        self.policy.reset();
        // samples that piled up while connecting are stale
        while self.samples.try_recv().is_ok() {
            self.stats.record_dropped();
        }
        self.set_state(ConnectionState::Publishing);
        info!("Publishing to {}", self.settings.url);
        if attempts > 0 {
            self.events
                .publish(SystemEvent::StreamRecovered { attempts });
        }
        Step::Monitor
    }

    fn is_healthy(&self) -> bool {
        self.connection.is_connected() && self.connection.is_publishing()
    }

    /// Count one failed check; true once the ceiling is hit
    fn on_unhealthy(&mut self, reason: &str) -> bool {
        self.stats.record_failure();
        let ceiling_hit = self.policy.record_health_failure();
        warn!(
            "Publish connection unhealthy ({}), failure {}/{}",
            reason,
            self.policy.health_failures(),
            self.config.health_failure_ceiling
        );
        if !ceiling_hit {
            self.set_state(ConnectionState::Degraded);
        }
        ceiling_hit
    }

    fn on_healthy(&mut self) {
        if self.policy.health_failures() > 0 {
            info!("Publish connection healthy again");
        }
        self.policy.reset();
        self.set_state(ConnectionState::Publishing);
    }

    fn on_command(&mut self, command: SupervisorCommand) -> Step {
        match command {
            SupervisorCommand::Reconnect => info!("Manual reconnect requested"),
            SupervisorCommand::Retarget(settings) => {
                info!("Publish target changed to {}", settings.url);
                self.settings = settings;
            }
        }
        self.policy.reset();
        Step::Reconnect
    }

    async fn transmit(&mut self, sample: EncodedSample) -> Result<(), TransportError> {
        let len = sample.data.len();
        self.connection.send(&sample).await?;
        self.stats
            .record_transmitted(len, sample.capture_ts.elapsed());
        Ok(())
    }

    /// Publishing / degraded: forward samples and run health checks
    async fn monitor(&mut self) -> Step {
        let period = self.config.health_interval();
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::Stop,
                command = self.commands.recv() => match command {
                    Some(command) => return self.on_command(command),
                    None => return Step::Stop,
                },
                _ = health.tick() => {
                    if self.is_healthy() {
                        self.on_healthy();
                    } else if self.on_unhealthy("health check") {
                        return Step::Reconnect;
                    }
                }
                sample = self.samples.recv() => {
                    let Some(sample) = sample else {
                        debug!("Sample channel closed");
                        return Step::Stop;
                    };
                    if let Err(e) = self.transmit(sample).await {
                        self.stats.record_dropped();
                        warn_throttled!(self.throttler, "send_failed", "Send failed: {}", e);
                        // a failed send only counts when the link check agrees
                        if self.is_healthy() {
                            self.on_healthy();
                        } else if self.on_unhealthy("send failed") {
                            return Step::Reconnect;
                        }
                    }
                }
            }
        }
    }

    /// Wait `delay` while draining samples; None when stopped
    async fn backoff(&mut self, delay: Duration) -> Option<Step> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(Step::Stop),
                command = self.commands.recv() => match command {
                    Some(command) => return Some(self.on_command(command)),
                    None => return Some(Step::Stop),
                },
                _ = &mut sleep => return None,
                sample = self.samples.recv() => match sample {
                    Some(_) => self.stats.record_dropped(),
                    None => return Some(Step::Stop),
                },
            }
        }
    }

    async fn reconnect_step(&mut self) -> Step {
        self.set_state(ConnectionState::Reconnecting);
        if let Err(e) = self.connection.close().await {
            debug!("Closing old connection failed: {}", e);
        }

        let Some((attempt, delay)) = self.policy.next_attempt() else {
            return self.exhausted();
        };
        info!(
            "Reconnect attempt {}/{} in {}ms",
            attempt,
            self.policy.max_attempts(),
            delay.as_millis()
        );
        self.stats.record_reconnect();
        self.events.publish(SystemEvent::StreamReconnecting {
            attempt,
            max_attempts: self.policy.max_attempts(),
            delay_ms: delay.as_millis() as u64,
        });

        if let Some(step) = self.backoff(delay).await {
            return step;
        }

        if self.check_settings().is_err() {
            return Step::Halt;
        }
        self.set_state(ConnectionState::Connecting);
        match self.connect_cycle().await {
            Ok(()) => self.on_published(),
            Err(TransportError::Cancelled) => Step::Stop,
            Err(e) if !e.is_retryable() => self.unusable_target(e),
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                self.stats.record_failure();
                self.policy.record_attempt_failure();
                self.set_state(ConnectionState::Reconnecting);
                Step::Reconnect
            }
        }
    }

    /// The transport can never reach this target; same outcome as bad settings
    fn unusable_target(&mut self, e: TransportError) -> Step {
        error!("Cannot publish to {}: {}", self.settings.url, e);
        self.set_state(ConnectionState::Failed);
        self.events.publish(SystemEvent::StreamError {
            kind: ErrorKind::Configuration,
            message: e.to_string(),
            manual_restart_required: true,
        });
        Step::Halt
    }

    fn exhausted(&mut self) -> Step {
        error!(
            "Giving up after {} reconnect attempts",
            self.policy.max_attempts()
        );
        self.set_state(ConnectionState::Failed);
        self.events.publish(SystemEvent::StreamError {
            kind: ErrorKind::Transport,
            message: format!(
                "connection lost, {} reconnect attempts failed",
                self.policy.max_attempts()
            ),
            manual_restart_required: true,
        });
        Step::Halt
    }

    /// `Failed`: nothing happens until a manual reconnect or stop
    async fn halted(&mut self) -> Step {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::Stop,
                command = self.commands.recv() => match command {
                    Some(command) => return self.on_command(command),
                    None => return Step::Stop,
                },
                sample = self.samples.recv() => match sample {
                    Some(_) => self.stats.record_dropped(),
                    None => return Step::Stop,
                },
            }
        }
    }
}
