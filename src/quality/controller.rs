//! Adaptive bitrate / frame-rate control
//!
//! The controller never touches resolution, and every setting it proposes
//! stays inside the envelope derived from the user settings:
//! bitrate in [85%, 110%] of the user bitrate, frame rate in
//! [85% of the user rate, user rate].

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::monitor::{SystemLoad, SystemMonitor, ThermalState};
use crate::config::{QualityConfig, StreamSettings};
use crate::events::{EventBus, SystemEvent};

/// CPU usage above this is an overload
pub const CPU_CRITICAL_PERCENT: f32 = 85.0;
/// Memory usage above this is an overload
pub const MEMORY_CRITICAL_PERCENT: f32 = 90.0;
/// Bitrate step per adjustment
pub const BITRATE_STEP_KBPS: u32 = 250;
/// Frame rate step per adjustment
pub const FPS_STEP: u32 = 2;

const MIN_RATIO: f64 = 0.85;
const MAX_BITRATE_RATIO: f64 = 1.10;

/// Worst observed load condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadCondition {
    None,
    CpuOverload,
    MemoryOverload,
    ThermalThrottling,
}

impl LoadCondition {
    /// Whether the condition also steps the frame rate down
    pub fn reduces_fps(&self) -> bool {
        matches!(
            self,
            LoadCondition::CpuOverload | LoadCondition::ThermalThrottling
        )
    }
}

/// Pick the single worst condition: thermal, then CPU, then memory
pub fn classify(load: &SystemLoad) -> LoadCondition {
    if load.thermal >= ThermalState::Serious {
        LoadCondition::ThermalThrottling
    } else if load.cpu_percent > CPU_CRITICAL_PERCENT {
        LoadCondition::CpuOverload
    } else if load.memory_percent > MEMORY_CRITICAL_PERCENT {
        LoadCondition::MemoryOverload
    } else {
        LoadCondition::None
    }
}

/// Bounds derived from the user settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub min_fps: u32,
    pub max_fps: u32,
}

impl Envelope {
    pub fn of(user: &StreamSettings) -> Self {
        let bitrate = user.video_bitrate_kbps as f64;
        let max_fps = user.fps.max(1);
        Self {
            min_bitrate_kbps: (bitrate * MIN_RATIO).ceil() as u32,
            max_bitrate_kbps: (bitrate * MAX_BITRATE_RATIO).floor() as u32,
            min_fps: ((max_fps as f64 * MIN_RATIO).ceil() as u32).clamp(1, max_fps),
            max_fps,
        }
    }

    pub fn contains(&self, settings: &StreamSettings) -> bool {
        (self.min_bitrate_kbps..=self.max_bitrate_kbps).contains(&settings.video_bitrate_kbps)
            && (self.min_fps..=self.max_fps).contains(&settings.fps)
    }

    fn clamp(&self, mut settings: StreamSettings, user: &StreamSettings) -> StreamSettings {
        settings.video_bitrate_kbps = settings
            .video_bitrate_kbps
            .clamp(self.min_bitrate_kbps, self.max_bitrate_kbps);
        settings.fps = settings.fps.clamp(self.min_fps, self.max_fps);
        settings.resolution = user.resolution;
        settings
    }
}

/// Propose active settings for `condition`
///
/// Each overload lands on `min(active, user - step)` inside the envelope, so
/// applying the same condition twice changes nothing. `None` returns
/// `active` unchanged.
pub fn adjust(
    active: &StreamSettings,
    user: &StreamSettings,
    condition: LoadCondition,
) -> StreamSettings {
    if condition == LoadCondition::None {
        return active.clone();
    }
    let envelope = Envelope::of(user);
    let mut next = active.clone();

    next.video_bitrate_kbps = active
        .video_bitrate_kbps
        .min(user.video_bitrate_kbps.saturating_sub(BITRATE_STEP_KBPS));
    if condition.reduces_fps() {
        next.fps = active.fps.min(user.fps.saturating_sub(FPS_STEP));
    }
    envelope.clamp(next, user)
}

/// Step active settings back toward the user values, never above them
pub fn restore(active: &StreamSettings, user: &StreamSettings) -> StreamSettings {
    let envelope = Envelope::of(user);
    let mut next = active.clone();
    next.video_bitrate_kbps = active
        .video_bitrate_kbps
        .saturating_add(BITRATE_STEP_KBPS)
        .min(user.video_bitrate_kbps);
    next.fps = active.fps.saturating_add(FPS_STEP).min(user.fps);
    envelope.clamp(next, user)
}

/// Periodic quality controller
///
/// Reads the user settings from `user` and publishes new active settings
/// on `active`; whoever owns the encoder watches that channel.
pub struct QualityController {
    config: QualityConfig,
    monitor: Box<dyn SystemMonitor>,
    user: Arc<ArcSwap<StreamSettings>>,
    active: Arc<watch::Sender<StreamSettings>>,
    events: EventBus,
    healthy_streak: u32,
}

impl QualityController {
    pub fn new(
        config: QualityConfig,
        monitor: Box<dyn SystemMonitor>,
        user: Arc<ArcSwap<StreamSettings>>,
        active: Arc<watch::Sender<StreamSettings>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            monitor,
            user,
            active,
            events,
            healthy_streak: 0,
        }
    }

    /// Handle one load sample; returns the new active settings if they changed
    pub fn evaluate(&mut self, load: SystemLoad) -> Option<StreamSettings> {
        let user = self.user.load_full();
        let current = self.active.borrow().clone();
        let condition = classify(&load);

        let (next, restored) = if condition == LoadCondition::None {
            self.healthy_streak = self.healthy_streak.saturating_add(1);
            if self.healthy_streak < self.config.restore_after.max(1) {
                return None;
            }
            self.healthy_streak = 0;
            (restore(&current, &user), true)
        } else {
            self.healthy_streak = 0;
            (adjust(&current, &user, condition), false)
        };

        if next == current {
            return None;
        }

        if restored {
            info!(
                "Load back to normal, restoring {}kbps @ {}fps",
                next.video_bitrate_kbps, next.fps
            );
        } else {
            info!(
                "{:?} (cpu {:.0}%, mem {:.0}%, thermal {:?}): {}kbps @ {}fps",
                condition,
                load.cpu_percent,
                load.memory_percent,
                load.thermal,
                next.video_bitrate_kbps,
                next.fps
            );
        }
        self.active.send_replace(next.clone());
        self.events.publish(SystemEvent::QualityAdjusted {
            condition,
            video_bitrate_kbps: next.video_bitrate_kbps,
            fps: next.fps,
            restored,
        });
        Some(next)
    }

    /// Sample every `interval` until cancelled
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(
                "Quality controller running every {}ms",
                self.config.interval_ms
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let load = self.monitor.sample();
                        self.evaluate(load);
                    }
                }
            }
            debug!("Quality controller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;
    use std::collections::VecDeque;
    use std::time::Duration;

    fn user() -> StreamSettings {
        StreamSettings {
            url: "rtmp://localhost/live".to_string(),
            stream_key: "key".to_string(),
            resolution: Resolution::HD1080,
            video_bitrate_kbps: 4000,
            fps: 30,
            ..Default::default()
        }
    }

    fn load(cpu: f32, memory: f32, thermal: ThermalState) -> SystemLoad {
        SystemLoad {
            cpu_percent: cpu,
            memory_percent: memory,
            thermal,
        }
    }

    #[test]
    fn test_classify_picks_worst() {
        assert_eq!(classify(&load(10.0, 10.0, ThermalState::Nominal)), LoadCondition::None);
        assert_eq!(classify(&load(85.0, 90.0, ThermalState::Fair)), LoadCondition::None);
        assert_eq!(
            classify(&load(95.0, 95.0, ThermalState::Nominal)),
            LoadCondition::CpuOverload
        );
        assert_eq!(
            classify(&load(10.0, 95.0, ThermalState::Nominal)),
            LoadCondition::MemoryOverload
        );
        assert_eq!(
            classify(&load(95.0, 95.0, ThermalState::Serious)),
            LoadCondition::ThermalThrottling
        );
    }

    #[test]
    fn test_adjust_steps_down_inside_envelope() {
        let user = user();
        let cpu = adjust(&user, &user, LoadCondition::CpuOverload);
        assert_eq!(cpu.video_bitrate_kbps, 3750);
        assert_eq!(cpu.fps, 28);
        assert_eq!(cpu.resolution, user.resolution);

        let mem = adjust(&user, &user, LoadCondition::MemoryOverload);
        assert_eq!(mem.video_bitrate_kbps, 3750);
        assert_eq!(mem.fps, 30);

        let thermal = adjust(&user, &user, LoadCondition::ThermalThrottling);
        assert_eq!(thermal.fps, 28);
    }

    #[test]
    fn test_adjust_is_idempotent_and_none_is_identity() {
        let user = user();
        for condition in [
            LoadCondition::CpuOverload,
            LoadCondition::MemoryOverload,
            LoadCondition::ThermalThrottling,
        ] {
            let once = adjust(&user, &user, condition);
            assert_eq!(adjust(&once, &user, condition), once);
        }
        let odd = StreamSettings {
            video_bitrate_kbps: 3900,
            ..user.clone()
        };
        assert_eq!(adjust(&odd, &user, LoadCondition::None), odd);
    }

    #[test]
    fn test_envelope_never_violated() {
        // low bitrates: the 250 step would cross the 85% floor
        for bitrate in [300u32, 800, 1000, 1500, 2500, 6000, 20000] {
            for fps in [1u32, 5, 10, 24, 30, 60] {
                let user = StreamSettings {
                    video_bitrate_kbps: bitrate,
                    fps,
                    ..user()
                };
                let envelope = Envelope::of(&user);
                for condition in [
                    LoadCondition::CpuOverload,
                    LoadCondition::MemoryOverload,
                    LoadCondition::ThermalThrottling,
                ] {
                    let adjusted = adjust(&user, &user, condition);
                    assert!(envelope.contains(&adjusted), "{:?} {}kbps {}fps", condition, bitrate, fps);
                    assert!(adjusted.fps <= user.fps);
                    assert!(envelope.contains(&restore(&adjusted, &user)));
                }
            }
        }
    }

    #[test]
    fn test_restore_climbs_back_to_user() {
        let user = user();
        let mut active = StreamSettings {
            video_bitrate_kbps: 3400,
            fps: 26,
            ..user.clone()
        };
        active = restore(&active, &user);
        assert_eq!((active.video_bitrate_kbps, active.fps), (3650, 28));
        active = restore(&active, &user);
        active = restore(&active, &user);
        assert_eq!((active.video_bitrate_kbps, active.fps), (4000, 30));
        assert_eq!(restore(&active, &user), active);
    }

    struct Scripted(VecDeque<SystemLoad>);

    impl SystemMonitor for Scripted {
        fn sample(&mut self) -> SystemLoad {
            self.0.pop_front().unwrap_or_default()
        }
    }

    fn controller(
        samples: Vec<SystemLoad>,
    ) -> (QualityController, watch::Receiver<StreamSettings>, EventBus) {
        let (tx, rx) = watch::channel(user());
        let events = EventBus::new();
        let controller = QualityController::new(
            QualityConfig {
                enabled: true,
                ..Default::default()
            },
            Box::new(Scripted(samples.into())),
            Arc::new(ArcSwap::from_pointee(user())),
            Arc::new(tx),
            events.clone(),
        );
        (controller, rx, events)
    }

    #[test]
    fn test_evaluate_publishes_only_changes() {
        let (mut controller, rx, events) = controller(Vec::new());
        let mut sub = events.subscribe();

        let hot = load(95.0, 50.0, ThermalState::Nominal);
        let first = controller.evaluate(hot).unwrap();
        assert_eq!(first.video_bitrate_kbps, 3750);
        assert_eq!(*rx.borrow(), first);
        assert!(controller.evaluate(hot).is_none());

        assert!(matches!(
            sub.try_recv().unwrap(),
            SystemEvent::QualityAdjusted {
                condition: LoadCondition::CpuOverload,
                restored: false,
                ..
            }
        ));
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn test_restore_after_three_healthy_samples() {
        let (mut controller, rx, _events) = controller(Vec::new());
        controller.evaluate(load(10.0, 95.0, ThermalState::Nominal));
        assert_eq!(rx.borrow().video_bitrate_kbps, 3750);

        let calm = SystemLoad::default();
        assert!(controller.evaluate(calm).is_none());
        assert!(controller.evaluate(calm).is_none());
        let restored = controller.evaluate(calm).unwrap();
        assert_eq!(restored.video_bitrate_kbps, 4000);
        assert_eq!(*rx.borrow(), user());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sampling() {
        let hot = load(99.0, 20.0, ThermalState::Nominal);
        let (controller, mut rx, _events) = controller(vec![hot]);
        let cancel = CancellationToken::new();
        let task = controller.spawn(cancel.clone());

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().fps, 28);

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        task.await.unwrap();
        // six calm samples since: stepped back to the user values
        assert_eq!(*rx.borrow(), user());
    }
}
