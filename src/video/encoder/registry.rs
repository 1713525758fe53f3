//! Encoder registry
//!
//! Holds every encoder factory known to the process and picks candidates for
//! a [`SessionSpec`]: filtered by codec, availability and the spec's hardware
//! requirement, ordered by priority.

use std::sync::Arc;
use tracing::{debug, info};

use super::traits::{
    CompressionSession, EncoderFactory, EncoderStatus, HardwareRequirement, SessionSpec,
    VideoCodec,
};

/// Information about a registered encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableEncoder {
    pub name: String,
    pub is_hardware: bool,
    pub priority: u32,
    pub available: bool,
}

/// A session created by the registry, with the factory that made it
pub struct CreatedSession {
    pub session: Box<dyn CompressionSession>,
    pub factory: String,
}

/// Encoder registry
#[derive(Default, Clone)]
pub struct EncoderRegistry {
    factories: Vec<Arc<dyn EncoderFactory>>,
}

impl EncoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, keeping the list sorted by priority (highest first)
    pub fn register(&mut self, factory: Arc<dyn EncoderFactory>) {
        debug!(
            "Registered encoder: {} (hardware: {}, priority: {})",
            factory.name(),
            factory.is_hardware(),
            factory.priority()
        );
        self.factories.push(factory);
        self.factories
            .sort_by_key(|f| std::cmp::Reverse(f.priority()));
    }

    pub fn with(mut self, factory: Arc<dyn EncoderFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn encoders(&self) -> Vec<AvailableEncoder> {
        self.factories
            .iter()
            .map(|f| AvailableEncoder {
                name: f.name().to_string(),
                is_hardware: f.is_hardware(),
                priority: f.priority(),
                available: f.is_available(),
            })
            .collect()
    }

    pub fn has_hardware(&self, codec: VideoCodec) -> bool {
        self.factories
            .iter()
            .any(|f| f.is_hardware() && f.supports(codec) && f.is_available())
    }

    /// Eligible factories for a spec, in the order they should be tried
    pub fn candidates(&self, spec: &SessionSpec) -> Vec<Arc<dyn EncoderFactory>> {
        let mut out: Vec<Arc<dyn EncoderFactory>> = self
            .factories
            .iter()
            .filter(|f| f.supports(spec.codec) && f.is_available())
            .filter(|f| spec.hardware.allows(f.is_hardware()))
            .filter(|f| {
                spec.pinned_encoder
                    .as_deref()
                    .map_or(true, |name| f.name() == name)
            })
            .cloned()
            .collect();

        // Preferred keeps hardware ahead of software regardless of priority
        if spec.hardware == HardwareRequirement::Preferred {
            out.sort_by_key(|f| !f.is_hardware());
        }
        out
    }

    /// Create a session from the first candidate that accepts the spec
    ///
    /// Returns `EncoderNotFound` when nothing is eligible, otherwise the
    /// status of the last candidate that failed.
    pub fn create(&self, spec: &SessionSpec) -> Result<CreatedSession, EncoderStatus> {
        let candidates = self.candidates(spec);
        if candidates.is_empty() {
            debug!(
                "No {} encoder eligible for {:?} (pinned: {:?})",
                spec.codec, spec.hardware, spec.pinned_encoder
            );
            return Err(EncoderStatus::EncoderNotFound);
        }

        let mut last = EncoderStatus::EncoderNotFound;
        for factory in candidates {
            match factory.create(spec) {
                Ok(session) => {
                    info!(
                        "Created {} session with {} ({} {}, input {})",
                        spec.codec,
                        factory.name(),
                        spec.resolution,
                        if session.is_hardware() { "hardware" } else { "software" },
                        spec.input_format
                    );
                    return Ok(CreatedSession {
                        session,
                        factory: factory.name().to_string(),
                    });
                }
                Err(status) => {
                    debug!("{} rejected spec: {}", factory.name(), status);
                    last = status;
                }
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::software::RawVideoEncoderFactory;
    use crate::video::format::{PixelFormat, Resolution};

    struct FakeHardware {
        name: &'static str,
        priority: u32,
        result: EncoderStatus,
    }

    impl EncoderFactory for FakeHardware {
        fn name(&self) -> &str {
            self.name
        }
        fn is_hardware(&self) -> bool {
            true
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn supports(&self, codec: VideoCodec) -> bool {
            codec == VideoCodec::H264
        }
        fn create(&self, _spec: &SessionSpec) -> Result<Box<dyn CompressionSession>, EncoderStatus> {
            Err(self.result)
        }
    }

    fn spec(hardware: HardwareRequirement) -> SessionSpec {
        SessionSpec {
            codec: VideoCodec::H264,
            resolution: Resolution::HD720,
            input_format: PixelFormat::Yuv420,
            hardware,
            pinned_encoder: None,
        }
    }

    fn registry() -> EncoderRegistry {
        EncoderRegistry::new()
            .with(Arc::new(RawVideoEncoderFactory::new()))
            .with(Arc::new(FakeHardware {
                name: "hw-low",
                priority: 50,
                result: EncoderStatus::Malfunction,
            }))
            .with(Arc::new(FakeHardware {
                name: "hw-high",
                priority: 90,
                result: EncoderStatus::AllocationFailed,
            }))
    }

    fn names(list: &[Arc<dyn EncoderFactory>]) -> Vec<String> {
        list.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn test_candidates_follow_requirement() {
        let r = registry();
        assert_eq!(
            names(&r.candidates(&spec(HardwareRequirement::Required))),
            vec!["hw-high", "hw-low"]
        );
        assert_eq!(
            names(&r.candidates(&spec(HardwareRequirement::SoftwareOnly))),
            vec!["raw"]
        );
        assert_eq!(r.candidates(&spec(HardwareRequirement::Preferred)).len(), 3);
    }

    #[test]
    fn test_pinned_encoder() {
        let r = registry();
        let mut s = spec(HardwareRequirement::Any);
        s.pinned_encoder = Some("hw-low".to_string());
        assert_eq!(names(&r.candidates(&s)), vec!["hw-low"]);
    }

    #[test]
    fn test_create_reports_last_failure_or_not_found() {
        let r = registry();
        assert_eq!(
            r.create(&spec(HardwareRequirement::Required)).err(),
            Some(EncoderStatus::Malfunction)
        );

        let empty = EncoderRegistry::new();
        assert_eq!(
            empty.create(&spec(HardwareRequirement::Any)).err(),
            Some(EncoderStatus::EncoderNotFound)
        );

        let created = r.create(&spec(HardwareRequirement::Preferred)).unwrap();
        assert_eq!(created.factory, "raw");
        assert!(!created.session.is_hardware());
    }
}
