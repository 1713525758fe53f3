//! Log throttling for per-frame error paths
//!
//! Encode and send failures can repeat every frame. The throttler lets one
//! message per key through each interval and counts what it swallowed, so
//! the next message can report how many were suppressed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Log throttler keyed by message kind
///
/// ```rust
/// use livepush::utils::LogThrottler;
///
/// let throttler = LogThrottler::with_secs(5);
/// assert!(throttler.should_log("encode_failed"));
/// assert!(!throttler.should_log("encode_failed"));
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when a message for `key` may be emitted now,
    /// where `suppressed` is how many were swallowed since the last one.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                *entry = Entry {
                    last: now,
                    suppressed: 0,
                };
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Whether a message for `key` may be emitted now
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key once its error condition has cleared
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!` that appends the suppressed count when non-zero
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!("{} ({} similar suppressed)", format_args!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::error!("{} ({} similar suppressed)", format_args!($($arg)*), suppressed);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_passes() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.check("encode"), Some(0));
    }

    #[test]
    fn test_suppressed_count_reported_after_interval() {
        let throttler = LogThrottler::new(Duration::from_millis(50));
        assert!(throttler.should_log("send"));
        assert!(!throttler.should_log("send"));
        assert!(!throttler.should_log("send"));

        thread::sleep(Duration::from_millis(80));
        assert_eq!(throttler.check("send"), Some(2));
        assert_eq!(throttler.check("send"), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("k"));
        throttler.clear("k");
        assert!(throttler.should_log("k"));
        throttler.clear_all();
        assert!(throttler.is_empty());
    }

    #[test]
    fn test_macro_compiles_and_throttles() {
        let throttler = LogThrottler::with_secs(10);
        warn_throttled!(throttler, "m", "first {}", 1);
        warn_throttled!(throttler, "m", "second {}", 2);
        error_throttled!(throttler, "e", "boom");
        assert_eq!(throttler.len(), 2);
    }
}
