//! Events broadcast on the event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::publish::ConnectionState;
use crate::quality::LoadCondition;
use crate::stats::StatsSnapshot;
use crate::video::encoder::EncoderState;

/// Pipeline event
///
/// Serialized with the event name as tag:
/// ```json
/// {
///   "event": "stream.state_changed",
///   "data": { "state": "publishing", "previous": "connected", "attempt": 0 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// Stream session started
    #[serde(rename = "stream.started")]
    StreamStarted {
        /// Session ID, new for every start
        session_id: String,
        /// Publish URL (stream key omitted)
        url: String,
        started_at: DateTime<Utc>,
    },

    /// Stream session stopped and fully torn down
    #[serde(rename = "stream.stopped")]
    StreamStopped { session_id: String },

    /// Publish connection state changed
    #[serde(rename = "stream.state_changed")]
    StreamStateChanged {
        state: ConnectionState,
        previous: ConnectionState,
        /// Reconnect attempt the supervisor is on (0 when healthy)
        attempt: u32,
    },

    /// A reconnect has been scheduled
    #[serde(rename = "stream.reconnecting")]
    StreamReconnecting {
        attempt: u32,
        max_attempts: u32,
        /// Wait before this attempt
        delay_ms: u64,
    },

    /// The connection came back after one or more reconnects
    #[serde(rename = "stream.recovered")]
    StreamRecovered { attempts: u32 },

    /// Periodic transmission statistics
    #[serde(rename = "stream.stats_update")]
    StreamStatsUpdate { stats: StatsSnapshot },

    /// Terminal or user-visible error
    #[serde(rename = "stream.error")]
    StreamError {
        kind: ErrorKind,
        message: String,
        /// Nothing will retry automatically; the user has to restart the stream
        manual_restart_required: bool,
    },

    /// Quality controller replaced the active settings
    #[serde(rename = "quality.adjusted")]
    QualityAdjusted {
        condition: LoadCondition,
        video_bitrate_kbps: u32,
        fps: u32,
        /// Settings moved back toward the user values
        restored: bool,
    },

    /// Encoder session lifecycle changed
    #[serde(rename = "encoder.state_changed")]
    EncoderStateChanged {
        state: EncoderState,
        /// Name of the encoder backing the session, if any
        encoder: Option<String>,
        hardware: bool,
    },

    /// Encoder session was torn down and rebuilt
    #[serde(rename = "encoder.recreated")]
    EncoderRecreated { reason: String },
}

impl SystemEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StreamStarted { .. } => "stream.started",
            Self::StreamStopped { .. } => "stream.stopped",
            Self::StreamStateChanged { .. } => "stream.state_changed",
            Self::StreamReconnecting { .. } => "stream.reconnecting",
            Self::StreamRecovered { .. } => "stream.recovered",
            Self::StreamStatsUpdate { .. } => "stream.stats_update",
            Self::StreamError { .. } => "stream.error",
            Self::QualityAdjusted { .. } => "quality.adjusted",
            Self::EncoderStateChanged { .. } => "encoder.state_changed",
            Self::EncoderRecreated { .. } => "encoder.recreated",
        }
    }

    /// Topic match: `*`, a `prefix.*` wildcard, or an exact event name
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        match topic.strip_suffix(".*") {
            Some(prefix) => event_name
                .split_once('.')
                .is_some_and(|(head, _)| head == prefix),
            None => event_name == topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_and_topics() {
        let event = SystemEvent::StreamStateChanged {
            state: ConnectionState::Publishing,
            previous: ConnectionState::Connected,
            attempt: 0,
        };
        assert_eq!(event.event_name(), "stream.state_changed");
        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("stream.*"));
        assert!(event.matches_topic("stream.state_changed"));
        assert!(!event.matches_topic("encoder.*"));
        assert!(!event.matches_topic("str.*"));
    }

    #[test]
    fn test_serialization_shape() {
        let event = SystemEvent::StreamError {
            kind: ErrorKind::Transport,
            message: "reconnect attempts exhausted".to_string(),
            manual_restart_required: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stream.error");
        assert_eq!(json["data"]["kind"], "transport");
        assert_eq!(json["data"]["manual_restart_required"], true);
    }
}
