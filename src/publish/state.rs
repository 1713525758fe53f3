//! Publish connection states and the transition table

use serde::{Deserialize, Serialize};

/// Publish connection state
///
/// Owned by the supervisor task; everything else observes it through a
/// `watch` channel or `stream.state_changed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    /// Transport is up, publish not yet accepted
    Connected,
    Publishing,
    /// Publishing, but at least one health check failed since the last good one
    Degraded,
    /// Waiting out the backoff delay before the next connect cycle
    Reconnecting,
    /// Terminal until a manual reconnect
    Failed,
}

impl ConnectionState {
    /// Samples are forwarded to the connection in these states
    pub fn is_streaming(&self) -> bool {
        matches!(self, ConnectionState::Publishing | ConnectionState::Degraded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed)
    }

    /// Whether `self -> next` is a legal transition
    ///
    /// Every state may go back to `Idle` (stop).
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Idle {
            return true;
        }
        matches!(
            (*self, next),
            (Idle, Connecting)
                | (Idle, Failed)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Failed)
                | (Connected, Publishing)
                | (Connected, Reconnecting)
                | (Publishing, Degraded)
                | (Publishing, Reconnecting)
                | (Degraded, Publishing)
                | (Degraded, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Failed)
                | (Failed, Reconnecting)
                | (Failed, Connecting)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Publishing => "publishing",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [Idle, Connecting, Connected, Publishing, Degraded, Publishing];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_recovery_paths() {
        assert!(Degraded.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Reconnecting));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Idle.can_transition_to(Publishing));
        assert!(!Failed.can_transition_to(Publishing));
        assert!(!Reconnecting.can_transition_to(Publishing));
        assert!(!Publishing.can_transition_to(Connected));
    }

    #[test]
    fn test_stop_is_always_legal() {
        for state in [Idle, Connecting, Connected, Publishing, Degraded, Reconnecting, Failed] {
            assert!(state.can_transition_to(Idle));
        }
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Publishing).unwrap(), "\"publishing\"");
        assert_eq!(
            serde_json::from_str::<ConnectionState>("\"reconnecting\"").unwrap(),
            Reconnecting
        );
        assert!(Degraded.is_streaming());
        assert!(!Connected.is_streaming());
    }
}
