use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::ConnectionStatus;

/// Lifecycle of a single session: `Connecting -> Connected -> (Disconnected | Error)`.
/// `Connecting` may also fail straight to `Error`. Terminal states are final; a new
/// attempt always gets a new machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting { started_at: DateTime<Utc> },
    Connected { since: DateTime<Utc> },
    Disconnected { at: DateTime<Utc> },
    Error { at: DateTime<Utc>, reason: String },
}

impl SessionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            SessionState::Connecting { .. } => ConnectionStatus::Connecting,
            SessionState::Connected { .. } => ConnectionStatus::Connected,
            SessionState::Disconnected { .. } => ConnectionStatus::Disconnected,
            SessionState::Error { .. } => ConnectionStatus::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnected { .. } | SessionState::Error { .. }
        )
    }
}

/// Guards transitions for one session
pub struct SessionStateMachine {
    label: String,
    state: Mutex<SessionState>,
}

impl SessionStateMachine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(SessionState::Connecting {
                started_at: Utc::now(),
            }),
        }
    }

    pub fn current(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status()
    }

    /// Try to transition from current state to new state
    /// Returns true if transition succeeded, false if it was invalid
    pub fn try_transition(&self, new_state: SessionState) -> bool {
        let mut state = self.state.lock();

        let valid = matches!(
            (&*state, &new_state),
            (SessionState::Connecting { .. }, SessionState::Connected { .. })
                | (SessionState::Connecting { .. }, SessionState::Error { .. })
                | (SessionState::Connecting { .. }, SessionState::Disconnected { .. })
                | (SessionState::Connected { .. }, SessionState::Disconnected { .. })
                | (SessionState::Connected { .. }, SessionState::Error { .. })
        );

        if valid {
            debug!(
                "✅ State transition for {}: {} -> {}",
                self.label,
                state.status(),
                new_state.status()
            );
            *state = new_state;
            true
        } else {
            warn!(
                "❌ Invalid state transition for {}: {} -> {}",
                self.label,
                state.status(),
                new_state.status()
            );
            false
        }
    }

    pub fn mark_connected(&self) -> bool {
        self.try_transition(SessionState::Connected { since: Utc::now() })
    }

    pub fn mark_disconnected(&self) -> bool {
        self.try_transition(SessionState::Disconnected { at: Utc::now() })
    }

    pub fn mark_error(&self, reason: impl Into<String>) -> bool {
        self.try_transition(SessionState::Error {
            at: Utc::now(),
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let machine = SessionStateMachine::new("peer1");
        assert_eq!(machine.status(), ConnectionStatus::Connecting);
        assert!(machine.mark_connected());
        assert!(machine.mark_disconnected());
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connecting_can_fail_directly() {
        let machine = SessionStateMachine::new("peer1");
        assert!(machine.mark_error("handshake failed"));
        assert!(machine.current().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let machine = SessionStateMachine::new("peer1");
        assert!(machine.mark_connected());
        assert!(machine.mark_error("reset"));

        assert!(!machine.mark_disconnected());
        assert!(!machine.mark_connected());
        assert!(!machine.mark_error("again"));
        match machine.current() {
            SessionState::Error { reason, .. } => assert_eq!(reason, "reset"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cannot_reconnect_same_session() {
        let machine = SessionStateMachine::new("peer1");
        assert!(machine.mark_connected());
        assert!(!machine.mark_connected());
    }
}
