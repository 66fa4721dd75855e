//! Session status machine.
//!
//! ```text
//! connecting ──► listening ◄──► speaking
//!     │              │              │
//!     └──────────────┴──────┬───────┘
//!                           ▼
//!                    error | closed   (terminal)
//! ```

use tracing::{debug, warn};

use crate::ipc::events::SessionState;

/// Whether `from → to` is a legal change of status.
pub fn is_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (Error | Closed, _) => false,
        (_, Error | Closed) => true,
        (Connecting, Listening) => true,
        (Listening, Speaking) | (Speaking, Listening) => true,
        _ => false,
    }
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Returns `true` only when the status actually changed.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next == self.state {
            return false;
        }
        if !is_allowed(self.state, next) {
            if !self.state.is_terminal() {
                warn!(from = %self.state, to = %next, "ignoring illegal session transition");
            }
            return false;
        }
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 5] = [Connecting, Listening, Speaking, Error, Closed];

    #[test]
    fn starts_connecting() {
        assert_eq!(SessionStateMachine::new().state(), Connecting);
    }

    #[test]
    fn terminal_states_never_change() {
        for terminal in [Error, Closed] {
            for next in ALL {
                let mut machine = SessionStateMachine { state: terminal };
                assert!(!machine.advance(next));
                assert_eq!(machine.state(), terminal);
            }
        }
    }

    #[test]
    fn speaking_only_after_listening() {
        let mut machine = SessionStateMachine::new();
        assert!(!machine.advance(Speaking));
        assert!(machine.advance(Listening));
        assert!(machine.advance(Speaking));
        assert!(machine.advance(Listening));
    }

    #[test]
    fn repeating_a_state_is_not_a_change() {
        let mut machine = SessionStateMachine::new();
        machine.advance(Listening);
        assert!(!machine.advance(Listening));
    }

    #[test]
    fn any_live_state_can_fail_or_close() {
        for from in [Connecting, Listening, Speaking] {
            assert!(is_allowed(from, Error));
            assert!(is_allowed(from, Closed));
        }
        assert!(!is_allowed(Speaking, Connecting));
        assert!(!is_allowed(Listening, Connecting));
    }
}
