//! State machine for one device session.

use std::fmt;

use crate::device::DeviceMode;

/// Where the session stands with respect to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No open channel.
    #[default]
    Disconnected,
    /// Talking to the application firmware.
    Application,
    /// Talking to the bootloader. No command protocol.
    Bootloader,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Application => write!(f, "APPLICATION"),
            SessionState::Bootloader => write!(f, "BOOTLOADER"),
        }
    }
}

impl From<DeviceMode> for SessionState {
    fn from(mode: DeviceMode) -> Self {
        match mode {
            DeviceMode::Application => SessionState::Application,
            DeviceMode::Bootloader => SessionState::Bootloader,
        }
    }
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }

    pub fn is_bootloader(&self) -> bool {
        matches!(self, SessionState::Bootloader)
    }
}

/// Current state plus a count of transitions taken.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: SessionState,
    transitions: usize,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of state changes since creation.
    pub fn transitions(&self) -> usize {
        self.transitions
    }

    /// Transition to a new state. Re-entering the current state is a no-op.
    pub fn goto_state(&mut self, new_state: SessionState) {
        if new_state == self.state {
            return;
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
        self.transitions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = StateMachine::new();
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert!(!machine.state().is_connected());
    }

    #[test]
    fn test_goto_state_counts_changes() {
        let mut machine = StateMachine::new();
        machine.goto_state(SessionState::Application);
        machine.goto_state(SessionState::Application);
        machine.goto_state(DeviceMode::Bootloader.into());

        assert_eq!(machine.transitions(), 2);
        assert!(machine.state().is_bootloader());
        assert_eq!(machine.state().to_string(), "BOOTLOADER");
    }
}
