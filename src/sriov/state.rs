//! PF state machine
//!
//! Type-safe state machine for the SR-IOV lifecycle of a physical function,
//! using the state-machines crate in dynamic dispatch mode.

use state_machines::state_machine;

state_machine! {
    name: PfMachine,
    dynamic: true,
    initial: Uninitialized,
    states: [Uninitialized, Enabled, Disabled],
    events {
        enable {
            transition: { from: Uninitialized, to: Enabled }
        }
        disable {
            transition: { from: Enabled, to: Disabled }
        }
    }
}

/// Simple state enum for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Enabled,
    Disabled,
}

impl State {
    /// Parse state from string representation
    pub fn from_str(s: &str) -> Self {
        match s {
            "Enabled" => State::Enabled,
            "Disabled" => State::Disabled,
            _ => State::Uninitialized,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Uninitialized => "uninitialized",
            State::Enabled => "enabled",
            State::Disabled => "disabled",
        };
        f.write_str(s)
    }
}
