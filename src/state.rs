//! The playback state machine.
//!
//! Every session lives in exactly one state and only the transitions
//! in the table below are legal. Anything else is a programming error
//! somewhere upstream; it is rejected with a warning rather than a
//! panic because a misbehaving embedder must not take the session down.
//!
//! | From      | To                                               |
//! |-----------|--------------------------------------------------|
//! | idle      | loading                                          |
//! | loading   | ready, error                                     |
//! | ready     | playing, seeking, error                          |
//! | playing   | paused, seeking, buffering, ended, error         |
//! | paused    | playing, seeking, error                          |
//! | seeking   | ready, playing, paused, buffering, error, seeking|
//! | buffering | playing, paused, seeking, error                  |
//! | ended     | seeking, idle                                    |
//! | error     | idle                                             |

use serde::Serialize;

/// The session states.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    /// No media attached.
    Idle,
    /// `load()` in progress.
    Loading,
    /// Media open, not yet playing.
    Ready,
    Playing,
    Paused,
    /// A seek is resolving.
    Seeking,
    /// Stalled waiting for data mid-playback.
    Buffering,
    /// Playback reached end of media.
    Ended,
    /// A fatal error ended the session.
    Error,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Seeking => "seeking",
            Self::Buffering => "buffering",
            Self::Ended => "ended",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Whether `from -> to` appears in the legal-transitions table.
#[must_use]
pub fn is_legal_transition(from: PlayerState, to: PlayerState) -> bool {
    use PlayerState::*;
    matches!(
        (from, to),
        (Idle, Loading)
            | (Loading, Ready | Error)
            | (Ready, Playing | Seeking | Error)
            | (Playing, Paused | Seeking | Buffering | Ended | Error)
            | (Paused, Playing | Seeking | Error)
            | (Seeking, Ready | Playing | Paused | Buffering | Error | Seeking)
            | (Buffering, Playing | Paused | Seeking | Error)
            | (Ended, Seeking | Idle)
            | (Error, Idle)
    )
}

/// Tracks the current state and enforces the table.
#[derive(Debug)]
pub struct StateMachine {
    state: PlayerState,
}

impl StateMachine {
    /// Creates a machine in `Idle`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: PlayerState::Idle,
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Attempts a transition.
    ///
    /// Returns `true` when the state changed (the caller then emits the
    /// change event). Illegal transitions leave the state untouched and
    /// log a warning; a self-transition other than `seeking -> seeking`
    /// is a silent no-op.
    pub fn transition(&mut self, to: PlayerState) -> bool {
        if self.state == to && to != PlayerState::Seeking {
            return false;
        }

        if !is_legal_transition(self.state, to) {
            warn!("rejecting illegal state transition {} -> {to}", self.state);
            return false;
        }

        trace!("state {} -> {to}", self.state);
        self.state = to;
        true
    }

    /// Forces the machine back to `Idle` (destroy), which is always
    /// allowed because teardown cannot fail.
    pub fn force_idle(&mut self) {
        self.state = PlayerState::Idle;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PlayerState::*;

    const ALL: [PlayerState; 9] = [
        Idle, Loading, Ready, Playing, Paused, Seeking, Buffering, Ended, Error,
    ];

    /// The table, spelled out pair by pair.
    const LEGAL: &[(PlayerState, PlayerState)] = &[
        (Idle, Loading),
        (Loading, Ready),
        (Loading, Error),
        (Ready, Playing),
        (Ready, Seeking),
        (Ready, Error),
        (Playing, Paused),
        (Playing, Seeking),
        (Playing, Buffering),
        (Playing, Ended),
        (Playing, Error),
        (Paused, Playing),
        (Paused, Seeking),
        (Paused, Error),
        (Seeking, Ready),
        (Seeking, Playing),
        (Seeking, Paused),
        (Seeking, Buffering),
        (Seeking, Error),
        (Seeking, Seeking),
        (Buffering, Playing),
        (Buffering, Paused),
        (Buffering, Seeking),
        (Buffering, Error),
        (Ended, Seeking),
        (Ended, Idle),
        (Error, Idle),
    ];

    #[test]
    fn table_is_exact() {
        for from in ALL {
            for to in ALL {
                let expected = LEGAL.contains(&(from, to));
                assert_eq!(
                    is_legal_transition(from, to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn machine_walks_a_normal_session() {
        let mut machine = StateMachine::new();
        for state in [Loading, Ready, Playing, Seeking, Playing, Paused, Playing, Ended] {
            assert!(machine.transition(state), "expected {state} accepted");
        }
        assert_eq!(machine.state(), Ended);
    }

    #[test]
    fn illegal_transition_is_rejected_in_place() {
        let mut machine = StateMachine::new();
        assert!(!machine.transition(Playing), "idle cannot start playing");
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn seek_supersession_is_a_real_transition() {
        let mut machine = StateMachine::new();
        machine.transition(Loading);
        machine.transition(Ready);
        machine.transition(Seeking);
        assert!(machine.transition(Seeking), "seeking -> seeking is legal");
    }

    #[test]
    fn other_self_transitions_are_silent_noops() {
        let mut machine = StateMachine::new();
        machine.transition(Loading);
        assert!(!machine.transition(Loading));
        assert_eq!(machine.state(), Loading);
    }
}
