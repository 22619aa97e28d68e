//! Per-commit build lifecycle.
//!
//! Pure decision logic: given the current status of a commit and what just
//! happened to it, compute the next status. No I/O happens here.
//!
//! ```text
//! unknown ──Start──▶ building ──Exited(0)──────────▶ passed
//!                        │
//!                        └──Exited(≠0) | TimedOut |
//!                           CheckoutFailed | SpawnFailed ──▶ failed
//! ```
//!
//! `passed` and `failed` are terminal. Only an explicit rebuild (`Restart`)
//! moves a terminal commit back to `building`.

use crate::model::CommitStatus;

/// Something that happened to a commit during an orchestration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildEvent {
    /// A newly discovered sha was selected for building.
    Start,
    /// An explicit external re-trigger of an already recorded sha.
    Restart,
    /// The build command exited with this code.
    Exited(i32),
    /// The build command was killed after exceeding its timeout.
    TimedOut,
    /// The working directory could not be moved to the commit.
    CheckoutFailed,
    /// The build command could not be started.
    SpawnFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid commit transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: CommitStatus,
    pub event: BuildEvent,
}

/// Compute the status a commit moves to when `event` happens in `from`.
pub fn transition(from: CommitStatus, event: BuildEvent) -> Result<CommitStatus, InvalidTransition> {
    use BuildEvent::*;
    use CommitStatus::*;

    match (from, event) {
        (Unknown, Start) => Ok(Building),
        (Passed | Failed | Building, Restart) => Ok(Building),
        (Building, Exited(0)) => Ok(Passed),
        (Building, Exited(_) | TimedOut | CheckoutFailed | SpawnFailed) => Ok(Failed),
        _ => Err(InvalidTransition { from, event }),
    }
}

/// Check if a status transition is permitted for any event.
pub fn is_valid_transition(from: CommitStatus, to: CommitStatus) -> bool {
    use CommitStatus::*;
    matches!(
        (from, to),
        (Unknown, Building)
            | (Building, Passed)
            | (Building, Failed)
            | (Passed, Building)
            | (Failed, Building)
            | (Building, Building)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommitStatus::*;

    #[test]
    fn test_start_moves_unknown_to_building() {
        assert_eq!(transition(Unknown, BuildEvent::Start), Ok(Building));
    }

    #[test]
    fn test_zero_exit_passes() {
        assert_eq!(transition(Building, BuildEvent::Exited(0)), Ok(Passed));
    }

    #[test]
    fn test_every_failure_kind_fails() {
        for event in [
            BuildEvent::Exited(1),
            BuildEvent::Exited(-1),
            BuildEvent::Exited(127),
            BuildEvent::TimedOut,
            BuildEvent::CheckoutFailed,
            BuildEvent::SpawnFailed,
        ] {
            assert_eq!(transition(Building, event), Ok(Failed), "{:?}", event);
        }
    }

    #[test]
    fn test_terminal_states_do_not_move_on_their_own() {
        for from in [Passed, Failed] {
            for event in [
                BuildEvent::Start,
                BuildEvent::Exited(0),
                BuildEvent::Exited(1),
                BuildEvent::TimedOut,
                BuildEvent::CheckoutFailed,
            ] {
                assert!(transition(from, event).is_err(), "{:?} {:?}", from, event);
            }
        }
    }

    #[test]
    fn test_restart_reopens_terminal_commit() {
        assert_eq!(transition(Passed, BuildEvent::Restart), Ok(Building));
        assert_eq!(transition(Failed, BuildEvent::Restart), Ok(Building));
        assert!(transition(Unknown, BuildEvent::Restart).is_err());
    }

    #[test]
    fn test_start_is_rejected_once_building() {
        let err = transition(Building, BuildEvent::Start).unwrap_err();
        assert_eq!(err.from, Building);
        assert!(err.to_string().contains("building"));
    }

    #[test]
    fn test_transition_results_are_valid_transitions() {
        let events = [
            BuildEvent::Start,
            BuildEvent::Restart,
            BuildEvent::Exited(0),
            BuildEvent::Exited(2),
            BuildEvent::TimedOut,
            BuildEvent::CheckoutFailed,
            BuildEvent::SpawnFailed,
        ];
        for from in [Unknown, Building, Passed, Failed] {
            for event in events {
                if let Ok(to) = transition(from, event) {
                    assert!(is_valid_transition(from, to), "{:?} -> {:?}", from, to);
                }
            }
        }
        assert!(!is_valid_transition(Passed, Failed));
        assert!(!is_valid_transition(Unknown, Passed));
    }
}
