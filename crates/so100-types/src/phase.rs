//! [`Phase`] – the session lifecycle state and its legal edges.
//!
//! | From | To | Trigger |
//! |---|---|---|
//! | `Idle` | `Streaming` | `start_stream` |
//! | `Streaming` | `Idle` | `stop_stream` |
//! | `Streaming` | `Error` | streaming loop failed |
//! | `Idle` / `Streaming` | `Searching` | `search_and_grasp` |
//! | `Searching` | `Grasping` | object detected (or search skipped) |
//! | `Searching` | `Error` | search failed or unavailable |
//! | `Grasping` | `Done` | grasp horizon completed |
//! | `Grasping` | `Error` | grasp failed or unavailable |
//! | `Searching` / `Grasping` | `Idle` | behavior cancelled |
//! | `Done` / `Error` | `Idle` | any command |

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Streaming,
    Searching,
    Grasping,
    Done,
    Error,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Idle,
        Phase::Streaming,
        Phase::Searching,
        Phase::Grasping,
        Phase::Done,
        Phase::Error,
    ];

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Streaming => "streaming",
            Phase::Searching => "searching",
            Phase::Grasping => "grasping",
            Phase::Done => "done",
            Phase::Error => "error",
        }
    }

    /// `Done` and `Error` must be left through `Idle` before any command is
    /// processed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }

    /// `true` while a behavior task owns the phase.
    pub fn is_behavior(self) -> bool {
        matches!(self, Phase::Searching | Phase::Grasping)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Streaming)
                | (Streaming, Idle)
                | (Streaming, Error)
                | (Idle, Searching)
                | (Streaming, Searching)
                | (Searching, Grasping)
                | (Searching, Error)
                | (Searching, Idle)
                | (Grasping, Done)
                | (Grasping, Error)
                | (Grasping, Idle)
                | (Done, Idle)
                | (Error, Idle)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Grasping).unwrap(), r#""grasping""#);
        let back: Phase = serde_json::from_str(r#""done""#).unwrap();
        assert_eq!(back, Phase::Done);
    }

    #[test]
    fn grasping_is_only_reachable_from_searching() {
        for from in Phase::ALL {
            assert_eq!(
                from.can_transition_to(Phase::Grasping),
                from == Phase::Searching,
                "{from} -> grasping"
            );
        }
    }

    #[test]
    fn terminal_phases_only_leave_through_idle() {
        for terminal in [Phase::Done, Phase::Error] {
            for next in Phase::ALL {
                assert_eq!(terminal.can_transition_to(next), next == Phase::Idle);
            }
        }
    }

    #[test]
    fn no_self_loops() {
        for phase in Phase::ALL {
            assert!(!phase.can_transition_to(phase));
        }
    }
}
