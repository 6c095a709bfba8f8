//! `so100-types` – shared vocabulary for the SO100 demo workspace.
//!
//! Every other crate speaks in these types: sampled robot state
//! ([`Observation`]), commanded motion ([`JointTargets`]), the session
//! lifecycle ([`Phase`]), the observer wire protocol ([`InboundMessage`],
//! [`OutboundMessage`]) and the global error taxonomy ([`SessionError`]).

pub mod observation;
pub mod phase;
pub mod protocol;

pub use observation::{Image, JointMap, JointTargets, Observation};
pub use phase::Phase;
pub use protocol::{Command, InboundMessage, OutboundMessage};

use thiserror::Error;

/// Global error type spanning robot I/O, skill availability, and protocol
/// violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// An operation on the robot was attempted before `connect()` or after
    /// `disconnect()`.
    #[error("Robot not connected")]
    NotConnected,

    /// The backing device could not be acquired or failed mid-operation.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// No policy is configured for the requested skill.
    #[error("Skill unavailable: {0}")]
    SkillUnavailable(String),

    /// The search loop exhausted its step budget without a detection.
    #[error("Detection timeout: '{object}' not visible after {steps} steps")]
    DetectionTimeout { object: String, steps: usize },

    /// Malformed or unrecognised inbound message. The payload is the exact
    /// text reported back to the observer.
    #[error("{0}")]
    Protocol(String),

    /// The chat backend failed to produce a reply.
    #[error("Chat backend error: {0}")]
    Chat(String),
}

impl SessionError {
    /// `true` for errors that end the current task lifecycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected | SessionError::ResourceUnavailable(_)
        )
    }
}
