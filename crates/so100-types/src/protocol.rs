//! Observer wire protocol.
//!
//! Inbound (observer → session):
//!
//! ```json
//! {"type": "chat", "text": "what do you see?"}
//! {"type": "command", "action": "start_stream"}
//! {"type": "command", "action": "stop_stream"}
//! {"type": "command", "action": "search_and_grasp", "object": "tennis ball"}
//! ```
//!
//! Outbound (session → every observer) is [`OutboundMessage`], tagged by
//! `type`.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::observation::{JointMap, Observation};
use crate::phase::Phase;
use crate::SessionError;

/// Object name used when `search_and_grasp` arrives without one.
pub const DEFAULT_OBJECT: &str = "object";

/// Thumbnail bounds for `frame` payloads.
pub const THUMBNAIL_MAX_WIDTH: usize = 320;
pub const THUMBNAIL_MAX_HEIGHT: usize = 240;

/// A controller command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartStream,
    StopStream,
    SearchAndGrasp { object: String },
}

impl Command {
    /// Wire name of the action.
    pub fn action(&self) -> &'static str {
        match self {
            Command::StartStream => "start_stream",
            Command::StopStream => "stop_stream",
            Command::SearchAndGrasp { .. } => "search_and_grasp",
        }
    }
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Chat { text: String },
    Command(Command),
}

impl InboundMessage {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Protocol`] carrying the exact text to report
    /// back to the originating observer:
    ///
    /// * `Invalid JSON`
    /// * `Unknown message type: '<value>'`
    /// * `Unknown command action: '<value>'`
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let json: Value = serde_json::from_str(text)
            .map_err(|_| SessionError::Protocol("Invalid JSON".to_string()))?;

        match json.get("type").and_then(Value::as_str) {
            Some("chat") => {
                let text = match json.get("text") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                Ok(InboundMessage::Chat { text })
            }
            Some("command") => parse_command(&json).map(InboundMessage::Command),
            _ => Err(SessionError::Protocol(format!(
                "Unknown message type: '{}'",
                display_field(json.get("type"))
            ))),
        }
    }
}

fn parse_command(json: &Value) -> Result<Command, SessionError> {
    match json.get("action").and_then(Value::as_str) {
        Some("start_stream") => Ok(Command::StartStream),
        Some("stop_stream") => Ok(Command::StopStream),
        Some("search_and_grasp") => {
            let object = json
                .get("object")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_OBJECT)
                .to_string();
            Ok(Command::SearchAndGrasp { object })
        }
        _ => Err(SessionError::Protocol(format!(
            "Unknown command action: '{}'",
            display_field(json.get("action"))
        ))),
    }
}

fn display_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

/// Everything the session pushes to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// One sampled observation. `shape` is the captured frame; `image` is a
    /// base64 raw RGB8 thumbnail whose dimensions are `image_shape`.
    Frame {
        shape: [usize; 3],
        image: String,
        image_shape: [usize; 3],
        joints: JointMap,
        timestamp: DateTime<Utc>,
    },
    Status {
        text: String,
        phase: Phase,
    },
    Reasoning {
        thought: String,
    },
    Chat {
        text: String,
    },
    Error {
        text: String,
    },
}

impl OutboundMessage {
    /// Build a `frame` event from an observation.
    pub fn frame(observation: &Observation) -> Self {
        let thumb = observation
            .image
            .thumbnail(THUMBNAIL_MAX_WIDTH, THUMBNAIL_MAX_HEIGHT);
        OutboundMessage::Frame {
            shape: observation.image.shape(),
            image: BASE64.encode(thumb.as_bytes()),
            image_shape: thumb.shape(),
            joints: observation.joints.clone(),
            timestamp: observation.captured_at,
        }
    }

    pub fn status(text: impl Into<String>, phase: Phase) -> Self {
        OutboundMessage::Status {
            text: text.into(),
            phase,
        }
    }

    pub fn reasoning(thought: impl Into<String>) -> Self {
        OutboundMessage::Reasoning {
            thought: thought.into(),
        }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        OutboundMessage::Chat { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        OutboundMessage::Error { text: text.into() }
    }

    /// The `type` tag, handy for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Frame { .. } => "frame",
            OutboundMessage::Status { .. } => "status",
            OutboundMessage::Reasoning { .. } => "reasoning",
            OutboundMessage::Chat { .. } => "chat",
            OutboundMessage::Error { .. } => "error",
        }
    }
}
