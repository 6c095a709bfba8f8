//! `so100-runtime` – sessions, skills and the behavior state machine.
//!
//! Everything here talks to the arm through [`RobotSession`] and to
//! observers through [`ConnectionBroadcaster`]; neither the backend nor the
//! transport is visible.
//!
//! # Modules
//!
//! - [`skill_runner`] – [`SkillRunner`]: the bounded observe → decide → act
//!   loop, plus the [`Policy`] and [`StopCondition`] strategy traits.
//! - [`policy`] – built-in policies ([`ScanPolicy`], [`ScriptedGraspPolicy`],
//!   [`RemotePolicy`]) and [`resolve_policy`] for configured locations.
//! - [`detector`] – [`ObjectDetector`] implementations used to end a search.
//! - [`streaming`] – [`StreamingLoop`]: periodic `frame` fan-out.
//! - [`controller`] – [`BehaviorController`]: the phase state machine
//!   owning at most one stream task and one behavior task.
//! - [`session`] – [`Session`]: routes inbound observer messages to the
//!   controller or the chat backend.
//! - [`chat`] – [`ChatBackend`] implementations and [`build_chat`].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to export spans.
//!
//! [`RobotSession`]: so100_hal::RobotSession
//! [`ConnectionBroadcaster`]: so100_middleware::ConnectionBroadcaster

pub mod chat;
pub mod controller;
pub mod detector;
pub mod policy;
pub mod session;
pub mod skill_runner;
pub mod streaming;
pub mod telemetry;

pub use chat::{ChatBackend, ChatConfig, ChatError, ChatMessage, StubChat, build_chat};
pub use controller::{BehaviorController, ControllerConfig, SearchUnavailable, Skills};
pub use detector::{ColorDetector, DetectObject, NeverDetector, ObjectDetector};
pub use policy::{RemotePolicy, ScanPolicy, ScriptedGraspPolicy, resolve_policy};
pub use session::Session;
pub use skill_runner::{Policy, SkillOutcome, SkillReport, SkillRunner, SkillSpec, StopCondition};
pub use streaming::StreamingLoop;
pub use telemetry::{TracerProviderGuard, init_tracing};
