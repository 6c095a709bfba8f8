//! [`BehaviorController`] – the phase state machine.
//!
//! Owns at most one streaming task and at most one behavior
//! (search-then-grasp) task. Commands are serialized; every phase change is
//! checked against [`Phase::can_transition_to`] and broadcast as a `status`
//! event while the state lock is held, so observers see transitions in the
//! order they happened.
//!
//! | From | Trigger | To |
//! |---|---|---|
//! | Idle | `start_stream` | Streaming |
//! | Streaming | `stop_stream` | Idle |
//! | Streaming | stream failure | Error |
//! | Idle / Streaming | `search_and_grasp` | Searching |
//! | Searching | object detected, or no search policy with [`SearchUnavailable::PassThrough`] | Grasping |
//! | Searching | detection timeout, robot failure, or [`SearchUnavailable::Abort`] | Error |
//! | Searching / Grasping | superseded by a new `search_and_grasp`, or shutdown | Idle |
//! | Grasping | grasp horizon completes | Done |
//! | Grasping | robot failure or no grasp policy | Error |
//! | Done / Error | any command | Idle, then the command is processed |
//!
//! Tasks are cancelled cooperatively through a [`CancellationToken`] that
//! the loops check between iterations; the robot stays connected.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use so100_hal::RobotSession;
use so100_middleware::ConnectionBroadcaster;
use so100_types::{Command, OutboundMessage, Phase, SessionError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detector::{DetectObject, ObjectDetector};
use crate::skill_runner::{SkillOutcome, SkillRunner, SkillSpec};
use crate::streaming::StreamingLoop;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// What `search_and_grasp` does when the search skill has no usable policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchUnavailable {
    /// Skip the search and go straight to grasping.
    #[default]
    PassThrough,
    /// End in `Error` with a `SkillUnavailable` reason.
    Abort,
}

impl FromStr for SearchUnavailable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pass_through" | "passthrough" => Ok(Self::PassThrough),
            "abort" => Ok(Self::Abort),
            other => Err(format!("unknown search-unavailable policy '{other}' (expected pass_through or abort)")),
        }
    }
}

impl fmt::Display for SearchUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PassThrough => "pass_through",
            Self::Abort => "abort",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub demo_fps: u32,
    pub on_search_unavailable: SearchUnavailable,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            demo_fps: 15,
            on_search_unavailable: SearchUnavailable::PassThrough,
        }
    }
}

/// The two skills plus the detector that ends the search.
#[derive(Clone)]
pub struct Skills {
    pub search: SkillSpec,
    pub grasp: SkillSpec,
    pub detector: Arc<dyn ObjectDetector>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

struct TaskHandle {
    id: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Cancel and wait for the task to leave its loop.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                warn!(task = self.id, "task panicked while stopping");
            }
        }
    }
}

struct State {
    phase: Phase,
    stream: Option<TaskHandle>,
    behavior: Option<TaskHandle>,
}

enum BehaviorEnd {
    Completed,
    Cancelled,
}

struct Inner {
    robot: Arc<dyn RobotSession>,
    broadcaster: ConnectionBroadcaster,
    stream: StreamingLoop,
    runner: SkillRunner,
    skills: Skills,
    on_search_unavailable: SearchUnavailable,
    state: Mutex<State>,
    commands: tokio::sync::Mutex<()>,
    next_task_id: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────────────────
// BehaviorController
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap to clone; clones drive the same state machine.
#[derive(Clone)]
pub struct BehaviorController {
    inner: Arc<Inner>,
}

impl BehaviorController {
    pub fn new(
        robot: Arc<dyn RobotSession>,
        broadcaster: ConnectionBroadcaster,
        skills: Skills,
        config: ControllerConfig,
    ) -> Self {
        let stream = StreamingLoop::new(Arc::clone(&robot), broadcaster.clone(), config.demo_fps);
        let runner = SkillRunner::new(Arc::clone(&robot));
        Self {
            inner: Arc::new(Inner {
                robot,
                broadcaster,
                stream,
                runner,
                skills,
                on_search_unavailable: config.on_search_unavailable,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    stream: None,
                    behavior: None,
                }),
                commands: tokio::sync::Mutex::new(()),
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().stream.is_some()
    }

    pub fn is_behavior_running(&self) -> bool {
        self.inner.lock().behavior.is_some()
    }

    /// Apply one command. Commands never fail observably; problems surface
    /// as `status`/`error` events.
    pub async fn handle(&self, command: Command) {
        let _serial = self.inner.commands.lock().await;
        info!(action = command.action(), phase = %self.phase(), "command received");
        self.inner.leave_terminal();

        match command {
            Command::StartStream => self.inner.start_stream(),
            Command::StopStream => self.inner.stop_stream().await,
            Command::SearchAndGrasp { object } => self.inner.search_and_grasp(object).await,
        }
    }

    /// Cancel both tasks and wait for them to end. The robot is left as is.
    pub async fn shutdown(&self) {
        let _serial = self.inner.commands.lock().await;
        let (behavior, stream) = {
            let mut st = self.inner.lock();
            if st.phase != Phase::Idle {
                self.inner.set_phase(&mut st, Phase::Idle, "shutting down");
            }
            (st.behavior.take(), st.stream.take())
        };
        for handle in [behavior, stream].into_iter().flatten() {
            handle.stop().await;
        }
        info!("controller shut down");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Move to `next` if the edge is legal, broadcasting the new phase.
    fn set_phase(&self, state: &mut State, next: Phase, text: impl Into<String>) -> bool {
        let from = state.phase;
        if from == next {
            return false;
        }
        if !from.can_transition_to(next) {
            warn!(%from, to = %next, "illegal phase transition rejected");
            return false;
        }
        let text = text.into();
        state.phase = next;
        info!(%from, to = %next, text = %text, "phase changed");
        self.broadcaster.broadcast(&OutboundMessage::status(text, next));
        true
    }

    fn leave_terminal(&self) {
        let mut st = self.lock();
        if st.phase.is_terminal() {
            self.set_phase(&mut st, Phase::Idle, "ready");
        }
    }

    // ── Streaming ───────────────────────────────────────────────────────────

    fn start_stream(self: &Arc<Self>) {
        let mut st = self.lock();
        if st.stream.is_none() {
            let id = self.next_id();
            let cancel = CancellationToken::new();
            let join = tokio::spawn(Arc::clone(self).run_stream(id, cancel.clone()));
            st.stream = Some(TaskHandle { id, cancel, join });
            debug!(task = id, "stream task spawned");
        } else {
            debug!("stream already running");
        }
        if st.phase == Phase::Idle {
            self.set_phase(&mut st, Phase::Streaming, "streaming_started");
        }
    }

    async fn stop_stream(&self) {
        let handle = {
            let mut st = self.lock();
            if st.phase == Phase::Streaming {
                self.set_phase(&mut st, Phase::Idle, "streaming_stopped");
            }
            st.stream.take()
        };
        match handle {
            Some(handle) => handle.stop().await,
            None => debug!("stop_stream with no stream running"),
        }
    }

    async fn run_stream(self: Arc<Self>, id: u64, cancel: CancellationToken) {
        let result = self.stream.run(cancel).await;

        let mut st = self.lock();
        if !st.stream.as_ref().is_some_and(|h| h.id == id) {
            return;
        }
        st.stream = None;
        if let Err(e) = result {
            if st.phase == Phase::Streaming {
                self.set_phase(&mut st, Phase::Error, format!("Streaming failed: {e}"));
            }
        }
    }

    // ── Behavior ────────────────────────────────────────────────────────────

    async fn search_and_grasp(self: &Arc<Self>, object: String) {
        let previous = {
            let mut st = self.lock();
            let previous = st.behavior.take();
            if previous.is_some() && st.phase.is_behavior() {
                self.set_phase(&mut st, Phase::Idle, "previous search_and_grasp cancelled");
            }
            previous
        };
        if let Some(handle) = previous {
            info!(task = handle.id, "cancelling in-flight behavior");
            handle.stop().await;
        }

        let mut st = self.lock();
        let text = format!("search_and_grasp started for '{object}'");
        if !self.set_phase(&mut st, Phase::Searching, text) {
            return;
        }
        let id = self.next_id();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(Arc::clone(self).run_behavior(id, object, cancel.clone()));
        st.behavior = Some(TaskHandle { id, cancel, join });
    }

    fn is_current(&self, id: u64) -> bool {
        self.lock().behavior.as_ref().is_some_and(|h| h.id == id)
    }

    /// Reasoning events from superseded tasks are dropped.
    fn narrate(&self, id: u64, thought: impl Into<String>) {
        if self.is_current(id) {
            self.broadcaster.broadcast(&OutboundMessage::reasoning(thought));
        }
    }

    fn advance(&self, id: u64, next: Phase, text: impl Into<String>) -> bool {
        let mut st = self.lock();
        if !st.behavior.as_ref().is_some_and(|h| h.id == id) {
            return false;
        }
        self.set_phase(&mut st, next, text)
    }

    async fn run_behavior(self: Arc<Self>, id: u64, object: String, cancel: CancellationToken) {
        let result = self.behavior(id, &object, &cancel).await;

        let mut st = self.lock();
        if !st.behavior.as_ref().is_some_and(|h| h.id == id) {
            debug!(task = id, "superseded behavior finished");
            return;
        }
        st.behavior = None;
        match result {
            Ok(BehaviorEnd::Completed) => {
                self.set_phase(&mut st, Phase::Done, format!("search_and_grasp completed for '{object}'"));
            }
            Ok(BehaviorEnd::Cancelled) => {
                if st.phase.is_behavior() {
                    self.set_phase(&mut st, Phase::Idle, "search_and_grasp cancelled");
                }
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!(object = %object, error = %e, "search_and_grasp failed on the robot");
                } else {
                    info!(object = %object, error = %e, "search_and_grasp gave up");
                }
                self.broadcaster.broadcast(&OutboundMessage::error(e.to_string()));
                self.set_phase(&mut st, Phase::Error, e.to_string());
            }
        }
    }

    async fn behavior(&self, id: u64, object: &str, cancel: &CancellationToken) -> Result<BehaviorEnd, SessionError> {
        let search = &self.skills.search;
        self.narrate(
            id,
            format!(
                "Starting search for '{object}' using {} policy.",
                search.policy_name().unwrap_or("no")
            ),
        );
        self.robot.connect().await?;

        let stop = DetectObject::new(Arc::clone(&self.skills.detector), object);
        let report = self.runner.run(search, Some(&stop), cancel).await?;
        match report.outcome {
            SkillOutcome::Cancelled => return Ok(BehaviorEnd::Cancelled),
            SkillOutcome::Succeeded => self.narrate(
                id,
                format!(
                    "Object '{object}' is visible after {} steps. Switching to grasp phase.",
                    report.steps_taken
                ),
            ),
            SkillOutcome::Unavailable => match self.on_search_unavailable {
                SearchUnavailable::PassThrough => self.narrate(
                    id,
                    format!("No search policy available; skipping search and grasping '{object}' directly."),
                ),
                SearchUnavailable::Abort => {
                    return Err(SessionError::SkillUnavailable(format!(
                        "no search policy configured for '{object}'"
                    )));
                }
            },
            SkillOutcome::Exhausted => {
                return Err(SessionError::DetectionTimeout {
                    object: object.to_string(),
                    steps: report.steps_taken,
                });
            }
        }

        if !self.advance(id, Phase::Grasping, format!("grasping '{object}'")) {
            return Ok(BehaviorEnd::Cancelled);
        }
        self.narrate(id, format!("Moving end-effector to grasp '{object}'."));

        let report = self.runner.run(&self.skills.grasp, None, cancel).await?;
        match report.outcome {
            SkillOutcome::Cancelled => Ok(BehaviorEnd::Cancelled),
            SkillOutcome::Unavailable => Err(SessionError::SkillUnavailable(format!(
                "no grasp policy configured for '{object}'"
            ))),
            SkillOutcome::Succeeded | SkillOutcome::Exhausted => {
                self.narrate(
                    id,
                    format!("Grasp completed for '{object}' after {} steps.", report.steps_taken),
                );
                Ok(BehaviorEnd::Completed)
            }
        }
    }
}
