//! [`Session`] – one robot, one broadcaster, one controller and a chat
//! backend, wired together behind the inbound-message entry point used by
//! the cockpit.

use std::sync::Arc;

use so100_hal::RobotSession;
use so100_middleware::{ConnectionBroadcaster, ObserverId, ObserverReceiver};
use so100_types::{InboundMessage, OutboundMessage, Phase, SessionError};
use tracing::{info, warn};

use crate::chat::{ChatBackend, ChatMessage, StubChat};
use crate::controller::{BehaviorController, ControllerConfig, Skills};

pub struct Session {
    robot: Arc<dyn RobotSession>,
    broadcaster: ConnectionBroadcaster,
    controller: BehaviorController,
    chat: Arc<dyn ChatBackend>,
    fallback_chat: StubChat,
}

impl Session {
    pub fn new(
        robot: Arc<dyn RobotSession>,
        broadcaster: ConnectionBroadcaster,
        skills: Skills,
        chat: Arc<dyn ChatBackend>,
        config: ControllerConfig,
    ) -> Self {
        let controller = BehaviorController::new(Arc::clone(&robot), broadcaster.clone(), skills, config);
        if !chat.is_available() {
            warn!(provider = chat.name(), "chat backend unavailable; using stub replies");
        }
        Self {
            robot,
            broadcaster,
            controller,
            chat,
            fallback_chat: StubChat,
        }
    }

    pub fn robot_kind(&self) -> &'static str {
        self.robot.kind()
    }

    pub fn phase(&self) -> Phase {
        self.controller.phase()
    }

    pub fn controller(&self) -> &BehaviorController {
        &self.controller
    }

    pub fn broadcaster(&self) -> &ConnectionBroadcaster {
        &self.broadcaster
    }

    /// Register a new observer. It receives every event broadcast from now on.
    pub fn attach_observer(&self) -> (ObserverId, ObserverReceiver) {
        let (id, rx) = self.broadcaster.attach();
        info!(observer = %id, observers = self.broadcaster.len(), "observer attached");
        (id, rx)
    }

    pub fn detach_observer(&self, id: ObserverId) {
        if self.broadcaster.unregister(id) {
            info!(observer = %id, observers = self.broadcaster.len(), "observer detached");
        }
    }

    /// Route one inbound text frame from observer `from`.
    ///
    /// Protocol and chat errors go back to `from` only; commands are handed
    /// to the controller and report through broadcasts.
    pub async fn handle_message(&self, from: ObserverId, text: &str) {
        match InboundMessage::parse(text) {
            Ok(InboundMessage::Command(command)) => self.controller.handle(command).await,
            Ok(InboundMessage::Chat { text }) => self.chat(from, &text).await,
            Err(e) => {
                warn!(observer = %from, error = %e, "rejected inbound message");
                self.broadcaster.send_to(from, OutboundMessage::error(e.to_string()));
            }
        }
    }

    async fn chat(&self, from: ObserverId, text: &str) {
        let backend: &dyn ChatBackend = if self.chat.is_available() {
            self.chat.as_ref()
        } else {
            &self.fallback_chat
        };
        match backend.chat(&[ChatMessage::user(text)]).await {
            Ok(reply) => {
                self.broadcaster.broadcast(&OutboundMessage::chat(reply));
            }
            Err(e) => {
                warn!(observer = %from, backend = backend.name(), error = %e, "chat failed");
                let err = SessionError::Chat(e.to_string());
                self.broadcaster.send_to(from, OutboundMessage::error(err.to_string()));
            }
        }
    }

    /// Stop every task, then release the robot.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        self.robot.disconnect().await;
        info!(backend = self.robot.kind(), "session closed");
    }
}
