//! [`StreamingLoop`] – periodic observation sampling fanned out as `frame`
//! events.
//!
//! The loop connects the robot (idempotent), then on every tick samples one
//! observation and broadcasts it. Any robot error is broadcast as an `error`
//! event and ends the loop; it never spins on a dead device. Cancellation is
//! checked before every sample, so a stop takes effect within one period.

use std::sync::Arc;
use std::time::Duration;

use so100_hal::RobotSession;
use so100_middleware::ConnectionBroadcaster;
use so100_types::{OutboundMessage, SessionError};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct StreamingLoop {
    robot: Arc<dyn RobotSession>,
    broadcaster: ConnectionBroadcaster,
    period: Duration,
}

impl StreamingLoop {
    /// Sample at `fps` frames per second (clamped to at least 1).
    pub fn new(robot: Arc<dyn RobotSession>, broadcaster: ConnectionBroadcaster, fps: u32) -> Self {
        Self {
            robot,
            broadcaster,
            period: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run until `cancel` fires (returns the number of frames published) or
    /// the robot fails.
    ///
    /// # Errors
    ///
    /// The robot error that ended the loop, after it has been broadcast.
    pub async fn run(&self, cancel: CancellationToken) -> Result<u64, SessionError> {
        if let Err(e) = self.robot.connect().await {
            return Err(self.fail(e));
        }
        info!(period_ms = self.period.as_millis() as u64, backend = self.robot.kind(), "stream loop started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            match self.robot.get_observation().await {
                Ok(observation) => {
                    let delivered = self.broadcaster.broadcast(&OutboundMessage::frame(&observation));
                    frames += 1;
                    debug!(frames, delivered, "frame published");
                }
                Err(e) => return Err(self.fail(e)),
            }
        }

        info!(frames, "stream loop stopped");
        Ok(frames)
    }

    fn fail(&self, error: SessionError) -> SessionError {
        warn!(error = %error, "stream loop failed");
        self.broadcaster
            .broadcast(&OutboundMessage::error(format!("Streaming stopped: {error}")));
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use so100_hal::MockRobot;
    use so100_types::{JointTargets, Observation};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves `ok_frames` observations, then fails every call.
    struct FlakyRobot {
        inner: MockRobot,
        ok_frames: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RobotSession for FlakyRobot {
        fn kind(&self) -> &'static str {
            "flaky"
        }
        fn joint_names(&self) -> Vec<String> {
            self.inner.joint_names()
        }
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
        async fn connect(&self) -> Result<(), SessionError> {
            self.inner.connect().await
        }
        async fn disconnect(&self) {
            self.inner.disconnect().await
        }
        async fn get_observation(&self) -> Result<Observation, SessionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok_frames {
                return Err(SessionError::ResourceUnavailable("usb reset".into()));
            }
            self.inner.get_observation().await
        }
        async fn send_joint_targets(&self, t: &JointTargets) -> Result<(), SessionError> {
            self.inner.send_joint_targets(t).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_frames_until_cancelled() {
        let hub = ConnectionBroadcaster::default();
        let (_, mut rx) = hub.attach();
        let robot = Arc::new(MockRobot::default());
        let stream = StreamingLoop::new(robot.clone(), hub, 10);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { stream.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        let frames = task.await.unwrap().unwrap();

        // Ticks at 0, 100 and 200 ms.
        assert_eq!(frames, 3);
        for _ in 0..3 {
            match rx.recv().await {
                Some(OutboundMessage::Frame { shape, image_shape, .. }) => {
                    assert_eq!(shape, [480, 640, 3]);
                    assert_eq!(image_shape, [240, 320, 3]);
                }
                other => panic!("expected frame, got {other:?}"),
            }
        }
        assert!(robot.is_connected(), "cancellation must leave the robot connected");
    }

    #[tokio::test(start_paused = true)]
    async fn robot_failure_reports_error_and_terminates() {
        let hub = ConnectionBroadcaster::default();
        let (_, mut rx) = hub.attach();
        let robot = Arc::new(FlakyRobot {
            inner: MockRobot::default(),
            ok_frames: 2,
            calls: AtomicUsize::new(0),
        });
        let stream = StreamingLoop::new(robot.clone(), hub, 15);

        let err = stream.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::ResourceUnavailable(_)));
        // Exactly one failing call: the loop does not spin.
        assert_eq!(robot.calls.load(Ordering::SeqCst), 3);

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["frame", "frame", "error"]);
    }

    #[tokio::test]
    async fn pre_cancelled_loop_publishes_nothing() {
        let hub = ConnectionBroadcaster::default();
        let (_, mut rx) = hub.attach();
        let stream = StreamingLoop::new(Arc::new(MockRobot::default()), hub, 15);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(stream.run(cancel).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn period_follows_fps() {
        let stream = StreamingLoop::new(Arc::new(MockRobot::default()), ConnectionBroadcaster::default(), 0);
        assert_eq!(stream.period(), Duration::from_secs(1));
        let stream = StreamingLoop::new(Arc::new(MockRobot::default()), ConnectionBroadcaster::default(), 20);
        assert_eq!(stream.period(), Duration::from_millis(50));
    }
}
