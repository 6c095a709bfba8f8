//! [`SkillRunner`] – the bounded observe → decide → act loop shared by the
//! search and grasp skills.
//!
//! ```text
//! for step in 0..max_steps:
//!     cancelled?            -> Cancelled
//!     obs = observe()
//!     stop(obs)?            -> Succeeded (no action this step)
//!     send(decide(obs))
//!     wait out step_period  (cancellable)
//! -> Exhausted
//! ```
//!
//! `steps_taken` counts observations; `actions_sent` counts
//! `send_joint_targets` calls. A skill without an available policy returns
//! [`SkillOutcome::Unavailable`] immediately, which callers must keep apart
//! from an exhausted search.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use so100_hal::RobotSession;
use so100_types::{JointTargets, Observation, SessionError};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────────────────────
// Strategy traits
// ─────────────────────────────────────────────────────────────────────────────

/// A decision strategy: observation in, joint targets out.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Label for logs, e.g. `"scan"`.
    fn name(&self) -> &str;

    /// Whether the policy can actually be invoked. Unwired policies report
    /// `false` instead of failing at call time.
    fn is_available(&self) -> bool {
        true
    }

    /// Decide the targets for loop iteration `step` (0-based).
    async fn decide(&self, observation: &Observation, step: usize) -> Result<JointTargets, SessionError>;
}

/// Early-exit predicate checked against every observation before acting.
pub trait StopCondition: Send + Sync {
    fn should_stop(&self, observation: &Observation) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// SkillSpec
// ─────────────────────────────────────────────────────────────────────────────

/// A loaded control skill.
#[derive(Clone)]
pub struct SkillSpec {
    name: String,
    policy: Option<Arc<dyn Policy>>,
    max_steps: usize,
    step_period: Duration,
}

impl SkillSpec {
    /// A skill with no policy, 50 steps at 5 Hz.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: None,
            max_steps: 50,
            step_period: Duration::from_millis(200),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_optional_policy(mut self, policy: Option<Arc<dyn Policy>>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_step_period(mut self, period: Duration) -> Self {
        self.step_period = period;
        self
    }

    /// Convenience for `with_step_period(1 / hz)`; `0` means no pacing.
    pub fn with_step_hz(self, hz: f64) -> Self {
        let period = if hz > 0.0 {
            Duration::from_secs_f64(1.0 / hz)
        } else {
            Duration::ZERO
        };
        self.with_step_period(period)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn step_period(&self) -> Duration {
        self.step_period
    }

    pub fn policy_name(&self) -> Option<&str> {
        self.policy.as_deref().map(|p| p.name())
    }

    /// `true` when a policy is configured and reports itself available.
    pub fn is_available(&self) -> bool {
        self.policy.as_ref().is_some_and(|p| p.is_available())
    }
}

impl std::fmt::Debug for SkillSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillSpec")
            .field("name", &self.name)
            .field("policy", &self.policy_name())
            .field("max_steps", &self.max_steps)
            .field("step_period", &self.step_period)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillOutcome {
    /// The stop condition fired.
    Succeeded,
    /// `max_steps` iterations ran without the stop condition firing.
    Exhausted,
    /// No usable policy; nothing was executed.
    Unavailable,
    /// The cancellation token fired between iterations.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkillReport {
    pub outcome: SkillOutcome,
    pub steps_taken: usize,
    pub actions_sent: usize,
}

impl SkillReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == SkillOutcome::Succeeded
    }

    fn unavailable() -> Self {
        Self {
            outcome: SkillOutcome::Unavailable,
            steps_taken: 0,
            actions_sent: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SkillRunner
// ─────────────────────────────────────────────────────────────────────────────

/// Drives one [`RobotSession`] through a [`SkillSpec`].
#[derive(Clone)]
pub struct SkillRunner {
    robot: Arc<dyn RobotSession>,
}

impl SkillRunner {
    pub fn new(robot: Arc<dyn RobotSession>) -> Self {
        Self { robot }
    }

    /// Run `spec` until `stop` fires, `max_steps` is exhausted, or `cancel`
    /// is triggered.
    ///
    /// # Errors
    ///
    /// Any robot or policy error ends the loop and is returned as-is.
    pub async fn run(
        &self,
        spec: &SkillSpec,
        stop: Option<&dyn StopCondition>,
        cancel: &CancellationToken,
    ) -> Result<SkillReport, SessionError> {
        let policy = match spec.policy.as_ref() {
            Some(p) if p.is_available() => Arc::clone(p),
            _ => {
                info!(skill = %spec.name, policy = ?spec.policy_name(), "skill unavailable");
                return Ok(SkillReport::unavailable());
            }
        };

        let mut actions_sent = 0;
        for step in 0..spec.max_steps {
            if cancel.is_cancelled() {
                return Ok(Self::cancelled(spec, step, actions_sent));
            }
            let started = Instant::now();

            let observation = self.robot.get_observation().await?;
            if stop.is_some_and(|s| s.should_stop(&observation)) {
                info!(skill = %spec.name, steps = step + 1, "stop condition met");
                return Ok(SkillReport {
                    outcome: SkillOutcome::Succeeded,
                    steps_taken: step + 1,
                    actions_sent,
                });
            }

            let targets = policy.decide(&observation, step).await?;
            self.robot.send_joint_targets(&targets).await?;
            actions_sent += 1;
            debug!(skill = %spec.name, step, joints = targets.len(), "action sent");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(Self::cancelled(spec, step + 1, actions_sent));
                }
                _ = sleep_until(started + spec.step_period) => {}
            }
        }

        info!(skill = %spec.name, steps = spec.max_steps, "step budget exhausted");
        Ok(SkillReport {
            outcome: SkillOutcome::Exhausted,
            steps_taken: spec.max_steps,
            actions_sent,
        })
    }

    fn cancelled(spec: &SkillSpec, steps_taken: usize, actions_sent: usize) -> SkillReport {
        info!(skill = %spec.name, steps = steps_taken, "skill cancelled");
        SkillReport {
            outcome: SkillOutcome::Cancelled,
            steps_taken,
            actions_sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use so100_hal::MockRobot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock robot wrapper that counts calls and tracks concurrent writes.
    struct CountingRobot {
        inner: MockRobot,
        observations: AtomicUsize,
        sends: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl CountingRobot {
        fn new() -> Self {
            Self {
                inner: MockRobot::default(),
                observations: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_after: None,
            }
        }

        fn failing_after(n: usize) -> Self {
            Self {
                fail_after: Some(n),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl RobotSession for CountingRobot {
        fn kind(&self) -> &'static str {
            "counting"
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
            let n = self.observations.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after.is_some_and(|limit| n > limit) {
                return Err(SessionError::ResourceUnavailable("camera unplugged".into()));
            }
            self.inner.get_observation().await
        }
        async fn send_joint_targets(&self, targets: &JointTargets) -> Result<(), SessionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let result = self.inner.send_joint_targets(targets).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.sends.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    struct StepPolicy;

    #[async_trait]
    impl Policy for StepPolicy {
        fn name(&self) -> &str {
            "step"
        }
        async fn decide(&self, _: &Observation, step: usize) -> Result<JointTargets, SessionError> {
            Ok(JointTargets::new().with("joint_0", step as f64))
        }
    }

    struct OfflinePolicy;

    #[async_trait]
    impl Policy for OfflinePolicy {
        fn name(&self) -> &str {
            "offline"
        }
        fn is_available(&self) -> bool {
            false
        }
        async fn decide(&self, _: &Observation, _: usize) -> Result<JointTargets, SessionError> {
            Err(SessionError::SkillUnavailable("offline".into()))
        }
    }

    /// Fires on the `nth` call (1-based).
    struct StopOnCall {
        calls: AtomicUsize,
        nth: usize,
    }

    impl StopOnCall {
        fn new(nth: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                nth,
            }
        }
    }

    impl StopCondition for StopOnCall {
        fn should_stop(&self, _: &Observation) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.nth
        }
    }

    async fn connected() -> Arc<CountingRobot> {
        let robot = Arc::new(CountingRobot::new());
        robot.connect().await.unwrap();
        robot
    }

    fn spec(max_steps: usize) -> SkillSpec {
        SkillSpec::new("test")
            .with_policy(Arc::new(StepPolicy))
            .with_max_steps(max_steps)
            .with_step_period(Duration::ZERO)
    }

    #[tokio::test]
    async fn stop_on_third_observation_succeeds_after_three_steps() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());
        let stop = StopOnCall::new(3);

        let report = runner
            .run(&spec(5), Some(&stop), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, SkillOutcome::Succeeded);
        assert_eq!(report.steps_taken, 3);
        assert_eq!(report.actions_sent, 2);
        assert_eq!(robot.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn without_stop_condition_runs_full_horizon() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());

        let report = runner
            .run(&spec(10), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, SkillOutcome::Exhausted);
        assert!(!report.succeeded());
        assert_eq!(report.steps_taken, 10);
        assert_eq!(report.actions_sent, 10);
        assert_eq!(robot.sends.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn terminates_within_max_steps_for_any_budget() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());
        for n in [0, 1, 2, 7] {
            let before = robot.observations.load(Ordering::SeqCst);
            let never = StopOnCall::new(usize::MAX);
            let report = runner
                .run(&spec(n), Some(&never), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(report.steps_taken, n);
            assert_eq!(robot.observations.load(Ordering::SeqCst) - before, n);
        }
    }

    #[tokio::test]
    async fn missing_policy_is_unavailable_and_touches_nothing() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());

        let report = runner
            .run(&SkillSpec::new("search"), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, SkillOutcome::Unavailable);
        assert_eq!(report.steps_taken, 0);
        assert_eq!(robot.observations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn policy_reporting_unavailable_is_not_invoked() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());
        let spec = SkillSpec::new("grasp").with_policy(Arc::new(OfflinePolicy));
        assert!(!spec.is_available());

        let report = runner
            .run(&spec, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, SkillOutcome::Unavailable);
    }

    #[tokio::test]
    async fn pre_cancelled_token_runs_no_iterations() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner.run(&spec(10), None, &cancel).await.unwrap();
        assert_eq!(report.outcome, SkillOutcome::Cancelled);
        assert_eq!(report.steps_taken, 0);
        assert_eq!(robot.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait_stops_between_steps_and_stays_connected() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());
        let cancel = CancellationToken::new();
        let slow = spec(100).with_step_period(Duration::from_millis(100));

        let task = {
            let (runner, cancel) = (runner.clone(), cancel.clone());
            tokio::spawn(async move { runner.run(&slow, None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.outcome, SkillOutcome::Cancelled);
        assert_eq!(report.steps_taken, 3);
        assert_eq!(report.actions_sent, 3);
        assert_eq!(robot.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(robot.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_paced_by_the_step_period() {
        let robot = connected().await;
        let runner = SkillRunner::new(robot.clone());
        let paced = spec(4).with_step_hz(10.0);

        let started = Instant::now();
        runner
            .run(&paced, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn robot_failure_ends_the_loop_with_the_error() {
        let robot = Arc::new(CountingRobot::failing_after(2));
        robot.connect().await.unwrap();
        let runner = SkillRunner::new(robot.clone());

        let err = runner
            .run(&spec(10), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ResourceUnavailable(_)));
        assert_eq!(robot.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unconnected_robot_reports_not_connected() {
        let robot: Arc<dyn RobotSession> = Arc::new(MockRobot::default());
        let runner = SkillRunner::new(robot);
        let err = runner
            .run(&spec(3), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotConnected);
    }

    #[test]
    fn step_hz_zero_disables_pacing() {
        let spec = SkillSpec::new("x").with_step_hz(0.0);
        assert_eq!(spec.step_period(), Duration::ZERO);
        assert_eq!(SkillSpec::new("x").with_step_hz(5.0).step_period(), Duration::from_millis(200));
    }
}
