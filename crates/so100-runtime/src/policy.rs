//! Built-in [`Policy`] strategies and the location resolver.
//!
//! | Policy | Source | Behaviour |
//! |---|---|---|
//! | [`ScanPolicy`] | mock default for search | sinusoidal sweep around the current joints |
//! | [`ScriptedGraspPolicy`] | mock default for grasp | steps the gripper joint closed, holds the rest |
//! | [`RemotePolicy`] | `http://` / `https://` location | POSTs the observation to an inference server |
//! | [`UnwiredPolicy`] | any other location | reports unavailable |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use so100_types::{JointMap, JointTargets, Observation, SessionError};
use tracing::{info, warn};

use crate::skill_runner::Policy;

// ─────────────────────────────────────────────────────────────────────────────
// ScanPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// Pans every joint around its current position:
/// `target = current + amplitude · sin(step / 3 + joint_index)`.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub amplitude: f64,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self { amplitude: 0.1 }
    }
}

#[async_trait]
impl Policy for ScanPolicy {
    fn name(&self) -> &str {
        "scan"
    }

    async fn decide(&self, observation: &Observation, step: usize) -> Result<JointTargets, SessionError> {
        Ok(observation
            .joints
            .iter()
            .enumerate()
            .map(|(idx, (name, current))| {
                let delta = self.amplitude * (step as f64 / 3.0 + idx as f64).sin();
                (name.clone(), current + delta)
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ScriptedGraspPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// Moves the gripper joint by `close_step` every step. The gripper is the
/// joint named `gripper` when present, otherwise the last joint.
#[derive(Debug, Clone)]
pub struct ScriptedGraspPolicy {
    pub close_step: f64,
}

impl Default for ScriptedGraspPolicy {
    fn default() -> Self {
        Self { close_step: -0.05 }
    }
}

fn gripper_joint(joints: &JointMap) -> Option<&String> {
    joints
        .keys()
        .find(|name| name.as_str() == "gripper")
        .or_else(|| joints.keys().next_back())
}

#[async_trait]
impl Policy for ScriptedGraspPolicy {
    fn name(&self) -> &str {
        "scripted_grasp"
    }

    async fn decide(&self, observation: &Observation, _step: usize) -> Result<JointTargets, SessionError> {
        let mut targets: JointTargets = observation.joints.clone().into();
        if let Some(gripper) = gripper_joint(&observation.joints) {
            let current = observation.joints[gripper];
            targets.insert(gripper.clone(), current + self.close_step);
        }
        Ok(targets)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RemotePolicy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct InferenceRequest<'a> {
    step: usize,
    joints: &'a JointMap,
    image_shape: [usize; 3],
    /// Base64 raw RGB8, row-major.
    image: String,
}

#[derive(Deserialize)]
struct InferenceResponse {
    action: BTreeMap<String, f64>,
}

/// Client for a policy served over HTTP.
///
/// Request body: `{"step", "joints", "image_shape", "image"}`; expected
/// reply: `{"action": {"<joint>": <target>, …}}`.
pub struct RemotePolicy {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl RemotePolicy {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn infer(&self, observation: &Observation, step: usize) -> Result<InferenceResponse, reqwest::Error> {
        let body = InferenceRequest {
            step,
            joints: &observation.joints,
            image_shape: observation.image.shape(),
            image: BASE64.encode(observation.image.as_bytes()),
        };
        self.client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl Policy for RemotePolicy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(&self, observation: &Observation, step: usize) -> Result<JointTargets, SessionError> {
        let reply = self.infer(observation, step).await.map_err(|e| {
            SessionError::ResourceUnavailable(format!("policy '{}' at {}: {e}", self.name, self.endpoint))
        })?;
        Ok(reply.action.into())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UnwiredPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// A configured location this build cannot load (e.g. a checkpoint
/// directory). Always unavailable.
#[derive(Debug, Clone)]
pub struct UnwiredPolicy {
    name: String,
    location: String,
}

impl UnwiredPolicy {
    pub fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl Policy for UnwiredPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn decide(&self, _: &Observation, _: usize) -> Result<JointTargets, SessionError> {
        Err(SessionError::SkillUnavailable(format!(
            "{} policy at '{}' is not served over HTTP",
            self.name, self.location
        )))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Build the policy for skill `name` from its configured `location`.
///
/// * `http(s)://…` → [`RemotePolicy`]
/// * any other non-empty location → [`UnwiredPolicy`]
/// * no location → `fallback` (the mock defaults, or `None` on hardware)
pub fn resolve_policy(
    name: &str,
    location: Option<&str>,
    timeout: Duration,
    fallback: Option<Arc<dyn Policy>>,
) -> Option<Arc<dyn Policy>> {
    match location.map(str::trim).filter(|l| !l.is_empty()) {
        Some(loc) if loc.starts_with("http://") || loc.starts_with("https://") => {
            info!(skill = name, endpoint = loc, "using remote policy");
            Some(Arc::new(RemotePolicy::new(name, loc, timeout)))
        }
        Some(loc) => {
            warn!(skill = name, location = loc, "policy location is not an HTTP endpoint; skill unavailable");
            Some(Arc::new(UnwiredPolicy {
                name: name.to_string(),
                location: loc.to_string(),
            }))
        }
        None => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use so100_types::Image;

    fn obs(joints: &[(&str, f64)]) -> Observation {
        Observation::new(
            Image::filled(2, 2, [0, 0, 0]),
            joints.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
        )
    }

    #[tokio::test]
    async fn scan_offsets_each_joint_by_its_phase() {
        let o = obs(&[("joint_0", 0.0), ("joint_1", 1.0), ("joint_2", 0.0)]);
        let t = ScanPolicy::default().decide(&o, 3).await.unwrap();

        assert!((t.get("joint_0").unwrap() - 0.1 * 1.0f64.sin()).abs() < 1e-12);
        assert!((t.get("joint_1").unwrap() - (1.0 + 0.1 * 2.0f64.sin())).abs() < 1e-12);
        assert!((t.get("joint_2").unwrap() - 0.1 * 3.0f64.sin()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn scripted_grasp_moves_named_gripper_and_holds_others() {
        let o = obs(&[("gripper", 10.0), ("wrist_roll", 5.0)]);
        let t = ScriptedGraspPolicy { close_step: -1.0 }.decide(&o, 0).await.unwrap();
        assert_eq!(t.get("gripper"), Some(9.0));
        assert_eq!(t.get("wrist_roll"), Some(5.0));
    }

    #[tokio::test]
    async fn scripted_grasp_falls_back_to_last_joint() {
        let o = obs(&[("joint_0", 0.0), ("joint_2", 0.5)]);
        let t = ScriptedGraspPolicy::default().decide(&o, 0).await.unwrap();
        assert!((t.get("joint_2").unwrap() - 0.45).abs() < 1e-12);
        assert_eq!(t.get("joint_0"), Some(0.0));
    }

    #[test]
    fn location_resolution() {
        let timeout = Duration::from_secs(1);
        let fallback: Arc<dyn Policy> = Arc::new(ScanPolicy::default());

        let remote = resolve_policy("search", Some("http://gpu:9000/act"), timeout, None).unwrap();
        assert!(remote.is_available());
        assert_eq!(remote.name(), "search");

        let unwired = resolve_policy("grasp", Some("outputs/pretrained_model"), timeout, None).unwrap();
        assert!(!unwired.is_available());

        let fell_back = resolve_policy("search", Some("  "), timeout, Some(fallback)).unwrap();
        assert_eq!(fell_back.name(), "scan");

        assert!(resolve_policy("grasp", None, timeout, None).is_none());
    }

    #[tokio::test]
    async fn unwired_policy_refuses_to_decide() {
        let p = resolve_policy("grasp", Some("/ckpt"), Duration::from_secs(1), None).unwrap();
        let err = p.decide(&obs(&[]), 0).await.unwrap_err();
        assert!(matches!(err, SessionError::SkillUnavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_remote_policy_is_resource_unavailable() {
        let p = RemotePolicy::new("search", "http://127.0.0.1:9/act", Duration::from_millis(200));
        let err = p.decide(&obs(&[("joint_0", 0.0)]), 0).await.unwrap_err();
        assert!(matches!(err, SessionError::ResourceUnavailable(_)));
    }

    #[test]
    fn inference_reply_parses_action_map() {
        let reply: InferenceResponse =
            serde_json::from_str(r#"{"action": {"joint_0": 0.25, "gripper": -3}}"#).unwrap();
        let targets: JointTargets = reply.action.into();
        assert_eq!(targets.get("gripper"), Some(-3.0));
    }
}
