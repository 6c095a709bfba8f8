//! In-process mock robot for running the whole demo without hardware.
//!
//! [`MockRobot`] keeps an in-memory joint map that `send_joint_targets`
//! updates, and renders a synthetic scene on every observation:
//!
//! * dark grey background with a lighter table band,
//! * a red cup (always visible),
//! * a blue block (revealed after `reveal_every` frames),
//! * a green ball (revealed after `2 * reveal_every` frames).
//!
//! Objects only ever appear, never disappear, so repeated sampling emulates
//! a search that gradually uncovers the scene.
//!
//! With [`MockRobotConfig::static_image`] set, the file is decoded once per
//! `connect` and every observation returns it instead. A file that cannot be
//! decoded is logged and the synthetic scene is used.
//!
//! # Example
//!
//! ```rust
//! use so100_hal::{MockRobot, RobotSession};
//!
//! # tokio_test_block(async {
//! let robot = MockRobot::default();
//! robot.connect().await.expect("mock connect never fails");
//! let obs = robot.get_observation().await.expect("connected");
//! assert_eq!(obs.image.shape(), [480, 640, 3]);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use so100_types::{Image, JointMap, JointTargets, Observation, SessionError};
use tracing::{info, warn};

use crate::robot::RobotSession;

pub const BACKGROUND: [u8; 3] = [40, 40, 40];
pub const TABLE: [u8; 3] = [90, 90, 90];
pub const RED: [u8; 3] = [255, 0, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const GREEN: [u8; 3] = [0, 255, 0];

/// Construction parameters for [`MockRobot`].
#[derive(Debug, Clone)]
pub struct MockRobotConfig {
    pub joint_names: Vec<String>,
    pub height: usize,
    pub width: usize,
    /// Frames between successive object reveals.
    pub reveal_every: u64,
    /// PNG/JPEG shown instead of the synthetic scene.
    pub static_image: Option<PathBuf>,
}

impl Default for MockRobotConfig {
    fn default() -> Self {
        Self {
            joint_names: vec!["joint_0".into(), "joint_1".into(), "joint_2".into()],
            height: 480,
            width: 640,
            reveal_every: 20,
            static_image: None,
        }
    }
}

struct MockState {
    connected: bool,
    joints: JointMap,
    frame_index: u64,
    acquisitions: u64,
    static_frame: Option<Image>,
}

/// Synthetic robot backend. See the [module docs](self).
pub struct MockRobot {
    config: MockRobotConfig,
    state: Mutex<MockState>,
}

impl MockRobot {
    pub fn new(config: MockRobotConfig) -> Self {
        let joints = config
            .joint_names
            .iter()
            .map(|name| (name.clone(), 0.0))
            .collect();
        Self {
            config,
            state: Mutex::new(MockState {
                connected: false,
                joints,
                frame_index: 0,
                acquisitions: 0,
                static_frame: None,
            }),
        }
    }

    /// How many times `connect` actually acquired the (fake) resource.
    pub fn acquisitions(&self) -> u64 {
        self.lock().acquisitions
    }

    /// Number of frames rendered so far.
    pub fn frame_index(&self) -> u64 {
        self.lock().frame_index
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Render the scene as it looks after `frame_index` samples.
    pub fn render_scene(&self, frame_index: u64) -> Image {
        let (h, w) = (self.config.height, self.config.width);
        let frac = |n: usize, f: f64| (n as f64 * f) as usize;
        let stage = (frame_index / self.config.reveal_every.max(1)).min(2);

        let mut img = Image::filled(h, w, BACKGROUND);
        img.fill_rect(frac(h, 0.6)..frac(h, 0.8), frac(w, 0.1)..frac(w, 0.9), TABLE);

        // Red cup.
        img.fill_rect(frac(h, 0.55)..frac(h, 0.7), frac(w, 0.2)..frac(w, 0.25), RED);
        if stage >= 1 {
            // Blue block.
            img.fill_rect(frac(h, 0.55)..frac(h, 0.7), frac(w, 0.45)..frac(w, 0.5), BLUE);
        }
        if stage >= 2 {
            // Green ball.
            let radius = frac(h.min(w), 0.05);
            img.fill_disc(frac(h, 0.65), frac(w, 0.75), radius, GREEN);
        }
        img
    }
}

fn decode_image(path: &Path) -> Result<Image, String> {
    let rgb = image::open(path).map_err(|e| e.to_string())?.to_rgb8();
    let (width, height) = rgb.dimensions();
    Image::from_raw(height as usize, width as usize, 3, rgb.into_raw())
        .ok_or_else(|| "decoded buffer does not match its dimensions".to_string())
}

fn load_static_frame(path: &Path) -> Option<Image> {
    match decode_image(path) {
        Ok(img) => {
            info!(path = %path.display(), shape = ?img.shape(), "MockRobot using static image");
            Some(img)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "static image unusable; rendering the synthetic scene");
            None
        }
    }
}

impl Default for MockRobot {
    fn default() -> Self {
        Self::new(MockRobotConfig::default())
    }
}

#[async_trait]
impl RobotSession for MockRobot {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn joint_names(&self) -> Vec<String> {
        self.config.joint_names.clone()
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn connect(&self) -> Result<(), SessionError> {
        if self.lock().connected {
            return Ok(());
        }
        let static_frame = self.config.static_image.as_deref().and_then(load_static_frame);

        let mut state = self.lock();
        if state.connected {
            return Ok(());
        }
        state.connected = true;
        state.acquisitions += 1;
        state.static_frame = static_frame;
        info!("MockRobot connected (mock mode)");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        if !state.connected {
            return;
        }
        state.connected = false;
        info!("MockRobot disconnected");
    }

    async fn get_observation(&self) -> Result<Observation, SessionError> {
        let (frame_index, joints, static_frame) = {
            let mut state = self.lock();
            if !state.connected {
                return Err(SessionError::NotConnected);
            }
            state.frame_index += 1;
            (state.frame_index, state.joints.clone(), state.static_frame.clone())
        };
        let image = static_frame.unwrap_or_else(|| self.render_scene(frame_index));
        Ok(Observation::new(image, joints))
    }

    async fn send_joint_targets(&self, targets: &JointTargets) -> Result<(), SessionError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(SessionError::NotConnected);
        }
        let (accepted, unknown) = targets.partition_known(&self.config.joint_names);
        if !unknown.is_empty() {
            warn!(joints = ?unknown, "MockRobot ignoring targets for unknown joints");
        }
        for (name, target) in accepted.iter() {
            state.joints.insert(name.to_string(), target);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(img: &Image, rgb: [u8; 3]) -> usize {
        img.pixels().filter(|p| *p == rgb).count()
    }

    #[tokio::test]
    async fn observation_before_connect_fails() {
        let robot = MockRobot::default();
        assert_eq!(
            robot.get_observation().await.unwrap_err(),
            SessionError::NotConnected
        );
        assert_eq!(
            robot
                .send_joint_targets(&JointTargets::new().with("joint_0", 1.0))
                .await
                .unwrap_err(),
            SessionError::NotConnected
        );
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_idempotent() {
        let robot = MockRobot::default();
        robot.connect().await.unwrap();
        robot.connect().await.unwrap();
        assert_eq!(robot.acquisitions(), 1);
        assert!(robot.is_connected());

        robot.disconnect().await;
        robot.disconnect().await;
        assert!(!robot.is_connected());
    }

    #[tokio::test]
    async fn send_joint_targets_updates_known_joints_only() {
        let robot = MockRobot::default();
        robot.connect().await.unwrap();
        robot
            .send_joint_targets(&JointTargets::new().with("joint_1", 0.7).with("bogus", 9.0))
            .await
            .unwrap();
        let obs = robot.get_observation().await.unwrap();
        assert_eq!(obs.joints.get("joint_1"), Some(&0.7));
        assert!(!obs.joints.contains_key("bogus"));
        assert_eq!(obs.joints.len(), 3);
    }

    #[test]
    fn scene_reveals_objects_monotonically() {
        let robot = MockRobot::default();
        let early = robot.render_scene(1);
        assert!(count(&early, RED) > 0);
        assert_eq!(count(&early, BLUE), 0);
        assert_eq!(count(&early, GREEN), 0);

        let middle = robot.render_scene(20);
        assert!(count(&middle, BLUE) > 0);
        assert_eq!(count(&middle, GREEN), 0);

        // Objects stay revealed long after the last stage.
        let late = robot.render_scene(1_000);
        assert!(count(&late, RED) > 0);
        assert!(count(&late, BLUE) > 0);
        assert!(count(&late, GREEN) > 0);
    }

    #[tokio::test]
    async fn each_observation_advances_the_frame_counter() {
        let robot = MockRobot::default();
        robot.connect().await.unwrap();
        for _ in 0..3 {
            robot.get_observation().await.unwrap();
        }
        assert_eq!(robot.frame_index(), 3);
    }

    #[tokio::test]
    async fn static_image_replaces_the_synthetic_scene() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.png");
        image::RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let robot = MockRobot::new(MockRobotConfig {
            static_image: Some(path),
            ..MockRobotConfig::default()
        });
        robot.connect().await.unwrap();
        for _ in 0..2 {
            let obs = robot.get_observation().await.unwrap();
            assert_eq!(obs.image.shape(), [3, 4, 3]);
            assert_eq!(count(&obs.image, [10, 20, 30]), 12);
        }
        assert_eq!(robot.frame_index(), 2);
    }

    #[tokio::test]
    async fn unreadable_static_image_falls_back_to_the_scene() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("broken.png");
        std::fs::write(&garbage, b"not an image").unwrap();

        for path in [garbage, dir.path().join("missing.png")] {
            let robot = MockRobot::new(MockRobotConfig {
                static_image: Some(path),
                ..MockRobotConfig::default()
            });
            robot.connect().await.unwrap();
            let obs = robot.get_observation().await.unwrap();
            assert_eq!(obs.image.shape(), [480, 640, 3]);
            assert!(count(&obs.image, RED) > 0);
        }
    }
}
