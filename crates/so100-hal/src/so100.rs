//! Physical SO100 arm: six Feetech STS3215 servos on one UART bus plus a
//! V4L camera.
//!
//! Every device call is blocking, so each one runs on the blocking pool and
//! is bounded by `io_timeout`. A call that overruns surfaces as
//! [`SessionError::ResourceUnavailable`] and never stalls the caller.
//!
//! | Joint           | Servo id |
//! |-----------------|----------|
//! | `shoulder_pan`  | 1        |
//! | `shoulder_lift` | 2        |
//! | `elbow_flex`    | 3        |
//! | `wrist_flex`    | 4        |
//! | `wrist_roll`    | 5        |
//! | `gripper`       | 6        |
//!
//! Joint values are degrees from the servo centre position.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use so100_types::{JointMap, JointTargets, Observation, SessionError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::camera::{Camera, V4lCamera};
use crate::feetech::{self, PacketError, ServoBus};
use crate::robot::RobotSession;
use crate::transport::SerialTransport;

/// Construction parameters for [`So100Robot`].
#[derive(Debug, Clone)]
pub struct So100RobotConfig {
    /// Serial device of the servo bus, e.g. `/dev/ttyUSB0`.
    pub port: String,
    pub baud_rate: u32,
    /// `N` in `/dev/videoN`.
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    /// Upper bound for any single device call.
    pub io_timeout: Duration,
    /// Upper bound for the whole connect handshake.
    pub connect_timeout: Duration,
    /// `(joint name, servo id)` in reporting order.
    pub motors: Vec<(String, u8)>,
}

impl Default for So100RobotConfig {
    fn default() -> Self {
        let motors = [
            "shoulder_pan",
            "shoulder_lift",
            "elbow_flex",
            "wrist_flex",
            "wrist_roll",
            "gripper",
        ]
        .iter()
        .zip(1u8..)
        .map(|(name, id)| (name.to_string(), id))
        .collect();
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 1_000_000,
            camera_index: 0,
            width: 640,
            height: 480,
            io_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            motors,
        }
    }
}

/// Open device handles. Present only while connected.
struct Link {
    bus: ServoBus<SerialTransport>,
    camera: Box<dyn Camera>,
}

fn bus_error(e: PacketError) -> SessionError {
    SessionError::ResourceUnavailable(format!("servo bus: {e}"))
}

/// Hardware backend. See the [module docs](self).
pub struct So100Robot {
    config: So100RobotConfig,
    link: Arc<Mutex<Option<Link>>>,
    connected: AtomicBool,
}

impl So100Robot {
    pub fn new(config: So100RobotConfig) -> Self {
        Self {
            config,
            link: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &So100RobotConfig {
        &self.config
    }

    /// Run `op` against the open link on the blocking pool, bounded by
    /// `limit`.
    async fn with_link<R, F>(&self, what: &'static str, limit: Duration, op: F) -> Result<R, SessionError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Option<Link>) -> Result<R, SessionError> + Send + 'static,
    {
        let link = Arc::clone(&self.link);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = link.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut guard)
        });
        match timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SessionError::ResourceUnavailable(format!(
                "{what} task failed: {join}"
            ))),
            Err(_) => Err(SessionError::ResourceUnavailable(format!(
                "{what} timed out after {} ms",
                limit.as_millis()
            ))),
        }
    }

    fn open_link(config: &So100RobotConfig) -> Result<Link, SessionError> {
        let transport = SerialTransport::open(&config.port, config.baud_rate, config.io_timeout)
            .map_err(|e| {
                SessionError::ResourceUnavailable(format!("cannot open {}: {e}", config.port))
            })?;
        let mut bus = ServoBus::new(transport);
        for (name, id) in &config.motors {
            bus.ping(*id).map_err(|e| {
                SessionError::ResourceUnavailable(format!("servo {id} ({name}) not responding: {e}"))
            })?;
        }
        for (_, id) in &config.motors {
            bus.set_torque(*id, true).map_err(bus_error)?;
        }

        let mut camera: Box<dyn Camera> = Box::new(V4lCamera::new(
            "main",
            config.camera_index,
            config.width,
            config.height,
        ));
        camera.open()?;
        Ok(Link { bus, camera })
    }
}

impl Default for So100Robot {
    fn default() -> Self {
        Self::new(So100RobotConfig::default())
    }
}

#[async_trait]
impl RobotSession for So100Robot {
    fn kind(&self) -> &'static str {
        "so100"
    }

    fn joint_names(&self) -> Vec<String> {
        self.config.motors.iter().map(|(name, _)| name.clone()).collect()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }
        let config = self.config.clone();
        self.with_link("connect", self.config.connect_timeout, move |slot| {
            if slot.is_none() {
                *slot = Some(Self::open_link(&config)?);
            }
            Ok(())
        })
        .await?;
        self.connected.store(true, Ordering::Release);
        info!(port = %self.config.port, camera = self.config.camera_index, "SO100 connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let motors = self.config.motors.clone();
        let released = self
            .with_link("disconnect", self.config.io_timeout, move |slot| {
                if let Some(mut link) = slot.take() {
                    for (name, id) in &motors {
                        if let Err(e) = link.bus.set_torque(*id, false) {
                            warn!(joint = %name, error = %e, "failed to release torque");
                        }
                    }
                    link.camera.close();
                }
                Ok(())
            })
            .await;
        match released {
            Ok(()) => info!("SO100 disconnected"),
            Err(e) => warn!(error = %e, "SO100 disconnect incomplete"),
        }
    }

    async fn get_observation(&self) -> Result<Observation, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let motors = self.config.motors.clone();
        self.with_link("get_observation", self.config.io_timeout, move |slot| {
            let link = slot.as_mut().ok_or(SessionError::NotConnected)?;
            let image = link.camera.capture()?.into_image()?;
            let mut joints = JointMap::new();
            for (name, id) in &motors {
                let raw = link.bus.read_position(*id).map_err(bus_error)?;
                joints.insert(name.clone(), feetech::steps_to_degrees(raw));
            }
            Ok(Observation::new(image, joints))
        })
        .await
    }

    async fn send_joint_targets(&self, targets: &JointTargets) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let names = self.joint_names();
        let (accepted, unknown) = targets.partition_known(&names);
        if !unknown.is_empty() {
            warn!(joints = ?unknown, "SO100 ignoring targets for unknown joints");
        }
        let goals: Vec<(u8, u16)> = self
            .config
            .motors
            .iter()
            .filter_map(|(name, id)| {
                accepted
                    .get(name)
                    .map(|deg| (*id, feetech::degrees_to_steps(deg)))
            })
            .collect();
        if goals.is_empty() {
            return Ok(());
        }
        debug!(?goals, "SO100 sync write");
        self.with_link("send_joint_targets", self.config.io_timeout, move |slot| {
            let link = slot.as_mut().ok_or(SessionError::NotConnected)?;
            link.bus.sync_write_positions(&goals).map_err(bus_error)
        })
        .await
    }
}
