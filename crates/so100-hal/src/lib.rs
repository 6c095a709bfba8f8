//! `so100-hal` – the robot resource behind a single contract.
//!
//! The rest of the workspace only ever talks to [`RobotSession`]; whether the
//! session is backed by the synthetic [`MockRobot`] or the physical
//! [`So100Robot`] is decided once, at construction time.
//!
//! # Modules
//!
//! - [`robot`] – the [`RobotSession`] trait.
//! - [`mock`] – [`MockRobot`]: in-memory joints plus a synthetic scene that
//!   reveals objects as it is sampled.
//! - [`so100`] – [`So100Robot`]: Feetech servo bus + camera device, every
//!   blocking call wrapped in a per-call timeout.
//! - [`camera`] – the [`Camera`] driver trait and the raw V4L reader.
//! - [`feetech`] – Feetech protocol-0 packet codec and [`ServoBus`].
//! - [`transport`] – byte [`Transport`] abstraction over `serialport`.

pub mod camera;
pub mod feetech;
pub mod mock;
pub mod robot;
pub mod so100;
pub mod transport;

pub use camera::{Camera, CameraFrame, V4lCamera};
pub use feetech::ServoBus;
pub use mock::{MockRobot, MockRobotConfig};
pub use robot::RobotSession;
pub use so100::{So100Robot, So100RobotConfig};
pub use transport::{SerialTransport, Transport, TransportError};
