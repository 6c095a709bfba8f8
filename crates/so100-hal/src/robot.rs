//! The [`RobotSession`] contract shared by every backend.
//!
//! Callers never branch on which backend is active. Both variants:
//!
//! * treat `connect`/`disconnect` as idempotent,
//! * fail with [`SessionError::NotConnected`] when used unconnected,
//! * ignore (and log) targets for joints they do not know.

use async_trait::async_trait;
use so100_types::{JointTargets, Observation, SessionError};

#[async_trait]
pub trait RobotSession: Send + Sync {
    /// Short backend label for logs, e.g. `"mock"`.
    fn kind(&self) -> &'static str;

    /// Names of the joints this backend reports and accepts.
    fn joint_names(&self) -> Vec<String>;

    fn is_connected(&self) -> bool;

    /// Acquire the backing device. No-op when already connected.
    ///
    /// # Errors
    ///
    /// [`SessionError::ResourceUnavailable`] if the device cannot be opened.
    async fn connect(&self) -> Result<(), SessionError>;

    /// Release the backing device. Best-effort; failures are logged.
    async fn disconnect(&self);

    /// Sample the current image and joint positions.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] before `connect()`;
    /// [`SessionError::ResourceUnavailable`] if the device fails.
    async fn get_observation(&self) -> Result<Observation, SessionError>;

    /// Command joint positions. Unknown joint names are skipped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] before `connect()`;
    /// [`SessionError::ResourceUnavailable`] if the device fails.
    async fn send_joint_targets(&self, targets: &JointTargets) -> Result<(), SessionError>;
}
