//! Container runtime driver interface.
//!
//! The worker core consumes the runtime (image pull, container lifecycle,
//! cgroup plumbing) through this trait; the concrete driver lives outside
//! the crate, and tests substitute doubles.

use crate::error::RuntimeError;

/// Observed container state, as reported by the runtime's inspect call.
///
/// A paused container is still "running" from the runtime's point of view,
/// so `paused` is only meaningful when `running` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub paused: bool,
}

/// Operations the handler lifecycle needs from the container runtime.
pub trait ContainerRuntime: Send + Sync {
    fn image_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    fn pull(&self, name: &str) -> Result<(), RuntimeError>;

    fn container_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Create a container for `name`, returning the runtime's container id.
    fn create(&self, name: &str, argv: &[String]) -> Result<String, RuntimeError>;

    fn inspect(&self, name: &str) -> Result<ContainerStatus, RuntimeError>;

    fn restart(&self, name: &str) -> Result<(), RuntimeError>;

    fn pause(&self, name: &str) -> Result<(), RuntimeError>;

    fn unpause(&self, name: &str) -> Result<(), RuntimeError>;

    fn kill(&self, name: &str) -> Result<(), RuntimeError>;

    /// Port on which the handler's lambda server listens.
    fn lambda_port(&self, name: &str) -> Result<String, RuntimeError>;
}
