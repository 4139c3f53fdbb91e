//! Sandbox and cache-factory interfaces.
//!
//! A sandbox is an OS-level isolation unit (own root filesystem, namespaces,
//! cgroup). The import cache provisions scratch sandboxes through the
//! factory and injects interpreter children into invocation sandboxes it is
//! handed; both sides are consumed through these traits.

use std::path::{Path, PathBuf};

use crate::error::SandboxError;

pub trait Sandbox: Send + Sync {
    /// Init pid of the sandbox, as a string suitable for the fork protocol.
    fn ns_pid(&self) -> String;

    /// Root filesystem path a forked child chroots into.
    fn root_dir(&self) -> &Path;

    /// Host-side directory holding the sandbox's control files
    /// (readiness pipe, fork-server socket).
    fn host_dir(&self) -> &Path;

    /// Memory accounting file of the sandbox's cgroup.
    fn memory_cgroup_path(&self) -> PathBuf;

    /// Move `pid` into the sandbox's cgroup.
    fn cgroup_enter(&self, pid: &str) -> Result<(), SandboxError>;

    fn kill(&self) -> Result<(), SandboxError>;
}

/// Provisioner for cache sandboxes.
pub trait CacheFactory: Send + Sync {
    fn create(&self, argv: &[String]) -> Result<Box<dyn Sandbox>, SandboxError>;

    /// Tear down factory-owned resources. Idempotent.
    fn cleanup(&self);
}
