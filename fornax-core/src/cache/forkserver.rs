//! Fork-server nodes of the import cache tree.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{CacheError, SandboxError};
use crate::sandbox::Sandbox;
use crate::types::PackageName;

use super::fork::{self, ForkRequest};

/// Sentinel interpreter pid for the root fork server; it is started by the
/// cache factory rather than forked from a parent.
pub(crate) const ROOT_PID: &str = "-1";

#[derive(Debug, Default)]
pub(crate) struct ForkServerState {
    pub(crate) hits: u64,
    pub(crate) children: u32,
    pub(crate) dead: bool,
}

/// A paused interpreter prepared to fork children that share its
/// pre-imported packages.
///
/// Nodes are owned by the CacheManager in an append-only list; the parent
/// link is an index into that list (None iff root). The package set of every
/// node is a superset of its parent's.
pub struct ForkServer {
    seq: u64,
    parent: Option<usize>,
    pid: String,
    sock_path: PathBuf,
    packages: HashSet<PackageName>,
    size: f64,
    sandbox: Box<dyn Sandbox>,
    state: Mutex<ForkServerState>,
}

impl ForkServer {
    pub(crate) fn new(
        seq: u64,
        parent: Option<usize>,
        pid: String,
        sock_path: PathBuf,
        sandbox: Box<dyn Sandbox>,
        packages: HashSet<PackageName>,
        size: f64,
    ) -> Self {
        Self {
            seq,
            parent,
            pid,
            sock_path,
            packages,
            size,
            sandbox,
            state: Mutex::new(ForkServerState::default()),
        }
    }

    /// Creation sequence number; doubles as the node's index in the tree.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Index of the parent node; None iff this is the root.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Pid of the interpreter process ("-1" for the root).
    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    /// Packages this interpreter has already imported.
    pub fn packages(&self) -> &HashSet<PackageName> {
        &self.packages
    }

    /// Estimated RSS cost; the root carries a 1.0 sentinel.
    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn hits(&self) -> u64 {
        self.state.lock().unwrap().hits
    }

    pub fn children(&self) -> u32 {
        self.state.lock().unwrap().children
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().unwrap().dead
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ForkServerState> {
        self.state.lock().unwrap()
    }

    /// Count a hit and issue a fork request while holding this node's
    /// mutex: the interpreter cannot serve concurrent fork requests.
    pub(crate) fn fork_child(&self, request: &ForkRequest) -> Result<String, CacheError> {
        let mut state = self.state.lock().unwrap();
        state.hits += 1;
        fork::fork_request(&self.sock_path, request)
    }

    /// Terminate the sandbox and mark the node dead. Idempotent.
    ///
    /// The no-kill-while-children-exist rule is enforced by the eviction
    /// path; worker Cleanup kills interior nodes deliberately.
    pub(crate) fn kill(&self) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return Ok(());
        }
        self.sandbox.kill()?;
        state.dead = true;
        tracing::debug!(node = self.seq, pid = %self.pid, "fork server killed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn record_hit(&self) {
        self.state.lock().unwrap().hits += 1;
    }
}
