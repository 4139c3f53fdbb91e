// SPDX-License-Identifier: Apache-2.0

//! Import cache: a tree of pre-warmed interpreter fork servers.
//!
//! Each node holds a growing superset of preloaded packages. A new
//! invocation is matched to the best node; missing packages grow the tree
//! with one fork from the nearest ancestor, which is always cheaper than
//! re-importing from empty. Children are injected into invocation sandboxes
//! with a namespace-entering fork.

mod evictor;
mod fork;
mod forkserver;
mod matcher;
mod sizes;

pub use evictor::Evictor;
pub use fork::{ForkRequest, ForkResponse};
pub use forkserver::ForkServer;
pub use matcher::{Match, SubsetMatcher};
pub use sizes::PackageSizes;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::sandbox::{CacheFactory, Sandbox};
use crate::types::PackageName;

use fork::ReadyPipe;

/// How long a freshly provisioned sandbox may take to signal readiness.
const ENTRY_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// The capability the evictor needs from the cache.
///
/// Narrower than the CacheManager so test doubles can drive eviction
/// deterministically.
pub trait CachePressure: Send + Sync {
    /// Kill the least valuable childless node. Returns false when nothing
    /// is reclaimable.
    fn reclaim_one(&self) -> bool;

    /// Record whether the cache is saturated.
    fn set_full(&self, full: bool);
}

struct CacheTree {
    /// Append-only; insertion order is creation order, and parent links are
    /// indices into this list.
    servers: Vec<Arc<ForkServer>>,
    seq: u64,
}

/// Tree-of-fork-servers provisioning and coordination.
pub struct CacheManager {
    factory: Box<dyn CacheFactory>,
    sizes: PackageSizes,
    matcher: SubsetMatcher,
    tree: Mutex<CacheTree>,
    full: AtomicBool,
    cleaned: AtomicBool,
}

impl CacheManager {
    /// Start the cache: create the root sandbox, wait for its fork server
    /// to come up, and install the root node. Returns the manager plus the
    /// root sandbox's memory-cgroup accounting path for the evictor.
    pub fn new(
        sizes: PackageSizes,
        factory: Box<dyn CacheFactory>,
    ) -> Result<(Arc<Self>, PathBuf), CacheError> {
        let root_sandbox = factory.create(&[String::from("/init")])?;
        let mem_cgroup_path = root_sandbox.memory_cgroup_path();

        let pipe = match ReadyPipe::open(&root_sandbox.host_dir().join("pipe")) {
            Ok(pipe) => pipe,
            Err(err) => {
                let _ = root_sandbox.kill();
                return Err(err);
            }
        };
        if let Err(err) = pipe.wait(ENTRY_INIT_TIMEOUT) {
            let _ = root_sandbox.kill();
            return Err(err);
        }

        let sock_path = root_sandbox.host_dir().join("fs.sock");
        // size 1.0: eviction scoring divides by size
        let root = ForkServer::new(
            0,
            None,
            forkserver::ROOT_PID.to_string(),
            sock_path,
            root_sandbox,
            HashSet::new(),
            1.0,
        );

        tracing::info!("import cache root fork server ready");

        let manager = Arc::new(Self {
            factory,
            sizes,
            matcher: SubsetMatcher,
            tree: Mutex::new(CacheTree {
                servers: vec![Arc::new(root)],
                seq: 1,
            }),
            full: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        });

        Ok((manager, mem_cgroup_path))
    }

    /// Yield a fork server whose child has been injected into `target`, and
    /// whether the request was a full cache hit.
    pub fn provision(
        &self,
        target: &dyn Sandbox,
        handler_dir: &Path,
        packages: &[PackageName],
    ) -> Result<(Arc<ForkServer>, bool), CacheError> {
        let (node, hit) = {
            let mut tree = self.tree.lock().unwrap();
            let matched = self
                .matcher
                .best_match(&tree.servers, packages)
                .ok_or(CacheError::NoServers)?;

            if matched.hit {
                (matched.server, true)
            } else {
                let base = matched.server;
                let seq = tree.seq;
                let node = {
                    // serialize forks through the same parent interpreter
                    let mut base_state = base.lock_state();
                    let node = Arc::new(self.new_cache_entry(
                        matched.index,
                        &base,
                        &matched.to_cache,
                        seq,
                    )?);
                    base_state.children += 1;
                    node
                };
                tree.servers.push(Arc::clone(&node));
                tree.seq += 1;
                (node, false)
            }
        };

        tracing::debug!(
            handler_dir = %handler_dir.display(),
            node = node.seq(),
            hit,
            "provisioning lambda server"
        );

        let pid = node.fork_child(&ForkRequest {
            ns_pid: target.ns_pid(),
            root_dir: target.root_dir().to_path_buf(),
            packages: Vec::new(),
            new_root: true,
        })?;

        // outside the node mutex; only the target sandbox is involved
        target.cgroup_enter(&pid)?;

        Ok((node, hit))
    }

    /// Fork a new cache entry from `base`. Called with the tree mutex and
    /// `base`'s own mutex held; on any failure the scratch sandbox is
    /// killed and the tree is left unchanged.
    fn new_cache_entry(
        &self,
        base_index: usize,
        base: &ForkServer,
        to_cache: &[PackageName],
        seq: u64,
    ) -> Result<ForkServer, CacheError> {
        let mut packages = base.packages().clone();
        let mut size = 0.0;
        for package in to_cache {
            size += self.sizes.get(package);
            packages.insert(package.clone());
        }

        let scratch = self.factory.create(&[String::from("/init")])?;

        // the pipe must be open before the child can write to it
        let pipe = match ReadyPipe::open(&scratch.host_dir().join("pipe")) {
            Ok(pipe) => pipe,
            Err(err) => {
                let _ = scratch.kill();
                return Err(err);
            }
        };

        let start = Instant::now();
        let pid = match fork::fork_request(
            base.sock_path(),
            &ForkRequest {
                ns_pid: scratch.ns_pid(),
                root_dir: scratch.root_dir().to_path_buf(),
                packages: to_cache.to_vec(),
                new_root: false,
            },
        ) {
            Ok(pid) => pid,
            Err(err) => {
                let _ = scratch.kill();
                return Err(err);
            }
        };

        if let Err(err) = pipe.wait(ENTRY_INIT_TIMEOUT) {
            let _ = scratch.kill();
            return Err(err);
        }

        tracing::info!(
            parent = base.seq(),
            packages = to_cache.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "new cache entry ready"
        );

        let sock_path = scratch.host_dir().join("fs.sock");
        Ok(ForkServer::new(
            seq,
            Some(base_index),
            pid,
            sock_path,
            scratch,
            packages,
            // floor matches the root's sentinel; eviction divides by size
            size.max(1.0),
        ))
    }

    /// Whether the evictor has flagged the cache as saturated; callers may
    /// shed load.
    pub fn full(&self) -> bool {
        self.full.load(Ordering::SeqCst)
    }

    /// Snapshot of the server list in creation order.
    pub fn servers(&self) -> Vec<Arc<ForkServer>> {
        self.tree.lock().unwrap().servers.clone()
    }

    /// Kill every fork server in creation order and tear down the factory.
    /// Idempotent.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        let servers = self.tree.lock().unwrap().servers.clone();
        for server in servers {
            if let Err(err) = server.kill() {
                tracing::warn!(
                    node = server.seq(),
                    error = %err,
                    "failed to kill fork server during cleanup"
                );
            }
        }
        self.factory.cleanup();
        tracing::info!("import cache cleaned up");
    }
}

impl CachePressure for CacheManager {
    fn reclaim_one(&self) -> bool {
        let tree = self.tree.lock().unwrap();

        // lowest hits/size leaf loses; the root is never reclaimed
        let mut victim: Option<(usize, f64)> = None;
        for (index, server) in tree.servers.iter().enumerate() {
            if server.parent().is_none() {
                continue;
            }
            let state = server.lock_state();
            if state.dead || state.children > 0 {
                continue;
            }
            let score = state.hits as f64 / server.size();
            if victim.map_or(true, |(_, best)| score < best) {
                victim = Some((index, score));
            }
        }

        let Some((index, score)) = victim else {
            return false;
        };

        let server = Arc::clone(&tree.servers[index]);
        match server.kill() {
            Ok(()) => {
                if let Some(parent) = server.parent() {
                    tree.servers[parent].lock_state().children -= 1;
                }
                tracing::info!(
                    node = server.seq(),
                    score,
                    "reclaimed cache entry under memory pressure"
                );
            }
            Err(err) => {
                // retried on the next tick
                tracing::warn!(node = server.seq(), error = %err, "failed to kill cache entry");
            }
        }
        true
    }

    fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }
}
