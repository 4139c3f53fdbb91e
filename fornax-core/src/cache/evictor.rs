// SPDX-License-Identifier: Apache-2.0

//! Background cgroup-memory watcher pruning the cache and paused handlers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::lru::HandlerLru;

use super::CachePressure;

/// Polling cadence for the cgroup memory accounting file.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Evictor {
    usage_path: PathBuf,
    budget_bytes: u64,
    cache: Arc<dyn CachePressure>,
    lru: Arc<HandlerLru>,
    stop: AtomicBool,
}

impl Evictor {
    pub fn new(
        usage_path: impl Into<PathBuf>,
        budget_bytes: u64,
        cache: Arc<dyn CachePressure>,
        lru: Arc<HandlerLru>,
    ) -> Arc<Self> {
        Arc::new(Self {
            usage_path: usage_path.into(),
            budget_bytes,
            cache,
            lru,
            stop: AtomicBool::new(false),
        })
    }

    /// One poll of the accounting file. Read errors are logged and retried
    /// on the next tick.
    pub fn check_usage(&self) {
        let usage = match std::fs::read_to_string(&self.usage_path) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(usage) => usage,
                Err(err) => {
                    tracing::warn!(
                        path = %self.usage_path.display(),
                        error = %err,
                        "unparsable cgroup memory usage"
                    );
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(
                    path = %self.usage_path.display(),
                    error = %err,
                    "could not read cgroup memory usage"
                );
                return;
            }
        };

        if usage <= self.budget_bytes {
            self.cache.set_full(false);
            return;
        }

        tracing::debug!(usage, budget = self.budget_bytes, "cache memory over budget");

        if !self.cache.reclaim_one() {
            // nothing left to prune below the root
            self.cache.set_full(true);
        }
        self.lru.evict(1);
    }

    /// Run the watcher on its own thread until `stop()`.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let evictor = Arc::clone(self);
        thread::spawn(move || {
            while !evictor.stop.load(Ordering::SeqCst) {
                thread::sleep(POLL_INTERVAL);
                evictor.check_usage();
            }
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
