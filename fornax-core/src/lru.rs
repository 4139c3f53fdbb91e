// SPDX-License-Identifier: Apache-2.0

//! Ordered set of paused handlers, oldest pause first.
//!
//! A handler is in the LRU exactly while its state is Paused; the handler's
//! own transition sites add and remove it. The evictor pops from the front
//! under memory pressure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::handler::Handler;

pub struct HandlerLru {
    /// Zero means no bound by count; eviction is then driven purely by the
    /// memory watcher.
    capacity: usize,
    inner: Mutex<VecDeque<Arc<Handler>>>,
}

impl HandlerLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Record `handler` as freshly paused. Idempotent: re-adding moves the
    /// handler to the back of the order.
    pub fn add(&self, handler: Arc<Handler>) {
        let overflow: Vec<Arc<Handler>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.retain(|h| h.name() != handler.name());
            inner.push_back(handler);
            if self.capacity > 0 && inner.len() > self.capacity {
                let excess = inner.len() - self.capacity;
                inner.drain(..excess).collect()
            } else {
                Vec::new()
            }
        };

        if !overflow.is_empty() {
            // the caller holds a handler mutex; stopping victims inline
            // could take a second handler mutex
            thread::spawn(move || {
                for handler in overflow {
                    handler.stop_if_paused();
                }
            });
        }
    }

    /// Remove `handler` from the order. Idempotent.
    pub fn remove(&self, handler: &Handler) {
        self.inner
            .lock()
            .unwrap()
            .retain(|h| h.name() != handler.name());
    }

    /// Stop the oldest `n` paused handlers. Handlers that left Paused since
    /// being queued are skipped by `stop_if_paused` itself.
    pub fn evict(&self, n: usize) {
        let victims: Vec<Arc<Handler>> = {
            let mut inner = self.inner.lock().unwrap();
            let n = n.min(inner.len());
            inner.drain(..n).collect()
        };

        for handler in victims {
            tracing::info!(handler = %handler.name(), "evicting paused handler");
            handler.stop_if_paused();
        }
    }

    pub fn contains(&self, handler: &Handler) -> bool {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .any(|h| h.name() == handler.name())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
