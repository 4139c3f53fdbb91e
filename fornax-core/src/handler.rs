//! Handler entries and the handler registry.
//!
//! A Handler owns the per-sandbox state machine and in-flight counter; the
//! HandlerSet maps handler names to entries. Registry access and handler
//! state transitions are guarded by separate locks so the registry never
//! serializes unrelated invocations.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::error::WorkerResult;
use crate::lru::HandlerLru;
use crate::runtime::ContainerRuntime;
use crate::state::{HandlerState, HandlerStateMachine};
use crate::types::HandlerName;

struct HandlerInner {
    machine: HandlerStateMachine,
    in_flight: u32,
}

/// A named, deployable user function backed by a sandbox.
///
/// Never removed from the registry; the underlying sandbox may be killed and
/// recreated across the handler's lifetime.
pub struct Handler {
    name: HandlerName,
    runtime: Arc<dyn ContainerRuntime>,
    lru: Arc<HandlerLru>,
    inner: Mutex<HandlerInner>,
}

impl Handler {
    fn new(
        name: HandlerName,
        runtime: Arc<dyn ContainerRuntime>,
        lru: Arc<HandlerLru>,
    ) -> Arc<Self> {
        let machine = HandlerStateMachine::new(name.clone());
        Arc::new(Self {
            name,
            runtime,
            lru,
            inner: Mutex::new(HandlerInner {
                machine,
                in_flight: 0,
            }),
        })
    }

    pub fn name(&self) -> &HandlerName {
        &self.name
    }

    pub fn state(&self) -> HandlerState {
        self.inner.lock().unwrap().machine.state()
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.lock().unwrap().in_flight
    }

    /// Begin an invocation: make sure the sandbox is live, bump the
    /// in-flight count, and return the lambda server's port.
    pub fn run_start(self: &Arc<Self>) -> WorkerResult<String> {
        let mut inner = self.inner.lock().unwrap();

        self.maybe_init(&mut inner)?;

        // the first in-flight request revives the sandbox
        if inner.in_flight == 0 {
            if inner.machine.state() == HandlerState::Stopped {
                self.runtime.restart(self.name.as_str())?;
                inner.machine.transition_to(HandlerState::Running)?;
            } else if inner.machine.state() == HandlerState::Paused {
                self.runtime.unpause(self.name.as_str())?;
                inner.machine.transition_to(HandlerState::Running)?;
            }
            self.lru.remove(self);
        }

        inner.in_flight += 1;

        match self.runtime.lambda_port(self.name.as_str()) {
            Ok(port) => Ok(port),
            Err(err) => {
                // a failed invocation must not pin the in-flight count
                inner.in_flight -= 1;
                Err(err.into())
            }
        }
    }

    /// End an invocation. The last in-flight request pauses the sandbox and
    /// parks the handler in the LRU.
    pub fn run_finish(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();

        if inner.in_flight == 0 {
            tracing::warn!(handler = %self.name, "run_finish without matching run_start");
            return;
        }
        inner.in_flight -= 1;

        if inner.in_flight == 0 {
            if let Err(err) = self.runtime.pause(self.name.as_str()) {
                // the handler keeps running, and consuming resources, until
                // the next run_start or eviction
                tracing::warn!(handler = %self.name, error = %err, "could not pause handler");
                return;
            }
            match inner.machine.transition_to(HandlerState::Paused) {
                Ok(()) => self.lru.add(Arc::clone(self)),
                Err(err) => {
                    tracing::warn!(handler = %self.name, error = %err, "pause transition rejected")
                }
            }
        }
    }

    /// Stop a paused sandbox (evictor path). No-op unless the handler is
    /// Paused at the time the lock is taken.
    pub fn stop_if_paused(&self) {
        let mut inner = self.inner.lock().unwrap();

        if inner.machine.state() != HandlerState::Paused {
            return;
        }

        // the runtime cannot kill a frozen container directly
        if let Err(err) = self.runtime.unpause(self.name.as_str()) {
            tracing::warn!(handler = %self.name, error = %err, "could not unpause handler to stop it");
            return;
        }
        if let Err(err) = self.runtime.kill(self.name.as_str()) {
            tracing::warn!(
                handler = %self.name,
                error = %err,
                "could not kill handler after unpausing; container leaked"
            );
            return;
        }

        if inner.machine.transition_to(HandlerState::Stopped).is_ok() {
            self.lru.remove(self);
            tracing::info!(handler = %self.name, "stopped paused handler");
        }
    }

    /// First-use probe: make sure the image is pulled and the container
    /// exists, then reconcile our state with what the runtime reports.
    fn maybe_init(&self, inner: &mut HandlerInner) -> WorkerResult<()> {
        if inner.machine.state() != HandlerState::Uninitialized {
            return Ok(());
        }

        let name = self.name.as_str();

        if !self.runtime.image_exists(name)? {
            tracing::info!(handler = %self.name, "pulling handler image");
            self.runtime.pull(name)?;
        }

        if !self.runtime.container_exists(name)? {
            self.runtime.create(name, &[])?;
        }

        let status = self.runtime.inspect(name)?;
        let observed = if status.running {
            if status.paused {
                HandlerState::Paused
            } else {
                HandlerState::Running
            }
        } else {
            HandlerState::Stopped
        };
        inner.machine.transition_to(observed)?;

        Ok(())
    }
}

/// Registry mapping handler name → handler entry.
pub struct HandlerSet {
    handlers: DashMap<HandlerName, Arc<Handler>>,
    runtime: Arc<dyn ContainerRuntime>,
    lru: Arc<HandlerLru>,
}

impl HandlerSet {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, lru: Arc<HandlerLru>) -> Self {
        Self {
            handlers: DashMap::new(),
            runtime,
            lru,
        }
    }

    /// Return the handler for `name`, inserting a fresh Uninitialized entry
    /// if absent. The registry lock is scoped to the map operation.
    pub fn get(&self, name: &HandlerName) -> Arc<Handler> {
        let entry = self.handlers.entry(name.clone()).or_insert_with(|| {
            tracing::debug!(handler = %name, "registering handler");
            Handler::new(
                name.clone(),
                Arc::clone(&self.runtime),
                Arc::clone(&self.lru),
            )
        });
        Arc::clone(entry.value())
    }

    pub fn lru(&self) -> &Arc<HandlerLru> {
        &self.lru
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Names of all registered handlers.
    pub fn handler_names(&self) -> Vec<HandlerName> {
        self.handlers.iter().map(|r| r.key().clone()).collect()
    }
}
