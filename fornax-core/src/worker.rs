// SPDX-License-Identifier: Apache-2.0

//! Process-wide worker state with explicit init and cleanup.
//!
//! The handler registry, LRU, cache manager and evictor are long-lived
//! singletons of the worker process, wired here from loaded configuration
//! and passed around as dependencies rather than ambient globals.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::cache::{CacheManager, CachePressure, Evictor, PackageSizes};
use crate::config::Config;
use crate::error::WorkerResult;
use crate::handler::HandlerSet;
use crate::lru::HandlerLru;
use crate::runtime::ContainerRuntime;
use crate::sandbox::CacheFactory;

pub struct Worker {
    handlers: Arc<HandlerSet>,
    cache: Option<Arc<CacheManager>>,
    evictor: Option<Arc<Evictor>>,
    evictor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Bring up the handler registry and, unless disabled by configuration,
    /// the import cache and its memory watcher.
    pub fn init(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        factory: Box<dyn CacheFactory>,
    ) -> WorkerResult<Self> {
        let lru = Arc::new(HandlerLru::new(config.handler_lru_capacity));
        let handlers = Arc::new(HandlerSet::new(runtime, Arc::clone(&lru)));

        if config.import_cache_mb == 0 {
            tracing::info!(cluster = %config.cluster_name, "import cache disabled");
            return Ok(Self {
                handlers,
                cache: None,
                evictor: None,
                evictor_handle: Mutex::new(None),
            });
        }

        let sizes = PackageSizes::load(&config.package_sizes_path)?;
        let (cache, mem_cgroup_path) = CacheManager::new(sizes, factory)?;

        let budget_bytes = config.import_cache_mb * 1024 * 1024;
        let pressure: Arc<dyn CachePressure> = cache.clone();
        let evictor = Evictor::new(mem_cgroup_path, budget_bytes, pressure, lru);
        let handle = evictor.spawn();

        tracing::info!(
            cluster = %config.cluster_name,
            budget_mb = config.import_cache_mb,
            "worker initialized"
        );

        Ok(Self {
            handlers,
            cache: Some(cache),
            evictor: Some(evictor),
            evictor_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn handlers(&self) -> &Arc<HandlerSet> {
        &self.handlers
    }

    /// None when the import cache is disabled by configuration.
    pub fn cache(&self) -> Option<&Arc<CacheManager>> {
        self.cache.as_ref()
    }

    /// Stop the memory watcher and kill every fork server. Idempotent;
    /// in-flight invocations may fail with runtime errors but the registry
    /// stays intact.
    pub fn cleanup(&self) {
        if let Some(evictor) = &self.evictor {
            evictor.stop();
            if let Some(handle) = self.evictor_handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        if let Some(cache) = &self.cache {
            cache.cleanup();
        }
    }
}
