//! Fornax Worker Core
//!
//! Core library for the Fornax serverless worker. Implements the two
//! subsystems that amortize sandbox startup across requests: the handler
//! lifecycle manager, which keeps sandboxes paused between invocations and
//! rehydrates them on demand, and the import cache, a tree of pre-warmed
//! interpreter fork servers injected into fresh sandboxes with a
//! namespace-entering fork.

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod lru;
pub mod runtime;
pub mod sandbox;
pub mod state;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use cache::{CacheManager, CachePressure, Evictor, ForkRequest, PackageSizes, SubsetMatcher};
pub use config::{Config, ConfigLoader};
pub use error::{CacheError, RuntimeError, SandboxError, WorkerError, WorkerResult};
pub use handler::{Handler, HandlerSet};
pub use lru::HandlerLru;
pub use runtime::{ContainerRuntime, ContainerStatus};
pub use sandbox::{CacheFactory, Sandbox};
pub use state::{HandlerState, HandlerStateMachine};
pub use types::{HandlerName, PackageName};
pub use worker::Worker;
